//! Gaussian-conditional operators: turning a GP prior plus a pseudo-
//! likelihood site (in natural-parameter form) into a posterior, and
//! projecting a sparse (inducing-point) posterior back onto the data.
//!
//! Grounded on `newt/basemodels.py`'s `gaussian_conditional` /
//! `sparse_gaussian_conditional` / `sparse_conditional_post_to_data`: the
//! posterior precision is the prior precision plus the site's natural
//! `nat2`, combined the same way the teacher's `KalmanFilterNoControl::step`
//! combines a prediction with an observation, just in one shot instead of
//! sequentially in time.

use crate::error::Error;
use crate::kernel::Kernel;
use crate::linalg;
use nalgebra::{DMatrix, DVector};

/// Dense GP posterior at the training inputs: combine the prior precision
/// `Kff^-1` with the site's natural parameters.
pub fn gaussian_conditional(
    kff: &DMatrix<f64>,
    site_nat1: &DVector<f64>,
    site_nat2: &DMatrix<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
    let prior_precision = linalg::jittered_inverse(kff)?;
    let post_precision = &prior_precision + site_nat2;
    let post_cov = linalg::jittered_inverse(&post_precision)?;
    let post_mean = &post_cov * site_nat1;
    Ok((post_mean, post_cov))
}

/// Sparse GP posterior at the inducing inputs `Z`, identical algebra to
/// `gaussian_conditional` with `Kuu` standing in for `Kff`.
pub fn sparse_gaussian_conditional(
    kuu: &DMatrix<f64>,
    site_nat1: &DVector<f64>,
    site_nat2: &DMatrix<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
    gaussian_conditional(kuu, site_nat1, site_nat2)
}

/// Project a sparse posterior at `Z` onto the data `X` via
/// `Wuf = Kuu^-1 Kuf`: `mean_f = Wuf^T mean_u`,
/// `var_f = diag(Kff) - diag(Kfu Kuu^-1 Kuf) + diag(Wuf^T cov_u Wuf)`.
pub fn sparse_conditional_post_to_data(
    kff_diag: &DVector<f64>,
    kfu: &DMatrix<f64>,
    kuu: &DMatrix<f64>,
    mean_u: &DVector<f64>,
    cov_u: &DMatrix<f64>,
) -> Result<(DVector<f64>, DVector<f64>), Error> {
    let kuu_inv = linalg::jittered_inverse(kuu)?;
    let wuf = &kuu_inv * kfu.transpose(); // M x N
    let mean_f = wuf.transpose() * mean_u;

    let n = kfu.nrows();
    let mut var_f = DVector::zeros(n);
    for i in 0..n {
        let kfu_i = kfu.row(i).transpose();
        let prior_reduction = (kfu_i.transpose() * &kuu_inv * &kfu_i)[(0, 0)];
        let wuf_i = wuf.column(i);
        let post_inflation = (wuf_i.transpose() * cov_u * wuf_i)[(0, 0)];
        var_f[i] = kff_diag[i] - prior_reduction + post_inflation;
    }
    Ok((mean_f, var_f))
}

/// Convenience wrapper building `Kfu`, `Kuu` and `diag(Kff)` from a kernel.
pub fn compute_conditional_statistics(
    kernel: &dyn Kernel,
    x: &DMatrix<f64>,
    z: &DMatrix<f64>,
) -> (DMatrix<f64>, DMatrix<f64>, DVector<f64>) {
    let kfu = kernel.k(x, z);
    let kuu = kernel.k(z, z);
    let kff_diag = DVector::from_iterator(
        x.nrows(),
        (0..x.nrows()).map(|i| {
            let xi = DMatrix::from_row_slice(1, x.ncols(), x.row(i).clone_owned().as_slice());
            kernel.k(&xi, &xi)[(0, 0)]
        }),
    );
    (kfu, kuu, kff_diag)
}

/// Stitch the paired-state filter/smoother output (one joint `(x_k, x_{k+1})`
/// marginal per transition, each of dimension `2S`) back into a sequence of
/// `N+1` single-state marginals over the inducing grid. Transition `k`
/// supplies `x_{k+1}`; transition `0` additionally supplies `x_0`.
pub fn build_joint(
    means_pairs: &[DVector<f64>],
    covs_pairs: &[DMatrix<f64>],
    state_dim: usize,
) -> (Vec<DVector<f64>>, Vec<DMatrix<f64>>) {
    let n = means_pairs.len();
    let mut means = Vec::with_capacity(n + 1);
    let mut covs = Vec::with_capacity(n + 1);

    means.push(means_pairs[0].rows(0, state_dim).clone_owned());
    covs.push(covs_pairs[0].view((0, 0), (state_dim, state_dim)).clone_owned());

    for k in 0..n {
        means.push(means_pairs[k].rows(state_dim, state_dim).clone_owned());
        covs.push(covs_pairs[k].view((state_dim, state_dim), (state_dim, state_dim)).clone_owned());
    }
    (means, covs)
}

/// The projector from a paired-state posterior to each data point's
/// function-space moments, returned by `SparseMarkovGP::conditional_posterior_to_data`
/// and required by the matching `conditional_data_to_posterior` call (distilled
/// spec §4.I / §9's "return the projector explicitly" redesign note): rather
/// than re-deriving which pair and which row of `H` a point's update maps
/// through, the mapping computed on the forward pass is handed back on the
/// reverse one.
#[derive(Debug, Clone)]
pub struct ConditionalProjector {
    /// Per-point `1 x 2S` row projecting a paired-state delta onto the
    /// point's function value (`H` restricted to whichever half of the pair
    /// the point ties to).
    pub h_full: Vec<DMatrix<f64>>,
    /// Which paired-state group (grid interval) each point belongs to.
    pub bin_id: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Matern32;
    use approx::assert_relative_eq;

    #[test]
    fn gaussian_conditional_shrinks_towards_site_mean_as_site_variance_shrinks() {
        let kff = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        let nat1 = DVector::from_vec(vec![10.0, 10.0]);
        let nat2 = DMatrix::identity(2, 2) * 1e4;
        let (mean, _cov) = gaussian_conditional(&kff, &nat1, &nat2).unwrap();
        // with a near-infinitely confident site, posterior mean -> site mean
        assert_relative_eq!(mean[0], 10.0 / 1e4, epsilon = 1e-3);
    }

    #[test]
    fn sparse_projection_reduces_to_identity_when_x_equals_z() {
        let kernel = Matern32::new(1.0, 1.0);
        let z = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
        let (kfu, kuu, kff_diag) = compute_conditional_statistics(&kernel, &z, &z);
        let mean_u = DVector::from_vec(vec![1.0, 2.0]);
        let cov_u = DMatrix::identity(2, 2) * 0.01;
        let (mean_f, _var_f) = sparse_conditional_post_to_data(&kff_diag, &kfu, &kuu, &mean_u, &cov_u).unwrap();
        assert_relative_eq!(mean_f[0], mean_u[0], epsilon = 1e-6);
        assert_relative_eq!(mean_f[1], mean_u[1], epsilon = 1e-6);
    }

    #[test]
    fn build_joint_recovers_shared_midpoint() {
        let state_dim = 2;
        let m0 = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let p0 = DMatrix::identity(4, 4);
        let (means, _covs) = build_joint(&[m0.clone()], &[p0], state_dim);
        assert_eq!(means.len(), 2);
        assert_relative_eq!(means[0][0], 1.0);
        assert_relative_eq!(means[1][0], 3.0);
    }
}
