//! The pseudo-likelihood site store: a dual mean/covariance <-> natural
//! parameter representation of the Gaussian factors standing in for the
//! (possibly non-Gaussian) data likelihood.
//!
//! Grounded on the teacher's `StateAndCovariance` (one stored representation,
//! cheap accessors) generalised to the two mutators the distilled spec
//! requires: `update_mean_cov` and `update_nat_params`, each of which
//! recomputes the other view via a single batched Cholesky solve (see
//! `reparametrise` below, a direct translation of the original's
//! `cho_factor`/`cho_solve` pair).

use crate::error::Error;
use crate::linalg;
use nalgebra::{DMatrix, DVector};

/// One Gaussian pseudo-likelihood site, stored with both views always
/// mutually consistent: `cov * nat1 == mean` and `cov * nat2 == I`.
#[derive(Debug, Clone)]
pub struct Site {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
    nat1: DVector<f64>,
    nat2: DMatrix<f64>,
}

impl Site {
    /// Construct a site from its mean/covariance view.
    pub fn from_mean_cov(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self, Error> {
        let (nat1, nat2) = mean_cov_to_natural(&mean, &cov)?;
        Ok(Site { mean, cov, nat1, nat2 })
    }

    /// Construct a site from its natural-parameter view.
    pub fn from_natural(nat1: DVector<f64>, nat2: DMatrix<f64>) -> Result<Self, Error> {
        let (mean, cov) = natural_to_mean_cov(&nat1, &nat2)?;
        Ok(Site { mean, cov, nat1, nat2 })
    }

    /// A wide, zero-mean site used to initialise the store (distilled spec
    /// §3.2 lifecycle: zero mean, large (~100) diagonal covariance).
    pub fn wide(dim: usize) -> Self {
        let mean = DVector::zeros(dim);
        let cov = DMatrix::identity(dim, dim) * 1e2;
        // Always invertible, never fails.
        Self::from_mean_cov(mean, cov).expect("wide init is always well-conditioned")
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }
    pub fn nat1(&self) -> &DVector<f64> {
        &self.nat1
    }
    pub fn nat2(&self) -> &DMatrix<f64> {
        &self.nat2
    }

    pub fn update_mean_cov(&mut self, mean: DVector<f64>, cov: DMatrix<f64>) -> Result<(), Error> {
        let (nat1, nat2) = mean_cov_to_natural(&mean, &cov)?;
        self.mean = mean;
        self.cov = cov;
        self.nat1 = nat1;
        self.nat2 = nat2;
        Ok(())
    }

    pub fn update_nat_params(&mut self, nat1: DVector<f64>, nat2: DMatrix<f64>) -> Result<(), Error> {
        let (mean, cov) = natural_to_mean_cov(&nat1, &nat2)?;
        self.mean = mean;
        self.cov = cov;
        self.nat1 = nat1;
        self.nat2 = nat2;
        Ok(())
    }
}

pub(crate) fn mean_cov_to_natural(mean: &DVector<f64>, cov: &DMatrix<f64>) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
    let chol = linalg::jittered_cholesky(cov)?;
    let nat1 = chol.solve(mean);
    let nat2 = chol.solve(&DMatrix::identity(cov.nrows(), cov.nrows()));
    Ok((nat1, nat2))
}

pub(crate) fn natural_to_mean_cov(nat1: &DVector<f64>, nat2: &DMatrix<f64>) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
    // nat2 plays the role of cov^-1; invert it to recover cov, then apply to nat1.
    let chol = linalg::jittered_cholesky(nat2)?;
    let cov = chol.inverse();
    let mean = &cov * nat1;
    Ok((mean, cov))
}

/// The full pseudo-likelihood store: one `Site` per data point, inducing
/// point, or transition, depending on the owning model.
#[derive(Debug, Clone)]
pub struct SiteStore {
    sites: Vec<Site>,
}

impl SiteStore {
    pub fn wide(count: usize, dim: usize) -> Self {
        SiteStore {
            sites: (0..count).map(|_| Site::wide(dim)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn get(&self, i: usize) -> &Site {
        &self.sites[i]
    }

    pub fn means(&self) -> Vec<DVector<f64>> {
        self.sites.iter().map(|s| s.mean().clone()).collect()
    }

    pub fn covs(&self) -> Vec<DMatrix<f64>> {
        self.sites.iter().map(|s| s.cov().clone()).collect()
    }

    pub fn nat1s(&self) -> Vec<DVector<f64>> {
        self.sites.iter().map(|s| s.nat1().clone()).collect()
    }

    pub fn nat2s(&self) -> Vec<DMatrix<f64>> {
        self.sites.iter().map(|s| s.nat2().clone()).collect()
    }

    /// Scatter-update a subset of sites by mean/covariance.
    pub fn update_mean_cov(
        &mut self,
        batch_ind: &[usize],
        means: &[DVector<f64>],
        covs: &[DMatrix<f64>],
    ) -> Result<(), Error> {
        for (i, &idx) in batch_ind.iter().enumerate() {
            self.sites[idx].update_mean_cov(means[i].clone(), covs[i].clone())?;
        }
        Ok(())
    }

    /// Scatter-update a subset of sites by natural parameters.
    pub fn update_nat_params(
        &mut self,
        batch_ind: &[usize],
        nat1s: &[DVector<f64>],
        nat2s: &[DMatrix<f64>],
    ) -> Result<(), Error> {
        for (i, &idx) in batch_ind.iter().enumerate() {
            self.sites[idx].update_nat_params(nat1s[i].clone(), nat2s[i].clone())?;
        }
        Ok(())
    }
}

/// `group_natural_params` for unstructured (one site per data point) stores:
/// a plain scatter-update of the selected slices (distilled spec §4.E). Unlike
/// the tied-site grouping in [`crate::cavity::sum_natural_params_by_group`],
/// there is no untouched-residual to reweight here, so no jitter is added —
/// each site's natural parameters already carry their own jitter from the
/// Cholesky solve that produced them. Used by [`crate::model::GP`]'s and
/// [`crate::model::MarkovGP`]'s inherent `group_natural_params` methods.
pub fn group_natural_params_unstructured(
    store: &SiteStore,
    nat1_new: &[DVector<f64>],
    nat2_new: &[DMatrix<f64>],
    batch_ind: &[usize],
) -> (Vec<DVector<f64>>, Vec<DMatrix<f64>>) {
    let mut nat1 = store.nat1s();
    let mut nat2 = store.nat2s();
    linalg::scatter_update(&mut nat1, batch_ind, nat1_new);
    linalg::scatter_update(&mut nat2, batch_ind, nat2_new);
    (nat1, nat2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dual_consistency_after_mean_cov_update() {
        let mut site = Site::wide(2);
        let mean = DVector::from_vec(vec![1.0, -2.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.5]);
        site.update_mean_cov(mean.clone(), cov.clone()).unwrap();

        let recon_mean = site.cov() * site.nat1();
        let recon_eye = site.cov() * site.nat2();
        for i in 0..2 {
            assert_relative_eq!(recon_mean[i], mean[i], epsilon = 1e-6);
        }
        for i in 0..2 {
            for j in 0..2 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(recon_eye[(i, j)], expect, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn dual_consistency_after_nat_param_update() {
        let mut site = Site::wide(2);
        let nat1 = DVector::from_vec(vec![0.5, 1.0]);
        let nat2 = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.1, 1.0]);
        site.update_nat_params(nat1.clone(), nat2.clone()).unwrap();

        let recon_mean = site.cov() * site.nat1();
        for i in 0..2 {
            assert_relative_eq!(recon_mean[i], site.mean()[i], epsilon = 1e-6);
        }
    }
}
