//! Cavity computation and site grouping: the power-EP algebra shared by the
//! EP/PL/VI/Laplace site-update loop, plus the tied-site bookkeeping
//! `SparseMarkovGP` needs when more than one data point shares a site.
//!
//! Grounded on `newt/basemodels.py`'s `cavity_distribution` (site removed at
//! power `alpha`) and `SparseMarkovGP.group_natural_params`
//! (`sum_natural_params_by_group`, residual-weighted re-insertion of a site's
//! previous contribution for data points that did not update this batch).

use crate::error::Error;
use crate::linalg::{self, JITTER};
use nalgebra::{DMatrix, DVector};

/// Remove (a fraction `power` of) a site's contribution from the posterior
/// natural parameters, returning the cavity distribution in mean/covariance
/// form. `power = 1.0` is full EP; smaller values are fractional/power EP.
pub fn cavity_distribution(
    post_nat1: &DVector<f64>,
    post_nat2: &DMatrix<f64>,
    site_nat1: &DVector<f64>,
    site_nat2: &DMatrix<f64>,
    power: f64,
) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
    let cav_nat1 = post_nat1 - site_nat1 * power;
    let cav_nat2 = post_nat2 - site_nat2 * power;
    let chol = linalg::jittered_cholesky(&cav_nat2)?;
    let cav_cov = chol.inverse();
    let cav_mean = &cav_cov * &cav_nat1;
    Ok((cav_mean, cav_cov))
}

/// Cavity for a tied site shared by `num_neighbours` data points: each
/// point removes only its fractional share `power / num_neighbours`.
pub fn cavity_distribution_tied(
    post_nat1: &DVector<f64>,
    post_nat2: &DMatrix<f64>,
    site_nat1: &DVector<f64>,
    site_nat2: &DMatrix<f64>,
    power: f64,
    num_neighbours: usize,
) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
    let fraction = power / num_neighbours.max(1) as f64;
    cavity_distribution(post_nat1, post_nat2, site_nat1, site_nat2, fraction)
}

/// Assign each sorted value in `x` to the half-open grid interval
/// `[z[k], z[k+1])` containing it, returning the interval index `k` for
/// every entry of `x` (distilled spec §4.E `set_z_stats`: nearest-neighbour
/// / interval binning used by `SparseMarkovGP`'s tied sites).
pub fn bin_assignment(x: &[f64], z: &[f64]) -> Vec<usize> {
    x.iter()
        .map(|&xi| {
            let mut k = 0usize;
            while k + 1 < z.len() - 1 && xi >= z[k + 1] {
                k += 1;
            }
            k
        })
        .collect()
}

/// Count how many data points fall into each of `num_groups` bins.
pub fn neighbour_counts(bin_id: &[usize], num_groups: usize) -> Vec<usize> {
    let mut counts = vec![0usize; num_groups];
    for &b in bin_id {
        counts[b] += 1;
    }
    counts
}

/// Sum per-data-point natural-parameter updates into their shared site,
/// re-weighting the site's previous contribution for the points that were
/// *not* part of this update batch (distilled spec §4.E
/// `sum_natural_params_by_group`): a site touched by only `c` of its
/// `num_neighbours` points this round keeps `(1 - c / num_neighbours)` of
/// its old value for the untouched share.
pub fn sum_natural_params_by_group(
    nat1_new: &[DVector<f64>],
    nat2_new: &[DMatrix<f64>],
    bin_id: &[usize],
    num_groups: usize,
    old_nat1: &[DVector<f64>],
    old_nat2: &[DMatrix<f64>],
    num_neighbours: &[usize],
) -> (Vec<DVector<f64>>, Vec<DMatrix<f64>>) {
    let dim = old_nat1[0].nrows();
    let mut sums1 = vec![DVector::<f64>::zeros(dim); num_groups];
    let mut sums2 = vec![DMatrix::<f64>::zeros(dim, dim); num_groups];
    let mut counters = vec![0usize; num_groups];

    for (i, &g) in bin_id.iter().enumerate() {
        sums1[g] += &nat1_new[i];
        sums2[g] += &nat2_new[i];
        counters[g] += 1;
    }

    let mut out1 = Vec::with_capacity(num_groups);
    let mut out2 = Vec::with_capacity(num_groups);
    for g in 0..num_groups {
        let n_g = num_neighbours[g].max(1) as f64;
        let residual_frac = 1.0 - counters[g] as f64 / n_g;
        let nat1 = &sums1[g] + &old_nat1[g] * residual_frac;
        let mut nat2 = &sums2[g] + &old_nat2[g] * residual_frac;
        nat2 = linalg::add_jitter(&nat2, JITTER);
        out1.push(nat1);
        out2.push(nat2);
    }
    (out1, out2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cavity_removes_exactly_the_site_at_power_one() {
        // posterior = prior(nat) + site(nat); cavity at power=1 must recover the prior.
        let prior_nat1 = DVector::from_vec(vec![1.0, 2.0]);
        let prior_nat2 = DMatrix::from_row_slice(2, 2, &[2.0, 0.1, 0.1, 2.0]);
        let site_nat1 = DVector::from_vec(vec![0.5, -0.5]);
        let site_nat2 = DMatrix::from_row_slice(2, 2, &[0.3, 0.0, 0.0, 0.3]);

        let post_nat1 = &prior_nat1 + &site_nat1;
        let post_nat2 = &prior_nat2 + &site_nat2;

        let (cav_mean, cav_cov) = cavity_distribution(&post_nat1, &post_nat2, &site_nat1, &site_nat2, 1.0).unwrap();
        let chol = nalgebra::linalg::Cholesky::new(prior_nat2.clone() + DMatrix::identity(2, 2) * crate::linalg::JITTER).unwrap();
        let expected_cov = chol.inverse();
        let expected_mean = &expected_cov * &prior_nat1;

        for i in 0..2 {
            assert_relative_eq!(cav_mean[i], expected_mean[i], epsilon = 1e-6);
            for j in 0..2 {
                assert_relative_eq!(cav_cov[(i, j)], expected_cov[(i, j)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn cavity_removes_site_then_reinsertion_recovers_posterior() {
        let post_nat1 = DVector::from_vec(vec![1.2, -0.4]);
        let post_nat2 = DMatrix::from_row_slice(2, 2, &[2.0, 0.2, 0.2, 1.5]);
        let site_nat1 = DVector::from_vec(vec![0.3, -0.1]);
        let site_nat2 = DMatrix::from_row_slice(2, 2, &[0.4, 0.0, 0.0, 0.3]);

        let (cav_mean, cav_cov) = cavity_distribution(&post_nat1, &post_nat2, &site_nat1, &site_nat2, 1.0).unwrap();
        let (cav_nat1, cav_nat2) = crate::gaussian::mean_cov_to_natural(&cav_mean, &cav_cov).unwrap();
        let recovered_nat1 = cav_nat1 + &site_nat1;
        let recovered_nat2 = cav_nat2 + &site_nat2;

        for i in 0..2 {
            assert_relative_eq!(recovered_nat1[i], post_nat1[i], epsilon = 1e-6);
            for j in 0..2 {
                assert_relative_eq!(recovered_nat2[(i, j)], post_nat2[(i, j)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn bin_assignment_places_points_in_enclosing_interval() {
        let z = vec![-1e10, 0.0, 1.0, 2.0, 1e10];
        let x = vec![-5.0, 0.2, 1.5, 1.9, 5.0];
        let bins = bin_assignment(&x, &z);
        assert_eq!(bins, vec![0, 1, 2, 2, 3]);
    }

    #[test]
    fn untouched_group_retains_residual_of_old_value() {
        let old_nat1 = vec![DVector::from_vec(vec![1.0])];
        let old_nat2 = vec![DMatrix::from_row_slice(1, 1, &[1.0])];
        let num_neighbours = vec![2usize];
        // no points updating this group this round
        let (nat1, _nat2) = sum_natural_params_by_group(&[], &[], &[], 1, &old_nat1, &old_nat2, &num_neighbours);
        assert_relative_eq!(nat1[0][0], 1.0, epsilon = 1e-9);
    }
}
