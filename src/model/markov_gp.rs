//! State-space (Markov) GP posterior: the pseudo-likelihood sites live
//! directly in function space, one per (sorted, deduplicated) time point,
//! and the posterior is a sequence of state marginals produced by a Kalman
//! filter + RTS smoother rather than one joint `N x N` covariance.
//!
//! Grounded on `newt/basemodels.py`'s `MarkovGP`: `update_posterior` runs
//! `filter` then `smoother`; `predict` augments the time axis with
//! `+-1e10` sentinels and calls `temporal_conditional`; `prior_sample`/
//! `posterior_sample` implement Doucet's identity.

use super::InferenceEngine;
use crate::cavity;
use crate::error::Error;
use crate::gaussian::{self, SiteStore};
use crate::input;
use crate::kalman;
use crate::kernel::Kernel;
use crate::likelihood::Likelihood;
use nalgebra::{DMatrix, DVector};

pub struct MarkovGP {
    kernel: Box<dyn Kernel>,
    x: Vec<f64>,
    dt: Vec<f64>,
    y: Vec<DVector<f64>>,
    mask: Vec<Vec<bool>>,
    sites: SiteStore,
    filtered_mean: Vec<DVector<f64>>,
    filtered_cov: Vec<DMatrix<f64>>,
    smoothed_mean: Vec<DVector<f64>>,
    smoothed_cov: Vec<DMatrix<f64>>,
    gains: Vec<DMatrix<f64>>,
    log_lik: f64,
    parallel: bool,
}

impl MarkovGP {
    pub fn new(kernel: Box<dyn Kernel>, x: Vec<f64>, y: Vec<f64>, parallel: bool) -> Result<Self, Error> {
        if x.len() != y.len() {
            return Err(crate::error::ErrorKind::ShapeMismatch.into());
        }
        let (dt, _row_to_time) = input::input_admin(&x)?;
        let func_dim = kernel.func_dim();
        let y_vec: Vec<DVector<f64>> = y.iter().map(|&v| DVector::from_vec(vec![v])).collect();
        let mask: Vec<Vec<bool>> = y.iter().map(|&v| vec![v.is_nan(); func_dim]).collect();
        let n = x.len();
        let sites = SiteStore::wide(n, func_dim);
        let state_dim = kernel.state_dim();
        Ok(MarkovGP {
            kernel,
            x,
            dt,
            y: y_vec,
            mask,
            sites,
            filtered_mean: vec![DVector::zeros(state_dim); n],
            filtered_cov: vec![DMatrix::identity(state_dim, state_dim); n],
            smoothed_mean: vec![DVector::zeros(state_dim); n],
            smoothed_cov: vec![DMatrix::identity(state_dim, state_dim); n],
            gains: Vec::new(),
            log_lik: 0.0,
            parallel,
        })
    }

    fn posterior_nat_at(&self, i: usize) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
        let h = self.kernel.measurement_model();
        let marginal_mean = &h * &self.smoothed_mean[i];
        let marginal_cov = &h * &self.smoothed_cov[i] * h.transpose();
        gaussian::mean_cov_to_natural(&marginal_mean, &marginal_cov)
    }

    /// Power-EP cavity for a batch of time points (distilled spec §4.E /
    /// SPEC_FULL.md §6 interface item 3): the smoothed marginal at each point
    /// with `power` times its own site contribution removed.
    pub fn cavity_distribution(&self, batch_ind: &[usize], power: f64) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
        let mut means = Vec::with_capacity(batch_ind.len());
        let mut covs = Vec::with_capacity(batch_ind.len());
        for &i in batch_ind {
            let (post_nat1, post_nat2) = self.posterior_nat_at(i)?;
            let site_nat1 = self.sites.get(i).nat1().clone();
            let site_nat2 = self.sites.get(i).nat2().clone();
            let (cav_mean, cav_cov) = cavity::cavity_distribution(&post_nat1, &post_nat2, &site_nat1, &site_nat2, power)?;
            means.push(cav_mean[0]);
            covs.push(cav_cov);
        }
        Ok((DVector::from_vec(means), crate::linalg::block_diag(&covs)))
    }

    /// Reconcile site-update deltas for a batch of time points with the store
    /// (SPEC_FULL.md §4.E/§6 interface item 6): one site per time point, so
    /// this is a plain scatter-update with no grouping residual.
    pub fn group_natural_params(
        &self,
        eta1_new: &[DVector<f64>],
        eta2_new: &[DMatrix<f64>],
        batch_ind: &[usize],
    ) -> (Vec<DVector<f64>>, Vec<DMatrix<f64>>) {
        gaussian::group_natural_params_unstructured(&self.sites, eta1_new, eta2_new, batch_ind)
    }

    pub fn ep_step(&mut self, likelihood: &dyn Likelihood, power: f64) -> Result<(), Error> {
        let active: Vec<usize> = (0..self.x.len()).filter(|&i| !self.mask[i][0]).collect();
        let (cav_mean, cav_cov) = self.cavity_distribution(&active, power)?;

        let mut nat1_new = Vec::with_capacity(active.len());
        let mut nat2_new = Vec::with_capacity(active.len());
        for (a, &i) in active.iter().enumerate() {
            let cm = DVector::from_vec(vec![cav_mean[a]]);
            let cc = DMatrix::from_row_slice(1, 1, &[cav_cov[(a, a)]]);
            let (tilted_mean, tilted_var) = likelihood.moment_match(cm[0], cc[(0, 0)], self.y[i][0], power);

            let (tilted_nat1, tilted_nat2) =
                gaussian::mean_cov_to_natural(&DVector::from_vec(vec![tilted_mean]), &DMatrix::from_row_slice(1, 1, &[tilted_var]))?;
            let (cav_nat1, cav_nat2) = gaussian::mean_cov_to_natural(&cm, &cc)?;
            nat1_new.push((tilted_nat1 - cav_nat1) / power);
            nat2_new.push((tilted_nat2 - cav_nat2) / power);
        }

        let (nat1, nat2) = self.group_natural_params(&nat1_new, &nat2_new, &active);
        let all_ind: Vec<usize> = (0..self.x.len()).collect();
        self.sites.update_nat_params(&all_ind, &nat1, &nat2)?;
        self.update_posterior()
    }

    pub fn fit(&mut self, likelihood: &dyn Likelihood, iterations: usize, power: f64) -> Result<(), Error> {
        for _ in 0..iterations {
            self.ep_step(likelihood, power)?;
        }
        Ok(())
    }

    /// One prior sample path through the latent function, evaluated at the
    /// training times.
    pub fn prior_sample(&self, rng: &mut impl rand::Rng) -> Result<Vec<f64>, Error> {
        let states = crate::sampling::prior_state_sequence(&self.dt, &*self.kernel, rng)?;
        let h = self.kernel.measurement_model();
        Ok(states.iter().map(|s| (&h * s)[0]).collect())
    }

    /// Doucet's identity: `f_post = f_prior - E[f_prior | y_prior] + mu_post`,
    /// where `y_prior` is the prior sample observed through the same site
    /// noise covariances already fit to the real data.
    pub fn posterior_sample(&self, rng: &mut impl rand::Rng) -> Result<Vec<f64>, Error> {
        let h = self.kernel.measurement_model();
        let prior_states = crate::sampling::prior_state_sequence(&self.dt, &*self.kernel, rng)?;
        let site_covs = self.sites.covs();

        let mut y_pseudo = Vec::with_capacity(prior_states.len());
        for (state, cov) in prior_states.iter().zip(site_covs.iter()) {
            let f = &h * state;
            let noise = crate::sampling::sample_mvn(&DVector::zeros(f.nrows()), cov, rng)?;
            y_pseudo.push(f + noise);
        }

        let n = self.x.len();
        let (_, (m_f_prior, p_f_prior)) = kalman::kalman_filter(&self.dt, &*self.kernel, &y_pseudo, &site_covs, &self.mask, self.parallel)?;
        let (m_s_prior, _, _) = kalman::rauch_tung_striebel_smoother(&self.dt, &*self.kernel, &m_f_prior, &p_f_prior, self.parallel, false)?;

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let f_prior_i = (&h * &prior_states[i])[0];
            let f_prior_hat_i = (&h * &m_s_prior[i])[0];
            let mu_post_i = (&h * &self.smoothed_mean[i])[0];
            out.push(f_prior_i - f_prior_hat_i + mu_post_i);
        }
        Ok(out)
    }

    pub fn log_lik_cached(&self) -> f64 {
        self.log_lik
    }
}

impl InferenceEngine for MarkovGP {
    fn update_posterior(&mut self) -> Result<(), Error> {
        let y_sites = self.sites.means();
        let sigma_sites = self.sites.covs();
        let (log_lik, (m_f, p_f)) = kalman::kalman_filter(&self.dt, &*self.kernel, &y_sites, &sigma_sites, &self.mask, self.parallel)?;
        let (m_s, p_s, gains) = kalman::rauch_tung_striebel_smoother(&self.dt, &*self.kernel, &m_f, &p_f, self.parallel, true)?;
        self.filtered_mean = m_f;
        self.filtered_cov = p_f;
        self.smoothed_mean = m_s;
        self.smoothed_cov = p_s;
        self.gains = gains.unwrap_or_default();
        self.log_lik = log_lik;
        Ok(())
    }

    fn compute_log_lik(&self) -> Result<f64, Error> {
        Ok(self.log_lik)
    }

    fn compute_kl(&self) -> Result<f64, Error> {
        // Sum of per-marginal KLs against the stationary prior; an
        // approximation to the exact joint-chain KL (see DESIGN.md).
        let pinf = self.kernel.stationary_covariance();
        let state_dim = pinf.nrows() as f64;
        let prior_inv = crate::linalg::jittered_inverse(&pinf)?;
        let log_det_prior = crate::linalg::jittered_cholesky(&pinf)?.l().diagonal().iter().map(|d| d.ln()).sum::<f64>() * 2.0;
        let mut total = 0.0;
        for i in 0..self.smoothed_mean.len() {
            let trace_term = (&prior_inv * &self.smoothed_cov[i]).trace();
            let mean_term = (self.smoothed_mean[i].transpose() * &prior_inv * &self.smoothed_mean[i])[(0, 0)];
            let log_det_post = crate::linalg::jittered_cholesky(&self.smoothed_cov[i])?.l().diagonal().iter().map(|d| d.ln()).sum::<f64>() * 2.0;
            total += 0.5 * (trace_term + mean_term - state_dim - log_det_post + log_det_prior);
        }
        Ok(total)
    }

    fn predict(&self, x_test: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>), Error> {
        let x_test_vec: Vec<f64> = (0..x_test.nrows()).map(|i| x_test[(i, 0)]).collect();
        let x_aug = input::augment_with_sentinels(&self.x);
        let pinf = self.kernel.stationary_covariance();
        let mut m_s_aug = Vec::with_capacity(self.smoothed_mean.len() + 2);
        let mut p_s_aug = Vec::with_capacity(self.smoothed_cov.len() + 2);
        m_s_aug.push(DVector::zeros(pinf.nrows()));
        p_s_aug.push(pinf.clone());
        m_s_aug.extend(self.smoothed_mean.iter().cloned());
        p_s_aug.extend(self.smoothed_cov.iter().cloned());
        m_s_aug.push(DVector::zeros(pinf.nrows()));
        p_s_aug.push(pinf.clone());

        let (state_means, state_covs) = kalman::temporal_conditional(&x_aug, &x_test_vec, &m_s_aug, &p_s_aug, &*self.kernel)?;
        let h = self.kernel.measurement_model();
        let mut means = DVector::zeros(x_test_vec.len());
        let mut vars = DVector::zeros(x_test_vec.len());
        for i in 0..x_test_vec.len() {
            means[i] = (&h * &state_means[i])[0];
            vars[i] = (&h * &state_covs[i] * h.transpose())[(0, 0)];
        }
        Ok((means, vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Matern32;
    use crate::likelihood::Gaussian;
    use approx::assert_relative_eq;

    fn toy_markov() -> MarkovGP {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&t| (t * 0.3).sin()).collect();
        MarkovGP::new(Box::new(Matern32::new(1.0, 2.0)), x, y, false).unwrap()
    }

    #[test]
    fn filter_equals_gp_posterior_mean_at_last_point_in_the_well_fit_limit() {
        let mut m = toy_markov();
        let lik = Gaussian::new(0.01);
        m.fit(&lik, 4, 1.0).unwrap();
        // after fitting, filtered/smoothed means should track the sinusoid reasonably
        let h = m.kernel.measurement_model();
        let pred_last = (&h * &m.smoothed_mean[9])[0];
        assert!((pred_last - (9.0f64 * 0.3).sin()).abs() < 0.5);
    }

    #[test]
    fn predict_outside_range_reverts_to_stationary_marginal() {
        let mut m = toy_markov();
        let lik = Gaussian::new(0.01);
        m.fit(&lik, 2, 1.0).unwrap();
        let x_test = DMatrix::from_row_slice(1, 1, &[1000.0]);
        let (mean, var) = m.predict(&x_test).unwrap();
        assert_relative_eq!(mean[0], 0.0, epsilon = 1e-6);
        assert!(var[0] > 0.9);
    }

    #[test]
    fn posterior_sample_runs_without_error() {
        let mut m = toy_markov();
        let lik = Gaussian::new(0.01);
        m.fit(&lik, 2, 1.0).unwrap();
        let mut rng = crate::sampling::seeded_rng(1);
        let sample = m.posterior_sample(&mut rng).unwrap();
        assert_eq!(sample.len(), 10);
        assert!(sample.iter().all(|v| v.is_finite()));
    }

    fn toy_xy(n: usize) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|&t| (t * 0.4).sin()).collect();
        (x, y)
    }

    /// Sequential and rayon-parallel Kalman filters must agree on the fitted
    /// log-likelihood across several problem sizes (distilled spec §8
    /// property 5, exercised here at the model layer; the filter-level
    /// check lives in `kalman.rs`).
    #[test]
    fn parallel_fit_matches_sequential_across_sizes() {
        for &n in &[8usize, 128, 300] {
            let (x, y) = toy_xy(n);
            let lik = Gaussian::new(0.02);

            let mut seq = MarkovGP::new(Box::new(Matern32::new(1.0, 1.0)), x.clone(), y.clone(), false).unwrap();
            seq.fit(&lik, 2, 1.0).unwrap();

            let mut par = MarkovGP::new(Box::new(Matern32::new(1.0, 1.0)), x, y, true).unwrap();
            par.fit(&lik, 2, 1.0).unwrap();

            let seq_ll = seq.compute_log_lik().unwrap();
            let par_ll = par.compute_log_lik().unwrap();
            assert!((seq_ll - par_ll).abs() < 1e-5, "n={n}: {seq_ll} vs {par_ll}");
        }
    }

    /// Masking an observation must produce the same posterior as dropping it
    /// from the dataset entirely (distilled spec §8 property 6).
    #[test]
    fn masking_an_observation_matches_removing_it() {
        let x: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|&t| (t * 0.3).sin()).collect();
        y[3] = f64::NAN;
        let lik = Gaussian::new(0.05);

        let mut masked = MarkovGP::new(Box::new(Matern32::new(1.0, 1.0)), x.clone(), y, false).unwrap();
        masked.fit(&lik, 3, 1.0).unwrap();

        let x_removed: Vec<f64> = x.iter().cloned().filter(|&t| t != 3.0).collect();
        let y_removed: Vec<f64> = x_removed.iter().map(|&t| (t * 0.3).sin()).collect();
        let mut removed = MarkovGP::new(Box::new(Matern32::new(1.0, 1.0)), x_removed.clone(), y_removed, false).unwrap();
        removed.fit(&lik, 3, 1.0).unwrap();

        let x_test = DMatrix::from_row_slice(x_removed.len(), 1, &x_removed);
        let (mean_masked, _) = masked.predict(&x_test).unwrap();
        let (mean_removed, _) = removed.predict(&x_test).unwrap();
        for i in 0..x_removed.len() {
            assert!((mean_masked[i] - mean_removed[i]).abs() < 1e-3, "index {i}: {} vs {}", mean_masked[i], mean_removed[i]);
        }
    }

    /// The empirical mean of many `posterior_sample` draws converges to the
    /// smoothed posterior mean, i.e. Doucet's identity holds in aggregate
    /// (distilled spec §8 scenario S4).
    #[test]
    fn posterior_sample_mean_converges_to_posterior_mean() {
        let x: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&t| (t * 0.3).sin()).collect();
        let mut model = toy_markov_with(x.clone(), y);
        let lik = Gaussian::new(0.02);
        model.fit(&lik, 4, 1.0).unwrap();

        let x_test = DMatrix::from_row_slice(x.len(), 1, &x);
        let (posterior_mean, _) = model.predict(&x_test).unwrap();

        let num_samps = 200;
        let mut sum = vec![0.0; x.len()];
        let mut rng = crate::sampling::seeded_rng(5);
        for _ in 0..num_samps {
            let sample = model.posterior_sample(&mut rng).unwrap();
            for i in 0..x.len() {
                sum[i] += sample[i];
            }
        }
        for i in 0..x.len() {
            let empirical_mean = sum[i] / num_samps as f64;
            assert!((empirical_mean - posterior_mean[i]).abs() < 0.25, "index {i}: empirical={} posterior={}", empirical_mean, posterior_mean[i]);
        }
    }

    fn toy_markov_with(x: Vec<f64>, y: Vec<f64>) -> MarkovGP {
        MarkovGP::new(Box::new(Matern32::new(1.0, 2.0)), x, y, false).unwrap()
    }

    /// 30% missing observations must produce the same predictive
    /// distribution as refitting on the dataset with those rows dropped
    /// entirely (distilled spec §8 scenario S5, a larger-missingness variant
    /// of property 6 above that also checks predictive variance).
    #[test]
    fn missing_data_passthrough_at_scale() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y_full: Vec<f64> = x.iter().map(|&t| (t * 0.4).sin()).collect();
        let dropped: Vec<usize> = vec![2, 5, 9, 13, 16, 18];

        let mut y_masked = y_full.clone();
        for &i in &dropped {
            y_masked[i] = f64::NAN;
        }
        let lik = Gaussian::new(0.03);

        let mut masked = MarkovGP::new(Box::new(Matern32::new(1.0, 1.5)), x.clone(), y_masked, false).unwrap();
        masked.fit(&lik, 4, 1.0).unwrap();

        let x_removed: Vec<f64> = x.iter().enumerate().filter(|(i, _)| !dropped.contains(i)).map(|(_, &t)| t).collect();
        let y_removed: Vec<f64> = x_removed.iter().map(|&t| (t * 0.4).sin()).collect();
        let mut removed = MarkovGP::new(Box::new(Matern32::new(1.0, 1.5)), x_removed.clone(), y_removed, false).unwrap();
        removed.fit(&lik, 4, 1.0).unwrap();

        let x_test = DMatrix::from_row_slice(x_removed.len(), 1, &x_removed);
        let (mean_masked, var_masked) = masked.predict(&x_test).unwrap();
        let (mean_removed, var_removed) = removed.predict(&x_test).unwrap();
        for i in 0..x_removed.len() {
            assert!((mean_masked[i] - mean_removed[i]).abs() < 1e-3, "mean index {i}");
            assert!((var_masked[i] - var_removed[i]).abs() < 1e-3, "var index {i}");
        }
    }
}
