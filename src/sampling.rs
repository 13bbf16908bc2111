//! Seeded Gaussian sampling: prior sample paths through a state-space
//! kernel, and the building block (`sample_mvn`) the models use to implement
//! Doucet's identity for posterior sampling.
//!
//! Grounded on `newt/basemodels.py`'s `prior_sample` (nested `scan` drawing a
//! Cholesky-factored innovation at every step) and `posterior_sample`
//! (`f_post = f_prior - E[f_prior | y_prior] + mu_post`); `ChaCha8Rng` +
//! `rand_distr::StandardNormal` are the ambient choice (§4.N) rather than
//! anything kernel/model specific.

use crate::error::Error;
use crate::kernel::Kernel;
use crate::linalg;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// A reproducible RNG seeded from a single `u64`, used for every stochastic
/// operation in this crate.
pub fn seeded_rng(seed: u64) -> rand_chacha::ChaCha8Rng {
    use rand::SeedableRng;
    rand_chacha::ChaCha8Rng::seed_from_u64(seed)
}

/// Draw one sample from `N(mean, cov)` via a jittered Cholesky factor.
pub fn sample_mvn(mean: &DVector<f64>, cov: &DMatrix<f64>, rng: &mut impl Rng) -> Result<DVector<f64>, Error> {
    let chol = linalg::jittered_cholesky(cov)?;
    let dim = mean.nrows();
    let z = DVector::from_iterator(dim, (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)));
    Ok(mean + chol.l() * z)
}

/// One full prior sample path through the state-space SDE: `x_0 ~ N(0, Pinf)`,
/// `x_k = A(dt_k) x_{k-1} + noise(Q(dt_k))`.
pub fn prior_state_sequence(dt: &[f64], kernel: &dyn Kernel, rng: &mut impl Rng) -> Result<Vec<DVector<f64>>, Error> {
    let pinf = kernel.stationary_covariance();
    let state_dim = pinf.nrows();
    let mut states = Vec::with_capacity(dt.len());
    let mut x = sample_mvn(&DVector::zeros(state_dim), &pinf, rng)?;
    for (i, &d) in dt.iter().enumerate() {
        if i > 0 {
            let a = kernel.state_transition(d);
            let q = crate::kalman::process_noise_covariance(&a, &pinf);
            let mean = &a * &x;
            x = sample_mvn(&mean, &q, rng)?;
        }
        states.push(x.clone());
    }
    Ok(states)
}
