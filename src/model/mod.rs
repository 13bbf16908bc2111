//! The four posterior-computation strategies (distilled spec §4.F-§4.I):
//! dense (`GP`), sparse inducing-point (`SparseGP`), state-space
//! (`MarkovGP`) and sparse state-space (`SparseMarkovGP`). Each owns its
//! pseudo-likelihood [`crate::gaussian::SiteStore`] and its own posterior
//! representation — they are independent structs rather than one shared
//! struct behind a strategy enum, because the posterior shape (dense `N x N`
//! covariance vs. a sequence of `S x S` marginals) genuinely differs; what
//! they share is expressed as the [`InferenceEngine`] trait plus the
//! `cavity`/`conditional`/`kalman` free functions every one of them calls.

mod gp;
mod markov_gp;
mod sparse_gp;
mod sparse_markov_gp;

pub use gp::GP;
pub use markov_gp::MarkovGP;
pub use sparse_gp::SparseGP;
pub use sparse_markov_gp::SparseMarkovGP;

use crate::error::Error;
use nalgebra::{DMatrix, DVector};

/// The operations common to all four posterior-computation strategies.
pub trait InferenceEngine {
    /// Recompute the posterior from the current pseudo-likelihood sites.
    fn update_posterior(&mut self) -> Result<(), Error>;

    /// Approximate marginal log-likelihood (evidence) under the current
    /// sites.
    fn compute_log_lik(&self) -> Result<f64, Error>;

    /// `KL(q(f) || p(f))` between the current posterior and the GP prior.
    fn compute_kl(&self) -> Result<f64, Error>;

    /// Predictive mean and variance of the latent function at `x_test`.
    fn predict(&self, x_test: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>), Error>;
}
