//! Approximate Bayesian inference for Gaussian-process regression and
//! related latent-function models.
//!
//! Four posterior-computation strategies share one pseudo-likelihood site
//! representation ([`gaussian::Site`]/[`gaussian::SiteStore`]) and one
//! site-update algebra ([`cavity`]): a dense GP over the full `N x N` kernel
//! matrix ([`model::GP`]), a sparse inducing-point GP
//! ([`model::SparseGP`]), a state-space (Markov) GP driven by a Kalman
//! filter and RTS smoother ([`model::MarkovGP`]), and a sparse state-space
//! GP whose sites live on a fixed inducing grid ([`model::SparseMarkovGP`]).
//! Any of EP, power EP, variational inference or a Laplace approximation is
//! obtained by swapping out [`likelihood::Likelihood::moment_match`]; the
//! site-update loop itself does not change.
//!
//! - Uses the [nalgebra](https://nalgebra.org) crate for all linear algebra.
//! - Uses [rayon](https://docs.rs/rayon) for the associative-scan parallel
//!   Kalman filter and RTS smoother (Sarkka & Garcia-Fernandez, 2021).

#![allow(non_snake_case)]

mod error;
pub use error::{Error, ErrorKind};

pub mod linalg;

pub mod gaussian;
pub use gaussian::{Site, SiteStore};

pub mod kernel;
pub use kernel::{Independent, Kernel, Matern32, Matern52};

pub mod likelihood;
pub use likelihood::{Gaussian, Likelihood};

pub mod cavity;
pub mod conditional;
pub mod input;
pub mod kalman;
pub mod sampling;

pub mod model;
pub use model::{InferenceEngine, MarkovGP, SparseGP, SparseMarkovGP, GP};
