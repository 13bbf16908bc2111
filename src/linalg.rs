//! Numeric utilities shared by every inference engine: jittered Cholesky
//! solves, per-index ("batched") matrix inversion, block-diagonal assembly,
//! and masking helpers.
//!
//! None of these operate on a distinguished "hot path" matrix type beyond
//! `nalgebra::{DMatrix, DVector}` — there is no tensor/batch type in
//! `nalgebra`, so batching is expressed as `Vec<DMatrix<f64>>` processed with
//! ordinary iterator combinators (see module docs in `kalman.rs` for the
//! rayon-parallel variant used by the associative-scan filter).

use crate::error::{Error, ErrorKind};
use nalgebra::{DMatrix, DVector};

/// Default jitter added to any matrix before inversion or Cholesky, unless a
/// call site is explicitly documented as unscaled.
pub const JITTER: f64 = 1e-8;

/// Add `jitter * I` to a square matrix, returning a new matrix.
pub fn add_jitter(m: &DMatrix<f64>, jitter: f64) -> DMatrix<f64> {
    let n = m.nrows();
    m + DMatrix::identity(n, n) * jitter
}

/// Cholesky-factorise `m` after adding the default jitter, returning an
/// error only if the matrix remains non-positive-definite afterwards (a
/// caller-kernel bug per the error-handling design).
pub fn jittered_cholesky(m: &DMatrix<f64>) -> Result<nalgebra::linalg::Cholesky<f64, nalgebra::Dyn>, Error> {
    let jittered = add_jitter(m, JITTER);
    match nalgebra::linalg::Cholesky::new(jittered) {
        Some(chol) => Ok(chol),
        None => Err(ErrorKind::CovarianceNotPositiveSemiDefinite.into()),
    }
}

/// Solve `m x = rhs` for symmetric positive-definite `m`, adding jitter
/// first.
pub fn chol_solve(m: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Error> {
    let chol = jittered_cholesky(m)?;
    Ok(chol.solve(rhs))
}

/// Invert a symmetric positive-definite matrix via jittered Cholesky.
pub fn jittered_inverse(m: &DMatrix<f64>) -> Result<DMatrix<f64>, Error> {
    let chol = jittered_cholesky(m)?;
    Ok(chol.inverse())
}

/// Per-index ("batched") matrix inverse: invert every matrix in `ms`
/// independently, each with its own jitter-healed Cholesky.
pub fn batched_inverse(ms: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>, Error> {
    ms.iter().map(jittered_inverse).collect()
}

/// Build a block-diagonal matrix from a slice of square blocks.
pub fn block_diag(blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
    let total: usize = blocks.iter().map(|b| b.nrows()).sum();
    let mut out = DMatrix::<f64>::zeros(total, total);
    let mut offset = 0;
    for b in blocks {
        let n = b.nrows();
        out.view_mut((offset, offset), (n, n)).copy_from(b);
        offset += n;
    }
    out
}

/// Scatter-update selected rows of a `Vec` of per-index slices (sites,
/// posterior moments, ...) in place, following `batch_ind`. `batch_ind[i]`
/// gives the destination index for `values[i]`.
pub fn scatter_update<T: Clone>(target: &mut [T], batch_ind: &[usize], values: &[T]) {
    debug_assert_eq!(batch_ind.len(), values.len());
    for (&idx, value) in batch_ind.iter().zip(values.iter()) {
        target[idx] = value.clone();
    }
}

/// Gather selected rows of a `Vec` of per-index slices, following
/// `batch_ind`.
pub fn gather<T: Clone>(source: &[T], batch_ind: &[usize]) -> Vec<T> {
    batch_ind.iter().map(|&idx| source[idx].clone()).collect()
}

/// Zero out the component of `v` at every index where `mask` is `true`
/// (used to make masked observations neutral to an innovation vector).
pub fn mask_vector(v: &mut DVector<f64>, mask: &[bool]) {
    for (i, &m) in mask.iter().enumerate() {
        if m {
            v[i] = 0.0;
        }
    }
}

/// Zero out the row/column of a square matrix at every masked index
/// (applied to an innovation-covariance inverse so a masked observation
/// contributes nothing to the Kalman gain or the marginal likelihood).
pub fn mask_matrix(m: &mut DMatrix<f64>, mask: &[bool]) {
    for (i, &mi) in mask.iter().enumerate() {
        if mi {
            for j in 0..m.ncols() {
                m[(i, j)] = 0.0;
                m[(j, i)] = 0.0;
            }
        }
    }
}
