//! Input admission: validating and massaging the raw `(X, Y)` arrays handed
//! to a model constructor before any inference machinery sees them.
//!
//! Grounded on `newt/basemodels.py`'s `BaseModel.__init__` (reshaping `X`/
//! `Y`, deriving `mask_y` from `NaN`s) and `MarkovGP.__init__`'s
//! `input_admin` (sorting check, duplicate-timestamp detection for the
//! spatio-temporal case).

use crate::error::{Error, ErrorKind};

/// Per-row observation mask derived from `NaN` entries in `y` (distilled
/// spec §3.1): `mask[i][d] == true` means `y[i][d]` is missing.
pub fn mask_from_nan(y: &[Vec<f64>]) -> Vec<Vec<bool>> {
    y.iter().map(|row| row.iter().map(|v| v.is_nan()).collect()).collect()
}

/// Validate that `x` is strictly sorted ascending, as every sequential
/// state-space operation (`kalman_filter`, the smoother, `temporal_conditional`)
/// requires.
pub fn check_sorted(x: &[f64]) -> Result<(), Error> {
    if x.windows(2).any(|w| w[1] < w[0]) {
        return Err(ErrorKind::UnsortedTime.into());
    }
    Ok(())
}

/// `input_admin` (distilled spec §4.H): from sorted, possibly duplicated
/// timestamps `x`, return the unique time grid `dt` (first differences,
/// `dt[0] == 0`) and, for each original row, the index into that grid it
/// maps to (identity unless spatio-temporal inputs repeat timestamps across
/// several spatial locations).
pub fn input_admin(x: &[f64]) -> Result<(Vec<f64>, Vec<usize>), Error> {
    check_sorted(x)?;
    let mut unique_times = Vec::new();
    let mut row_to_time = Vec::with_capacity(x.len());
    for &t in x {
        if unique_times.last().map(|&last| last == t).unwrap_or(false) {
            row_to_time.push(unique_times.len() - 1);
        } else {
            unique_times.push(t);
            row_to_time.push(unique_times.len() - 1);
        }
    }
    let mut dt = Vec::with_capacity(unique_times.len());
    for i in 0..unique_times.len() {
        dt.push(if i == 0 { 0.0 } else { unique_times[i] - unique_times[i - 1] });
    }
    Ok((dt, row_to_time))
}

/// Augment a sorted time grid with the `+-1e10` sentinels `predict` needs so
/// every interior test point has an enclosing pair of real grid points.
pub fn augment_with_sentinels(x: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(x.len() + 2);
    out.push(-crate::kalman::PREDICT_SENTINEL);
    out.extend_from_slice(x);
    out.push(crate::kalman::PREDICT_SENTINEL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_from_nan_flags_missing_entries() {
        let y = vec![vec![1.0, f64::NAN], vec![f64::NAN, 2.0]];
        let mask = mask_from_nan(&y);
        assert_eq!(mask, vec![vec![false, true], vec![true, false]]);
    }

    #[test]
    fn check_sorted_rejects_decreasing_input() {
        assert!(check_sorted(&[0.0, 1.0, 0.5]).is_err());
        assert!(check_sorted(&[0.0, 1.0, 1.0, 2.0]).is_ok());
    }

    #[test]
    fn input_admin_collapses_duplicate_timestamps() {
        let x = vec![0.0, 0.0, 1.0, 2.0, 2.0];
        let (dt, row_to_time) = input_admin(&x).unwrap();
        assert_eq!(dt.len(), 3);
        assert_eq!(row_to_time, vec![0, 0, 1, 2, 2]);
    }
}
