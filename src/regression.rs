//! Intercept-free ridge regression and the variance estimate used for the
//! precision diagonal.

use crate::faer_ndarray::{FaerLinalgError, fast_ata, fast_atv, solve_symmetric};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Coefficients and in-sample residuals of one ridge fit.
#[derive(Debug, Clone)]
pub struct RidgeFit {
    pub coefficients: Array1<f64>,
    pub residuals: Array1<f64>,
}

/// Minimizes `||y - X b||² + alpha ||b||²` with no intercept, i.e. solves
/// `(XᵀX + alpha I) b = Xᵀy`.
pub fn fit_ridge_no_intercept(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    alpha: f64,
) -> Result<RidgeFit, FaerLinalgError> {
    let mut gram = fast_ata(&x);
    gram.diag_mut().mapv_inplace(|d| d + alpha);
    let rhs = fast_atv(&x, &y);
    let coefficients = solve_symmetric(&gram, &rhs)?;
    let residuals = &y - &x.dot(&coefficients);
    Ok(RidgeFit {
        coefficients,
        residuals,
    })
}

/// Population variance (divisor `n`). Zero-length input gives NaN.
pub fn population_variance(values: ArrayView1<'_, f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}
