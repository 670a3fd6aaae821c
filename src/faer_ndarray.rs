use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{self, Solve};
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt};
use faer::{Accum, Mat, MatRef, Par, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Right-hand side has {found} rows, expected {expected}")]
    RhsMismatch { expected: usize, found: usize },
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
    #[error("Solve produced non-finite values")]
    NonFinite,
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    #[inline]
    pub fn solve(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve(rhs),
            FaerSymmetricFactor::Ldlt(f) => f.solve(rhs),
        }
    }

    pub fn is_cholesky(&self) -> bool {
        matches!(self, FaerSymmetricFactor::Llt(_))
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
#[inline]
pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if let Ok(llt) = FaerLlt::new(matrix, side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    let ldlt = FaerLdlt::new(matrix, side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Tiny products stay on ndarray; faer GEMM pays off past a few thousand flops.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

pub fn array2_to_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    Mat::from_fn(array.nrows(), array.ncols(), |i, j| array[[i, j]])
}

pub fn array1_to_col<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix1>) -> Mat<f64> {
    Mat::from_fn(array.len(), 1, |i, _| array[i])
}

pub fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn first_col_to_array(mat: MatRef<'_, f64>) -> Array1<f64> {
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

/// Compute A^T * A, switching to faer GEMM for moderate sizes.
///
/// Runs sequentially: the estimator already parallelizes across features.
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (n, p) = a.dim();
    if !should_use_faer_matmul(p, p, n) {
        return a.t().dot(a);
    }
    let a_mat = array2_to_mat(a);
    let mut result = Mat::<f64>::zeros(p, p);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_mat.as_ref().transpose(),
        a_mat.as_ref(),
        1.0,
        Par::Seq,
    );
    mat_to_array(result.as_ref())
}

/// Compute A^T * v.
pub fn fast_atv<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    v: &ArrayBase<S2, Ix1>,
) -> Array1<f64> {
    let (n, p) = a.dim();
    debug_assert_eq!(n, v.len(), "A rows must match v length");
    if !should_use_faer_matmul(p, 1, n) {
        return a.t().dot(v);
    }
    let a_mat = array2_to_mat(a);
    let v_mat = array1_to_col(v);
    let mut result = Mat::<f64>::zeros(p, 1);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_mat.as_ref().transpose(),
        v_mat.as_ref(),
        1.0,
        Par::Seq,
    );
    first_col_to_array(result.as_ref())
}

/// Solve `matrix * x = rhs` for a symmetric `matrix`.
pub fn solve_symmetric<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    matrix: &ArrayBase<S1, Ix2>,
    rhs: &ArrayBase<S2, Ix1>,
) -> Result<Array1<f64>, FaerLinalgError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }
    if rhs.len() != rows {
        return Err(FaerLinalgError::RhsMismatch {
            expected: rows,
            found: rhs.len(),
        });
    }
    let factor = factorize_symmetric_with_fallback(array2_to_mat(matrix).as_ref(), Side::Lower)?;
    if !factor.is_cholesky() {
        log::warn!("{rows}x{rows} system is not positive definite; solved with LDLT");
    }
    let solved = factor.solve(array1_to_col(rhs).as_ref());
    let out = first_col_to_array(solved.as_ref());
    if out.iter().any(|v| !v.is_finite()) {
        return Err(FaerLinalgError::NonFinite);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn fast_ata_matches_ndarray_on_both_paths() {
        let small = array![[1.0, 2.0], [3.0, -1.0], [0.5, 4.0]];
        let expected = small.t().dot(&small);
        let got = fast_ata(&small);
        for (e, g) in expected.iter().zip(got.iter()) {
            assert_abs_diff_eq!(*e, *g, epsilon = 1e-12);
        }

        let large = Array2::from_shape_fn((80, 40), |(i, j)| ((i * 7 + j * 3) % 11) as f64 - 5.0);
        let expected = large.t().dot(&large);
        let got = fast_ata(&large);
        for (e, g) in expected.iter().zip(got.iter()) {
            assert_abs_diff_eq!(*e, *g, epsilon = 1e-9);
        }
    }

    #[test]
    fn fast_atv_matches_ndarray() {
        let a = Array2::from_shape_fn((90, 40), |(i, j)| ((i + 2 * j) % 5) as f64 * 0.25);
        let v = Array1::from_shape_fn(90, |i| (i % 3) as f64 - 1.0);
        let expected = a.t().dot(&v);
        let got = fast_atv(&a, &v);
        for (e, g) in expected.iter().zip(got.iter()) {
            assert_abs_diff_eq!(*e, *g, epsilon = 1e-9);
        }
    }

    #[test]
    fn solve_symmetric_recovers_solution() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let x = array![1.0, -2.0, 0.5];
        let b = a.dot(&x);
        let got = solve_symmetric(&a, &b).unwrap();
        for (e, g) in x.iter().zip(got.iter()) {
            assert_abs_diff_eq!(*e, *g, epsilon = 1e-10);
        }
    }

    #[test]
    fn indefinite_system_falls_back_to_ldlt() {
        // Eigenvalues 3 and -1: LLT must fail.
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        let factor =
            factorize_symmetric_with_fallback(array2_to_mat(&a).as_ref(), Side::Lower).unwrap();
        assert!(!factor.is_cholesky());

        let x = array![1.0, -1.0];
        let b = a.dot(&x);
        let got = solve_symmetric(&a, &b).unwrap();
        for (e, g) in x.iter().zip(got.iter()) {
            assert_abs_diff_eq!(*e, *g, epsilon = 1e-12);
        }
    }

    #[test]
    fn solve_symmetric_rejects_bad_shapes() {
        let a = Array2::<f64>::zeros((2, 3));
        let b = Array1::<f64>::zeros(2);
        assert!(matches!(
            solve_symmetric(&a, &b),
            Err(FaerLinalgError::NotSquare { rows: 2, cols: 3 })
        ));
        let a = Array2::<f64>::eye(2);
        let b = Array1::<f64>::zeros(3);
        assert!(matches!(
            solve_symmetric(&a, &b),
            Err(FaerLinalgError::RhsMismatch { expected: 2, found: 3 })
        ));
    }
}
