use crate::precision::PrecisionError;
use dyn_stack::{MemBuffer, MemStack};
use faer::sparse::linalg::matmul::{
    sparse_sparse_matmul_numeric, sparse_sparse_matmul_numeric_scratch,
    sparse_sparse_matmul_symbolic,
};
use faer::sparse::{SparseColMat, SparseColMatMut, SparseColMatRef, Triplet};
use faer::{Accum, Par};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

/// Coordinate-format view of a sparse matrix: parallel row, column and value
/// arrays plus the matrix shape. Entries are listed column by column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooTriplets {
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub values: Vec<f64>,
}

impl CooTriplets {
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.rows
            .iter()
            .zip(&self.cols)
            .zip(&self.values)
            .map(|((&r, &c), &v)| (r, c, v))
    }
}

/// Immutable CSC matrix with a lazily built dense copy.
#[derive(Clone)]
pub struct SparseFactor {
    matrix: SparseColMat<usize, f64>,
    dense_cache: Arc<OnceLock<Arc<Array2<f64>>>>,
}

impl SparseFactor {
    pub fn new(matrix: SparseColMat<usize, f64>) -> Self {
        Self {
            matrix,
            dense_cache: Arc::new(OnceLock::new()),
        }
    }

    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[Triplet<usize, usize, f64>],
    ) -> Result<Self, PrecisionError> {
        SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
            .map(Self::new)
            .map_err(|err| PrecisionError::SparseAssembly(format!("{err:?}")))
    }

    /// Square diagonal matrix with `values` on the diagonal.
    pub fn from_diagonal(values: &[f64]) -> Result<Self, PrecisionError> {
        let n = values.len();
        let triplets: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| Triplet::new(i, i, v))
            .collect();
        Self::from_triplets(n, n, &triplets)
    }

    /// Stored entries, explicit zeros included.
    pub fn nnz(&self) -> usize {
        let (symbolic, _) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        col_ptr[self.matrix.ncols()] - col_ptr[0]
    }

    /// Value at `(row, col)`; zero when the entry is not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        if row >= self.matrix.nrows() || col >= self.matrix.ncols() {
            return 0.0;
        }
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        (col_ptr[col]..col_ptr[col + 1])
            .filter(|&idx| row_idx[idx] == row)
            .map(|idx| values[idx])
            .sum()
    }

    pub fn diagonal(&self) -> Array1<f64> {
        let n = self.matrix.nrows().min(self.matrix.ncols());
        Array1::from_shape_fn(n, |i| self.get(i, i))
    }

    pub fn to_triplets(&self) -> CooTriplets {
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut out = CooTriplets {
            nrows: self.matrix.nrows(),
            ncols: self.matrix.ncols(),
            rows: Vec::with_capacity(self.nnz()),
            cols: Vec::with_capacity(self.nnz()),
            values: Vec::with_capacity(self.nnz()),
        };
        for col in 0..self.matrix.ncols() {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                out.rows.push(row_idx[idx]);
                out.cols.push(col);
                out.values.push(values[idx]);
            }
        }
        out
    }

    pub fn to_dense_arc(&self) -> Arc<Array2<f64>> {
        self.dense_cache
            .get_or_init(|| {
                let mut out = Array2::<f64>::zeros((self.matrix.nrows(), self.matrix.ncols()));
                for (row, col, value) in self.to_triplets().iter() {
                    out[[row, col]] += value;
                }
                Arc::new(out)
            })
            .clone()
    }

    pub fn to_dense(&self) -> Array2<f64> {
        self.to_dense_arc().as_ref().clone()
    }

    /// `Selfᵗ · diag(weights) · Self`, formed as `(√W·Self)ᵗ · (√W·Self)`
    /// with faer's sparse-sparse product. Weights must be non-negative.
    pub fn weighted_gram(&self, weights: &Array1<f64>) -> Result<SparseFactor, PrecisionError> {
        let nrows = self.matrix.nrows();
        let ncols = self.matrix.ncols();
        if weights.len() != nrows {
            return Err(PrecisionError::SparseAssembly(format!(
                "weight vector has length {}, expected {nrows}",
                weights.len()
            )));
        }
        let sqrt_w = weights.mapv(f64::sqrt);

        // Right factor √W·A keeps A's pattern; each entry scales by its row.
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut scaled = vec![0.0; values.len()];
        for col in 0..ncols {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                scaled[idx] = values[idx] * sqrt_w[row_idx[idx]];
            }
        }

        // Left factor (√W·A)ᵗ in CSC: column j of Aᵗ is row j of A.
        let transposed = self.matrix.as_ref().transpose().to_col_major().map_err(|err| {
            PrecisionError::SparseAssembly(format!("failed to transpose to CSC: {err:?}"))
        })?;
        let (t_symbolic, t_values) = transposed.parts();
        let t_col_ptr = t_symbolic.col_ptr();
        let mut t_scaled = vec![0.0; t_values.len()];
        for col in 0..nrows {
            for idx in t_col_ptr[col]..t_col_ptr[col + 1] {
                t_scaled[idx] = t_values[idx] * sqrt_w[col];
            }
        }

        let (gram_symbolic, info) =
            sparse_sparse_matmul_symbolic(transposed.symbolic(), self.matrix.symbolic())
                .map_err(|err| {
                    PrecisionError::SparseAssembly(format!("symbolic Gram product failed: {err:?}"))
                })?;
        let mut gram_values = vec![0.0; gram_symbolic.row_idx().len()];
        let mut scratch = MemBuffer::new(sparse_sparse_matmul_numeric_scratch::<usize, f64>(
            gram_symbolic.as_ref(),
            Par::Seq,
        ));
        let mut stack = MemStack::new(&mut scratch);
        sparse_sparse_matmul_numeric(
            SparseColMatMut::new(gram_symbolic.as_ref(), &mut gram_values),
            Accum::Replace,
            SparseColMatRef::new(transposed.symbolic(), &t_scaled),
            SparseColMatRef::new(self.matrix.symbolic(), &scaled),
            1.0,
            &info,
            Par::Seq,
            &mut stack,
        );

        let g_col_ptr = gram_symbolic.col_ptr();
        let g_row_idx = gram_symbolic.row_idx();
        let mut triplets = Vec::with_capacity(gram_values.len());
        for col in 0..ncols {
            for idx in g_col_ptr[col]..g_col_ptr[col + 1] {
                triplets.push(Triplet::new(g_row_idx[idx], col, gram_values[idx]));
            }
        }
        Self::from_triplets(ncols, ncols, &triplets)
    }
}

impl Deref for SparseFactor {
    type Target = SparseColMat<usize, f64>;
    fn deref(&self) -> &Self::Target {
        &self.matrix
    }
}

impl AsRef<SparseColMat<usize, f64>> for SparseFactor {
    fn as_ref(&self) -> &SparseColMat<usize, f64> {
        &self.matrix
    }
}

impl std::fmt::Debug for SparseFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseFactor")
            .field("nrows", &self.matrix.nrows())
            .field("ncols", &self.matrix.ncols())
            .field("nnz", &self.nnz())
            .finish()
    }
}
