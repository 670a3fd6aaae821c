//! Sparse precision estimation by local ridge regression.
//!
//! Feature `i` is regressed on the ensemble columns of its predecessors. The
//! negated coefficients fill row `i` of a unit lower-triangular matrix `T`,
//! and the inverse residual variance becomes `D[i, i]`. The precision matrix
//! is then the modified Cholesky product `Tᵗ·D·T`.

use crate::faer_ndarray::FaerLinalgError;
use crate::regression::{fit_ridge_no_intercept, population_variance};
use crate::sparse::SparseFactor;
use crate::types::EstimatorConfig;
use faer::sparse::Triplet;
use ndarray::{Array1, ArrayBase, ArrayView2, Axis, Data, Dimension, Ix2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrecisionError {
    #[error("Ensemble must be a 2D (samples x features) matrix, but has {0} dimensions.")]
    InvalidEnsembleRank(usize),

    #[error("Feature count must be positive.")]
    NoFeatures,

    #[error("Ensemble has no samples.")]
    NoSamples,

    #[error("Ensemble has {found} feature columns, but {expected} features were declared.")]
    FeatureCountMismatch { expected: usize, found: usize },

    #[error("Predecessor list has {found} entries, but {expected} features were declared.")]
    PredecessorCountMismatch { expected: usize, found: usize },

    #[error("Ridge penalty alpha must be a positive finite number, but was {0}.")]
    InvalidAlpha(f64),

    #[error("Variance floor must be a positive finite number, but was {0}.")]
    InvalidVarianceFloor(f64),

    #[error("Feature {feature} lists predecessor {predecessor}, which does not precede it.")]
    OutOfOrderPredecessor { feature: usize, predecessor: usize },

    #[error("Feature {feature} lists predecessor {predecessor} more than once.")]
    DuplicatePredecessor { feature: usize, predecessor: usize },

    #[error("Ridge regression for feature {feature} failed: {source}")]
    RegressionFailed {
        feature: usize,
        #[source]
        source: FaerLinalgError,
    },

    #[error("Sparse matrix assembly failed: {0}")]
    SparseAssembly(String),
}

/// Per-feature predecessor lists in which every index refers to an earlier
/// feature. This is what keeps `T` unit lower-triangular.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedPredecessors {
    lists: Arc<Vec<Vec<usize>>>,
}

impl OrderedPredecessors {
    pub fn new(lists: Vec<Vec<usize>>) -> Result<Self, PrecisionError> {
        Self::from_shared(Arc::new(lists))
    }

    pub fn from_shared(lists: Arc<Vec<Vec<usize>>>) -> Result<Self, PrecisionError> {
        let mut seen = HashSet::new();
        for (feature, preds) in lists.iter().enumerate() {
            seen.clear();
            for &predecessor in preds {
                if predecessor >= feature {
                    return Err(PrecisionError::OutOfOrderPredecessor {
                        feature,
                        predecessor,
                    });
                }
                if !seen.insert(predecessor) {
                    return Err(PrecisionError::DuplicatePredecessor {
                        feature,
                        predecessor,
                    });
                }
            }
        }
        Ok(Self { lists })
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn get(&self, feature: usize) -> Option<&[usize]> {
        self.lists.get(feature).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[usize]> + '_ {
        self.lists.iter().map(Vec::as_slice)
    }

    /// Total number of predecessor links, i.e. off-diagonal entries of `T`.
    pub fn total_links(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }
}

/// Outcome of one feature's regression.
#[derive(Debug, Clone)]
pub struct FeatureFit {
    /// Ridge coefficients, aligned with the feature's predecessor list.
    pub coefficients: Array1<f64>,
    /// Residual variance, or the raw column variance without predecessors.
    pub residual_variance: f64,
    /// `D[i, i]` after the optional variance floor.
    pub precision: f64,
}

/// The factors `T` (unit lower-triangular coefficients) and `D` (diagonal
/// precisions) of `B⁻¹ = Tᵗ·D·T`.
#[derive(Debug, Clone)]
pub struct PrecisionDecomposition {
    pub t: SparseFactor,
    pub d: SparseFactor,
}

impl PrecisionDecomposition {
    pub fn n_features(&self) -> usize {
        self.t.nrows()
    }

    /// Reconstructs the precision matrix `Tᵗ·D·T`.
    pub fn precision_matrix(&self) -> Result<SparseFactor, PrecisionError> {
        self.t.weighted_gram(&self.d.diagonal())
    }
}

fn validate_config(config: &EstimatorConfig) -> Result<(), PrecisionError> {
    if !(config.alpha.is_finite() && config.alpha > 0.0) {
        return Err(PrecisionError::InvalidAlpha(config.alpha));
    }
    if let Some(floor) = config.variance_floor
        && !(floor.is_finite() && floor > 0.0)
    {
        return Err(PrecisionError::InvalidVarianceFloor(floor));
    }
    Ok(())
}

fn precision_from_variance(feature: usize, variance: f64, floor: Option<f64>) -> f64 {
    let effective = match floor {
        Some(floor) if variance < floor => floor,
        _ => variance,
    };
    let precision = 1.0 / effective;
    if !precision.is_finite() || precision <= 0.0 {
        log::warn!(
            "feature {feature}: residual variance {variance:.3e} gives precision {precision}"
        );
    }
    precision
}

fn fit_feature(
    ensemble: ArrayView2<'_, f64>,
    feature: usize,
    predecessors: &[usize],
    config: &EstimatorConfig,
) -> Result<FeatureFit, PrecisionError> {
    let y = ensemble.column(feature);
    let (coefficients, residual_variance) = if predecessors.is_empty() {
        (Array1::zeros(0), population_variance(y))
    } else {
        let x = ensemble.select(Axis(1), predecessors);
        let fit = fit_ridge_no_intercept(x.view(), y, config.alpha)
            .map_err(|source| PrecisionError::RegressionFailed { feature, source })?;
        (fit.coefficients, population_variance(fit.residuals.view()))
    };
    Ok(FeatureFit {
        coefficients,
        residual_variance,
        precision: precision_from_variance(feature, residual_variance, config.variance_floor),
    })
}

fn fit_all(
    ensemble: ArrayView2<'_, f64>,
    predecessors: &OrderedPredecessors,
    config: &EstimatorConfig,
) -> Result<Vec<FeatureFit>, PrecisionError> {
    let n = predecessors.len();
    let fit_one = |feature: usize| {
        let preds = &predecessors.lists[feature];
        fit_feature(ensemble, feature, preds, config)
    };
    if n >= config.parallel_threshold {
        log::debug!("fitting {n} features in parallel");
        (0..n).into_par_iter().map(fit_one).collect()
    } else {
        (0..n).map(fit_one).collect()
    }
}

fn assemble(
    predecessors: &OrderedPredecessors,
    fits: &[FeatureFit],
) -> Result<PrecisionDecomposition, PrecisionError> {
    let n = fits.len();
    let mut t_triplets = Vec::with_capacity(n + predecessors.total_links());
    for (feature, (preds, fit)) in predecessors.iter().zip(fits).enumerate() {
        t_triplets.push(Triplet::new(feature, feature, 1.0));
        for (&predecessor, &coef) in preds.iter().zip(fit.coefficients.iter()) {
            t_triplets.push(Triplet::new(feature, predecessor, -coef));
        }
    }
    let precisions: Vec<f64> = fits.iter().map(|fit| fit.precision).collect();
    Ok(PrecisionDecomposition {
        t: SparseFactor::from_triplets(n, n, &t_triplets)?,
        d: SparseFactor::from_diagonal(&precisions)?,
    })
}

fn validate_inputs(
    ensemble: &ArrayView2<'_, f64>,
    predecessors: &OrderedPredecessors,
    n: usize,
    config: &EstimatorConfig,
) -> Result<(), PrecisionError> {
    if n == 0 {
        return Err(PrecisionError::NoFeatures);
    }
    if predecessors.len() != n {
        return Err(PrecisionError::PredecessorCountMismatch {
            expected: n,
            found: predecessors.len(),
        });
    }
    if ensemble.ncols() != n {
        return Err(PrecisionError::FeatureCountMismatch {
            expected: n,
            found: ensemble.ncols(),
        });
    }
    if ensemble.nrows() == 0 {
        return Err(PrecisionError::NoSamples);
    }
    validate_config(config)
}

/// Runs one ridge regression per feature and assembles `T` and `D`.
///
/// `ensemble` is samples × features with columns in the same order the
/// predecessor lists were built for.
pub fn estimate_precision(
    ensemble: ArrayView2<'_, f64>,
    predecessors: &OrderedPredecessors,
    config: &EstimatorConfig,
) -> Result<PrecisionDecomposition, PrecisionError> {
    validate_inputs(&ensemble, predecessors, predecessors.len(), config)?;
    let fits = fit_all(ensemble, predecessors, config)?;
    assemble(predecessors, &fits)
}

/// Eagerly fitted estimator that keeps the per-feature fits and memoizes the
/// reconstructed precision matrix.
pub struct PrecisionEstimator {
    config: EstimatorConfig,
    fits: Vec<FeatureFit>,
    decomposition: PrecisionDecomposition,
    precision: OnceLock<SparseFactor>,
}

impl PrecisionEstimator {
    /// `ensemble` may have any dimensionality at the type level; anything but
    /// a 2D samples × features matrix is rejected.
    pub fn new<S, D>(
        ensemble: &ArrayBase<S, D>,
        predecessors: &OrderedPredecessors,
        n: usize,
        config: EstimatorConfig,
    ) -> Result<Self, PrecisionError>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let ensemble = ensemble
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| PrecisionError::InvalidEnsembleRank(ensemble.ndim()))?;
        validate_inputs(&ensemble, predecessors, n, &config)?;
        let fits = fit_all(ensemble, predecessors, &config)?;
        let decomposition = assemble(predecessors, &fits)?;
        log::debug!(
            "estimated precision factors: {} features, {} samples, nnz(T) = {}",
            n,
            ensemble.nrows(),
            decomposition.t.nnz()
        );
        Ok(Self {
            config,
            fits,
            decomposition,
            precision: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn n_features(&self) -> usize {
        self.fits.len()
    }

    pub fn feature_fits(&self) -> &[FeatureFit] {
        &self.fits
    }

    /// The factors `(T, D)`.
    pub fn decomposition(&self) -> (&SparseFactor, &SparseFactor) {
        (&self.decomposition.t, &self.decomposition.d)
    }

    pub fn into_decomposition(self) -> PrecisionDecomposition {
        self.decomposition
    }

    /// `Tᵗ·D·T`, computed on first use.
    pub fn precision_matrix(&self) -> Result<&SparseFactor, PrecisionError> {
        if let Some(cached) = self.precision.get() {
            return Ok(cached);
        }
        let computed = self.decomposition.precision_matrix()?;
        Ok(self.precision.get_or_init(|| computed))
    }
}
