use crate::grid::{FieldShape, GridError};
use crate::predecessor::Stencil;
use serde::{Deserialize, Serialize};

pub fn default_alpha() -> f64 {
    1.0
}

pub fn default_parallel_threshold() -> usize {
    256
}

pub fn default_periodic() -> bool {
    true
}

/// Regression and assembly settings for the precision estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Ridge penalty; must be positive.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Lower bound applied to residual variances before inversion. `None`
    /// leaves zero-variance features with an infinite precision.
    #[serde(default)]
    pub variance_floor: Option<f64>,
    /// Feature count at which regressions run on the rayon pool.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            variance_floor: None,
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

impl EstimatorConfig {
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            alpha,
            ..Self::default()
        }
    }
}

/// Serializable stencil description; validated by [`StencilConfig::stencil`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StencilConfig {
    pub radius: usize,
    #[serde(default = "default_periodic")]
    pub x_periodic: bool,
    #[serde(default = "default_periodic")]
    pub y_periodic: bool,
}

impl StencilConfig {
    pub fn stencil(&self) -> Result<Stencil, GridError> {
        Stencil::new(self.radius, self.x_periodic, self.y_periodic)
    }
}

/// Everything needed to go from a flattened ensemble to precision factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub shape: FieldShape,
    pub stencil: StencilConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
}
