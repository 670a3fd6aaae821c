#![deny(dead_code)]
#![deny(unused_imports)]

pub mod faer_ndarray;
pub mod grid;
pub mod precision;
pub mod predecessor;
pub mod regression;
pub mod sparse;
pub mod types;

pub use grid::{
    AxisBoundary, FieldShape, GridCell, GridError, GridPoint, PointOrder, ensemble_matrix,
    validate_point,
};
pub use precision::{
    FeatureFit, OrderedPredecessors, PrecisionDecomposition, PrecisionError, PrecisionEstimator,
    estimate_precision,
};
pub use predecessor::{
    PredecessorIndex, Stencil, WindowBounds, axis_indices, bounds, flatten, get_point_predecessors,
    positions, predecessor_values,
};
pub use sparse::{CooTriplets, SparseFactor};
pub use types::{EstimatorConfig, RunConfig, StencilConfig};
