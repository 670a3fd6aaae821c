//! Field geometry: the 4D shape descriptor, grid points, and the two point
//! orders used to flatten a field into feature columns.

use ndarray::{Array2, ArrayView5, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of axes of a field: layer, variable, latitude, longitude.
pub const FIELD_RANK: usize = 4;

const AXIS_NAMES: [&str; FIELD_RANK] = ["layer", "variable", "latitude", "longitude"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("A field needs 4 axes (layer, variable, latitude, longitude), but {0} were given.")]
    InvalidRank(usize),

    #[error("Field axis '{0}' has zero length.")]
    EmptyAxis(&'static str),

    #[error("A grid point needs exactly 4 coordinates, but {0} were given.")]
    InvalidPointArity(usize),

    #[error("Stencil radius must be a positive integer, but was {0}.")]
    InvalidRadius(usize),

    #[error("An ensemble needs at least one member.")]
    EmptyEnsemble,
}

/// Extents of a (layer, variable, latitude, longitude) field. Every axis is
/// non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[usize; 4]", into = "[usize; 4]")]
pub struct FieldShape {
    layers: usize,
    variables: usize,
    latitudes: usize,
    longitudes: usize,
}

impl FieldShape {
    pub fn new(
        layers: usize,
        variables: usize,
        latitudes: usize,
        longitudes: usize,
    ) -> Result<Self, GridError> {
        Self::from_dims(&[layers, variables, latitudes, longitudes])
    }

    /// Builds a shape from a dynamic dimension list, e.g. `array.shape()`.
    pub fn from_dims(dims: &[usize]) -> Result<Self, GridError> {
        if dims.len() != FIELD_RANK {
            return Err(GridError::InvalidRank(dims.len()));
        }
        for (name, &extent) in AXIS_NAMES.iter().zip(dims) {
            if extent == 0 {
                return Err(GridError::EmptyAxis(name));
            }
        }
        Ok(Self {
            layers: dims[0],
            variables: dims[1],
            latitudes: dims[2],
            longitudes: dims[3],
        })
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn variables(&self) -> usize {
        self.variables
    }

    pub fn latitudes(&self) -> usize {
        self.latitudes
    }

    pub fn longitudes(&self) -> usize {
        self.longitudes
    }

    pub fn dims(&self) -> [usize; FIELD_RANK] {
        [self.layers, self.variables, self.latitudes, self.longitudes]
    }

    /// Total number of grid points (features once flattened).
    pub fn len(&self) -> usize {
        self.layers * self.variables * self.latitudes * self.longitudes
    }

    /// Always false: construction rejects zero-length axes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cell addressed by `point`, or `None` when any coordinate is
    /// negative or past its axis.
    pub fn cell(&self, point: GridPoint) -> Option<GridCell> {
        let coord = |value: i64, extent: usize| -> Option<usize> {
            usize::try_from(value).ok().filter(|&v| v < extent)
        };
        Some(GridCell {
            layer: coord(point.layer, self.layers)?,
            variable: coord(point.variable, self.variables)?,
            latitude: coord(point.latitude, self.latitudes)?,
            longitude: coord(point.longitude, self.longitudes)?,
        })
    }

    /// Every cell in traversal order: layer, then variable, then longitude,
    /// with latitude varying fastest. Position in this sequence is the
    /// [`PointOrder::Elimination`] index of the cell.
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        (0..self.layers).flat_map(move |layer| {
            (0..self.variables).flat_map(move |variable| {
                (0..self.longitudes).flat_map(move |longitude| {
                    (0..self.latitudes).map(move |latitude| GridCell {
                        layer,
                        variable,
                        latitude,
                        longitude,
                    })
                })
            })
        })
    }
}

impl TryFrom<[usize; 4]> for FieldShape {
    type Error = GridError;

    fn try_from(dims: [usize; 4]) -> Result<Self, Self::Error> {
        Self::from_dims(&dims)
    }
}

impl From<FieldShape> for [usize; 4] {
    fn from(shape: FieldShape) -> Self {
        shape.dims()
    }
}

/// A possibly out-of-range query coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridPoint {
    pub layer: i64,
    pub variable: i64,
    pub latitude: i64,
    pub longitude: i64,
}

impl GridPoint {
    pub const fn new(layer: i64, variable: i64, latitude: i64, longitude: i64) -> Self {
        Self {
            layer,
            variable,
            latitude,
            longitude,
        }
    }
}

impl From<(i64, i64, i64, i64)> for GridPoint {
    fn from((layer, variable, latitude, longitude): (i64, i64, i64, i64)) -> Self {
        Self::new(layer, variable, latitude, longitude)
    }
}

impl TryFrom<&[i64]> for GridPoint {
    type Error = GridError;

    fn try_from(coords: &[i64]) -> Result<Self, Self::Error> {
        match coords {
            &[layer, variable, latitude, longitude] => {
                Ok(Self::new(layer, variable, latitude, longitude))
            }
            other => Err(GridError::InvalidPointArity(other.len())),
        }
    }
}

impl From<GridCell> for GridPoint {
    fn from(cell: GridCell) -> Self {
        // Axis extents fit in memory, so they fit in i64.
        Self::new(
            cell.layer as i64,
            cell.variable as i64,
            cell.latitude as i64,
            cell.longitude as i64,
        )
    }
}

/// An in-range grid coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    pub layer: usize,
    pub variable: usize,
    pub latitude: usize,
    pub longitude: usize,
}

impl GridCell {
    pub const fn new(layer: usize, variable: usize, latitude: usize, longitude: usize) -> Self {
        Self {
            layer,
            variable,
            latitude,
            longitude,
        }
    }
}

/// True iff every coordinate of `point` lies in `[0, extent)` of its axis.
pub fn validate_point(shape: &FieldShape, point: GridPoint) -> bool {
    shape.cell(point).is_some()
}

/// Edge behavior of a spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisBoundary {
    /// Windows are clipped to `[0, extent)`.
    Bounded,
    /// Windows wrap modulo the axis extent.
    #[default]
    Periodic,
}

impl AxisBoundary {
    pub fn from_periodic(periodic: bool) -> Self {
        if periodic { Self::Periodic } else { Self::Bounded }
    }

    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Periodic)
    }
}

/// How a grid cell maps to a flat feature index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointOrder {
    /// `m·V·K·L + k·V·L + v·L + l`: layer fastest, longitude slowest.
    #[default]
    Canonical,
    /// Rank in the layer → variable → longitude → latitude traversal,
    /// `((l·V + v)·M + m)·K + k`. Every predecessor of a cell has a strictly
    /// smaller rank under this order.
    Elimination,
}

impl PointOrder {
    pub fn index(self, shape: &FieldShape, cell: GridCell) -> usize {
        let [n_layers, n_vars, n_lats, n_lons] = shape.dims();
        match self {
            Self::Canonical => {
                cell.longitude * n_vars * n_lats * n_layers
                    + cell.latitude * n_vars * n_layers
                    + cell.variable * n_layers
                    + cell.layer
            }
            Self::Elimination => {
                ((cell.layer * n_vars + cell.variable) * n_lons + cell.longitude) * n_lats
                    + cell.latitude
            }
        }
    }

    /// Inverse of [`PointOrder::index`].
    pub fn cell(self, shape: &FieldShape, index: usize) -> Option<GridCell> {
        if index >= shape.len() {
            return None;
        }
        let [n_layers, n_vars, n_lats, n_lons] = shape.dims();
        let cell = match self {
            Self::Canonical => {
                let layer = index % n_layers;
                let rest = index / n_layers;
                let variable = rest % n_vars;
                let rest = rest / n_vars;
                GridCell::new(layer, variable, rest % n_lats, rest / n_lats)
            }
            Self::Elimination => {
                let latitude = index % n_lats;
                let rest = index / n_lats;
                let longitude = rest % n_lons;
                let rest = rest / n_lons;
                GridCell::new(rest / n_vars, rest % n_vars, latitude, longitude)
            }
        };
        Some(cell)
    }
}

/// Reshapes a `(members, layers, variables, latitudes, longitudes)` ensemble
/// into a `members × features` matrix with columns laid out in `order`.
pub fn ensemble_matrix(
    fields: ArrayView5<'_, f64>,
    order: PointOrder,
) -> Result<Array2<f64>, GridError> {
    let (members, layers, variables, latitudes, longitudes) = fields.dim();
    if members == 0 {
        return Err(GridError::EmptyEnsemble);
    }
    let shape = FieldShape::new(layers, variables, latitudes, longitudes)?;
    let mut out = Array2::<f64>::zeros((members, shape.len()));
    for cell in shape.cells() {
        let column = order.index(&shape, cell);
        out.column_mut(column).assign(&fields.slice(s![
            ..,
            cell.layer,
            cell.variable,
            cell.latitude,
            cell.longitude
        ]));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array5;

    fn shape() -> FieldShape {
        FieldShape::new(2, 3, 4, 5).unwrap()
    }

    #[test]
    fn from_dims_rejects_wrong_rank_and_empty_axes() {
        assert_eq!(
            FieldShape::from_dims(&[2, 2]),
            Err(GridError::InvalidRank(2))
        );
        assert_eq!(
            FieldShape::from_dims(&[2, 0, 3, 3]),
            Err(GridError::EmptyAxis("variable"))
        );
        assert_eq!(shape().len(), 120);
    }

    #[test]
    fn validate_point_checks_each_axis() {
        let shape = shape();
        assert!(validate_point(&shape, GridPoint::new(0, 0, 0, 0)));
        assert!(validate_point(&shape, GridPoint::new(1, 2, 3, 4)));
        assert!(!validate_point(&shape, GridPoint::new(2, 0, 0, 0)));
        assert!(!validate_point(&shape, GridPoint::new(0, 3, 0, 0)));
        assert!(!validate_point(&shape, GridPoint::new(0, 0, 4, 0)));
        assert!(!validate_point(&shape, GridPoint::new(0, 0, 0, 5)));
        assert!(!validate_point(&shape, GridPoint::new(0, -1, 0, 0)));
    }

    #[test]
    fn point_from_slice_requires_four_coordinates() {
        let three: &[i64] = &[0, 0, 0];
        assert_eq!(
            GridPoint::try_from(three),
            Err(GridError::InvalidPointArity(3))
        );
        let four: &[i64] = &[1, 2, 3, 4];
        assert_eq!(GridPoint::try_from(four), Ok(GridPoint::new(1, 2, 3, 4)));
    }

    #[test]
    fn canonical_index_matches_layer_fastest_formula() {
        let shape = shape();
        let cell = GridCell::new(1, 2, 3, 4);
        assert_eq!(
            PointOrder::Canonical.index(&shape, cell),
            4 * 3 * 4 * 2 + 3 * 3 * 2 + 2 * 2 + 1
        );
    }

    #[test]
    fn orders_are_bijections_and_cells_follow_elimination_rank() {
        let shape = shape();
        for (rank, cell) in shape.cells().enumerate() {
            assert_eq!(PointOrder::Elimination.index(&shape, cell), rank);
            assert_eq!(PointOrder::Elimination.cell(&shape, rank), Some(cell));
            let canonical = PointOrder::Canonical.index(&shape, cell);
            assert_eq!(PointOrder::Canonical.cell(&shape, canonical), Some(cell));
        }
        assert_eq!(PointOrder::Canonical.cell(&shape, shape.len()), None);
    }

    #[test]
    fn shape_round_trips_through_serde_and_validates() {
        let json = serde_json::to_string(&shape()).unwrap();
        assert_eq!(json, "[2,3,4,5]");
        let parsed: FieldShape = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, shape());
        assert!(serde_json::from_str::<FieldShape>("[2,0,4,5]").is_err());
    }

    #[test]
    fn ensemble_matrix_places_values_by_order() {
        let fields = Array5::from_shape_fn((3, 2, 2, 2, 3), |(e, l, v, k, m)| {
            (e * 10_000 + l * 1000 + v * 100 + k * 10 + m) as f64
        });
        let shape = FieldShape::new(2, 2, 2, 3).unwrap();
        for order in [PointOrder::Canonical, PointOrder::Elimination] {
            let matrix = ensemble_matrix(fields.view(), order).unwrap();
            assert_eq!(matrix.dim(), (3, 24));
            for cell in shape.cells() {
                let col = order.index(&shape, cell);
                for e in 0..3 {
                    assert_eq!(
                        matrix[[e, col]],
                        fields[[e, cell.layer, cell.variable, cell.latitude, cell.longitude]]
                    );
                }
            }
        }
    }

    #[test]
    fn ensemble_matrix_rejects_empty_ensemble() {
        let fields = Array5::<f64>::zeros((0, 1, 1, 1, 1));
        assert_eq!(
            ensemble_matrix(fields.view(), PointOrder::Elimination),
            Err(GridError::EmptyEnsemble)
        );
    }
}
