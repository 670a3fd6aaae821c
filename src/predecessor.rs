//! Predecessor neighborhoods over a 4D field.
//!
//! For a cell `(l, v, k, m)` the predecessor set is the union of four
//! disjoint groups, each a Cartesian product of axis ranges:
//!
//! 1. earlier layers, every variable, every cell of the spatial window;
//! 2. the same layer, earlier variables, every cell of the window;
//! 3. the same layer and variable, earlier longitudes, the window's latitudes;
//! 4. the same column, earlier latitudes.
//!
//! The window is a square stencil of half-width `radius` around `(k, m)`.
//! Each spatial axis is either clipped at the field edge or wrapped modulo
//! its extent. Groups 3 and 4 never wrap, so every predecessor comes before
//! the query cell in the [`PointOrder::Elimination`] traversal.

use crate::grid::{AxisBoundary, FieldShape, GridCell, GridError, GridPoint, PointOrder};
use crate::precision::{OrderedPredecessors, PrecisionError};
use ndarray::{Array1, ArrayBase, ArrayView4, Data, Dimension};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

const PAR_THRESHOLD: usize = 1024;

/// Spatial neighborhood: a positive radius plus the edge behavior of the
/// longitude (x) and latitude (y) axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stencil {
    radius: usize,
    longitude: AxisBoundary,
    latitude: AxisBoundary,
}

impl Stencil {
    pub fn new(radius: usize, x_periodic: bool, y_periodic: bool) -> Result<Self, GridError> {
        Self::with_boundaries(
            radius,
            AxisBoundary::from_periodic(x_periodic),
            AxisBoundary::from_periodic(y_periodic),
        )
    }

    /// A stencil that wraps on both spatial axes.
    pub fn periodic(radius: usize) -> Result<Self, GridError> {
        Self::new(radius, true, true)
    }

    pub fn with_boundaries(
        radius: usize,
        longitude: AxisBoundary,
        latitude: AxisBoundary,
    ) -> Result<Self, GridError> {
        if radius == 0 {
            return Err(GridError::InvalidRadius(radius));
        }
        Ok(Self {
            radius,
            longitude,
            latitude,
        })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn longitude(&self) -> AxisBoundary {
        self.longitude
    }

    pub fn latitude(&self) -> AxisBoundary {
        self.latitude
    }
}

/// Half-open window extents around a cell. On a periodic axis the bounds are
/// unclipped and may fall outside `[0, extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub lat_min: i64,
    pub lat_max: i64,
    pub lon_min: i64,
    pub lon_max: i64,
}

fn axis_window(center: usize, radius: usize, extent: usize, boundary: AxisBoundary) -> (i64, i64) {
    let (center, radius) = (center as i64, radius as i64);
    let (lo, hi) = (center - radius, center + radius + 1);
    match boundary {
        AxisBoundary::Bounded => (lo.max(0), hi.min(extent as i64)),
        AxisBoundary::Periodic => (lo, hi),
    }
}

/// Window extents of `cell` under `stencil`. Upper bounds are exclusive and
/// equal the axis extent when a bounded window reaches the edge.
pub fn bounds(shape: &FieldShape, cell: GridCell, stencil: &Stencil) -> WindowBounds {
    let (lat_min, lat_max) = axis_window(
        cell.latitude,
        stencil.radius,
        shape.latitudes(),
        stencil.latitude,
    );
    let (lon_min, lon_max) = axis_window(
        cell.longitude,
        stencil.radius,
        shape.longitudes(),
        stencil.longitude,
    );
    WindowBounds {
        lat_min,
        lat_max,
        lon_min,
        lon_max,
    }
}

fn wrapped_range(min: i64, max: i64, extent: usize) -> Vec<usize> {
    let extent = extent as i64;
    (min..max)
        .map(|x| x.rem_euclid(extent) as usize)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sorted, deduplicated latitude and longitude positions covered by the
/// window after reduction modulo each axis extent. An empty latitude set
/// falls back to `lat_fallback`.
pub fn axis_indices(
    shape: &FieldShape,
    window: &WindowBounds,
    lat_fallback: usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut lat = wrapped_range(window.lat_min, window.lat_max, shape.latitudes());
    let lon = wrapped_range(window.lon_min, window.lon_max, shape.longitudes());
    if lat.is_empty() {
        lat.push(lat_fallback);
    }
    (lat, lon)
}

/// The four predecessor groups of `cell`, in group order.
///
/// Within groups 1 and 2 longitude varies slowest, then latitude, then layer,
/// with variable fastest. Group 3 is ordered by longitude then latitude.
pub fn positions(
    cell: GridCell,
    shape: &FieldShape,
    lat_indices: &[usize],
    lon_indices: &[usize],
    window: &WindowBounds,
) -> Vec<GridCell> {
    let lon_start = usize::try_from(window.lon_min).unwrap_or(0);
    let lat_start = usize::try_from(window.lat_min).unwrap_or(0);
    let window_size = lat_indices.len() * lon_indices.len();
    let mut out = Vec::with_capacity(
        window_size * (cell.layer * shape.variables() + cell.variable)
            + lat_indices.len() * cell.longitude.saturating_sub(lon_start)
            + cell.latitude.saturating_sub(lat_start),
    );

    for &longitude in lon_indices {
        for &latitude in lat_indices {
            for layer in 0..cell.layer {
                for variable in 0..shape.variables() {
                    out.push(GridCell::new(layer, variable, latitude, longitude));
                }
            }
        }
    }

    for &longitude in lon_indices {
        for &latitude in lat_indices {
            for variable in 0..cell.variable {
                out.push(GridCell::new(cell.layer, variable, latitude, longitude));
            }
        }
    }

    for longitude in lon_start..cell.longitude {
        for &latitude in lat_indices {
            out.push(GridCell::new(cell.layer, cell.variable, latitude, longitude));
        }
    }

    for latitude in lat_start..cell.latitude {
        out.push(GridCell::new(
            cell.layer,
            cell.variable,
            latitude,
            cell.longitude,
        ));
    }

    out
}

/// Canonical flat index of every position.
pub fn flatten(positions: &[GridCell], shape: &FieldShape) -> Vec<usize> {
    flatten_with(positions, shape, PointOrder::Canonical)
}

pub fn flatten_with(positions: &[GridCell], shape: &FieldShape, order: PointOrder) -> Vec<usize> {
    positions
        .iter()
        .map(|&cell| order.index(shape, cell))
        .collect()
}

fn predecessor_cells(shape: &FieldShape, cell: GridCell, stencil: &Stencil) -> Vec<GridCell> {
    let window = bounds(shape, cell, stencil);
    let (lat, lon) = axis_indices(shape, &window, cell.latitude);
    positions(cell, shape, &lat, &lon, &window)
}

/// Canonical flat indices of the predecessors of `point`. A point outside
/// the field has no predecessors.
pub fn get_point_predecessors(
    shape: &FieldShape,
    point: GridPoint,
    stencil: &Stencil,
) -> Vec<usize> {
    match shape.cell(point) {
        Some(cell) => flatten(&predecessor_cells(shape, cell, stencil), shape),
        None => Vec::new(),
    }
}

/// Values of `field` at the predecessors of `point`, in predecessor order.
pub fn predecessor_values(
    field: ArrayView4<'_, f64>,
    point: GridPoint,
    stencil: &Stencil,
) -> Result<Array1<f64>, GridError> {
    let shape = FieldShape::from_dims(field.shape())?;
    let Some(cell) = shape.cell(point) else {
        return Ok(Array1::zeros(0));
    };
    Ok(predecessor_cells(&shape, cell, stencil)
        .into_iter()
        .map(|c| field[[c.layer, c.variable, c.latitude, c.longitude]])
        .collect())
}

type PredecessorLists = Arc<Vec<Vec<usize>>>;

/// Predecessor lookup bound to one field shape, with whole-grid results
/// memoized per (stencil, order).
pub struct PredecessorIndex {
    shape: FieldShape,
    cache: RwLock<HashMap<(Stencil, PointOrder), PredecessorLists>>,
}

impl PredecessorIndex {
    pub fn new(shape: FieldShape) -> Self {
        Self {
            shape,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Index for the shape of `field`, which must be 4-dimensional.
    pub fn from_field<S, D>(field: &ArrayBase<S, D>) -> Result<Self, GridError>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        Ok(Self::new(FieldShape::from_dims(field.shape())?))
    }

    pub fn shape(&self) -> FieldShape {
        self.shape
    }

    pub fn get_point_predecessors(&self, point: GridPoint, stencil: &Stencil) -> Vec<usize> {
        get_point_predecessors(&self.shape, point, stencil)
    }

    /// Canonical predecessor indices of every cell, one entry per cell in
    /// traversal order (layer, variable, longitude, latitude).
    pub fn get_all_predecessors(&self, stencil: &Stencil) -> PredecessorLists {
        self.cached(stencil, PointOrder::Canonical)
    }

    /// Predecessor lists renumbered to elimination ranks, ready for
    /// [`crate::precision::PrecisionEstimator`]. Feature `i` is the `i`-th
    /// cell of the traversal; pair with
    /// [`crate::grid::ensemble_matrix`] under [`PointOrder::Elimination`].
    pub fn ordered_predecessors(
        &self,
        stencil: &Stencil,
    ) -> Result<OrderedPredecessors, PrecisionError> {
        OrderedPredecessors::from_shared(self.cached(stencil, PointOrder::Elimination))
    }

    /// Number of distinct (stencil, order) results held in the cache.
    pub fn cached_entries(&self) -> usize {
        self.read_cache().len()
    }

    fn cached(&self, stencil: &Stencil, order: PointOrder) -> PredecessorLists {
        let key = (*stencil, order);
        if let Some(hit) = self.read_cache().get(&key) {
            return Arc::clone(hit);
        }
        let computed = Arc::new(self.compute(stencil, order));
        let mut cache = self.write_cache();
        // A concurrent writer may have won; keep whichever landed first.
        Arc::clone(cache.entry(key).or_insert(computed))
    }

    fn compute(&self, stencil: &Stencil, order: PointOrder) -> Vec<Vec<usize>> {
        let shape = self.shape;
        let lists_for = |cell: GridCell| {
            flatten_with(&predecessor_cells(&shape, cell, stencil), &shape, order)
        };
        let cells: Vec<GridCell> = shape.cells().collect();
        log::debug!(
            "computing predecessors for {} cells (radius {}, order {:?})",
            cells.len(),
            stencil.radius,
            order
        );
        if cells.len() >= PAR_THRESHOLD {
            cells.into_par_iter().map(lists_for).collect()
        } else {
            cells.into_iter().map(lists_for).collect()
        }
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<(Stencil, PointOrder), PredecessorLists>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<(Stencil, PointOrder), PredecessorLists>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use std::collections::HashSet;

    fn shape() -> FieldShape {
        FieldShape::new(2, 3, 4, 5).unwrap()
    }

    fn bounded(radius: usize) -> Stencil {
        Stencil::new(radius, false, false).unwrap()
    }

    #[test]
    fn stencil_rejects_zero_radius() {
        assert_eq!(Stencil::periodic(0), Err(GridError::InvalidRadius(0)));
    }

    #[test]
    fn bounded_window_clips_to_half_open_extent() {
        let shape = shape();
        let window = bounds(&shape, GridCell::new(1, 2, 0, 0), &bounded(1));
        assert_eq!(
            window,
            WindowBounds {
                lat_min: 0,
                lat_max: 2,
                lon_min: 0,
                lon_max: 2
            }
        );
        let window = bounds(&shape, GridCell::new(0, 0, 3, 4), &bounded(2));
        assert_eq!((window.lat_min, window.lat_max), (1, 4));
        assert_eq!((window.lon_min, window.lon_max), (2, 5));
    }

    #[test]
    fn periodic_window_wraps_indices() {
        let shape = shape();
        let window = bounds(&shape, GridCell::new(0, 0, 0, 0), &Stencil::periodic(1).unwrap());
        assert_eq!((window.lat_min, window.lat_max), (-1, 2));
        let (lat, lon) = axis_indices(&shape, &window, 0);
        assert_eq!(lat, vec![0, 1, 3]);
        assert_eq!(lon, vec![0, 1, 4]);
    }

    #[test]
    fn wide_periodic_window_covers_axis_once() {
        let shape = shape();
        let window = bounds(&shape, GridCell::new(0, 0, 1, 1), &Stencil::periodic(7).unwrap());
        let (lat, lon) = axis_indices(&shape, &window, 1);
        assert_eq!(lat, vec![0, 1, 2, 3]);
        assert_eq!(lon, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_latitude_window_falls_back_to_point() {
        let shape = shape();
        let window = WindowBounds {
            lat_min: 2,
            lat_max: 2,
            lon_min: 0,
            lon_max: 1,
        };
        let (lat, lon) = axis_indices(&shape, &window, 2);
        assert_eq!(lat, vec![2]);
        assert_eq!(lon, vec![0]);
    }

    #[test]
    fn interior_point_count_matches_closed_form() {
        let shape = FieldShape::new(3, 2, 9, 9).unwrap();
        for radius in 1..=3 {
            let width = 2 * radius + 1;
            let window = width * width;
            for stencil in [bounded(radius), Stencil::periodic(radius).unwrap()] {
                let point = GridPoint::new(2, 1, 4, 4);
                let got = get_point_predecessors(&shape, point, &stencil).len();
                let expected = 2 * 2 * window + window + radius * width + radius;
                assert_eq!(got, expected, "radius {radius}, stencil {stencil:?}");
            }
        }
    }

    #[test]
    fn predecessors_exclude_self_and_are_unique() {
        let shape = shape();
        for stencil in [bounded(1), Stencil::periodic(2).unwrap()] {
            for cell in shape.cells() {
                let own = PointOrder::Canonical.index(&shape, cell);
                let preds = get_point_predecessors(&shape, cell.into(), &stencil);
                assert!(!preds.contains(&own));
                let unique: HashSet<_> = preds.iter().copied().collect();
                assert_eq!(unique.len(), preds.len());
            }
        }
    }

    #[test]
    fn predecessors_precede_in_elimination_order() {
        let shape = shape();
        let index = PredecessorIndex::new(shape);
        for stencil in [
            bounded(1),
            Stencil::periodic(1).unwrap(),
            Stencil::new(2, true, false).unwrap(),
        ] {
            let ordered = index.get_all_predecessors(&stencil);
            for (cell, preds) in shape.cells().zip(ordered.iter()) {
                let rank = PointOrder::Elimination.index(&shape, cell);
                for &p in preds {
                    let pred_cell = PointOrder::Canonical.cell(&shape, p).unwrap();
                    assert!(PointOrder::Elimination.index(&shape, pred_cell) < rank);
                }
            }
        }
    }

    #[test]
    fn periodic_origin_includes_far_end_predecessors() {
        let shape = shape();
        let point = GridPoint::new(1, 0, 0, 0);
        let preds = get_point_predecessors(&shape, point, &Stencil::periodic(1).unwrap());
        let far_lon = PointOrder::Canonical.index(&shape, GridCell::new(0, 0, 0, 4));
        let far_lat = PointOrder::Canonical.index(&shape, GridCell::new(0, 0, 3, 0));
        assert!(preds.contains(&far_lon));
        assert!(preds.contains(&far_lat));

        let clipped = get_point_predecessors(&shape, point, &bounded(1));
        assert!(!clipped.contains(&far_lon));
        assert!(!clipped.contains(&far_lat));
    }

    #[test]
    fn bounded_corner_is_smaller_than_periodic() {
        let shape = shape();
        let point = GridPoint::new(1, 2, 0, 0);
        let clipped = get_point_predecessors(&shape, point, &bounded(1));
        let wrapped = get_point_predecessors(&shape, point, &Stencil::periodic(1).unwrap());
        // 2x2 window: one earlier layer with 3 variables, plus 2 earlier variables.
        assert_eq!(clipped.len(), 4 * 3 + 4 * 2);
        // 3x3 window, groups 3 and 4 empty at the origin.
        assert_eq!(wrapped.len(), 9 * 3 + 9 * 2);
        assert!(clipped.len() < wrapped.len());
    }

    #[test]
    fn out_of_range_point_has_no_predecessors() {
        let shape = shape();
        let stencil = Stencil::periodic(1).unwrap();
        assert!(get_point_predecessors(&shape, GridPoint::new(2, 0, 0, 0), &stencil).is_empty());
        assert!(get_point_predecessors(&shape, GridPoint::new(0, 0, -1, 0), &stencil).is_empty());
    }

    #[test]
    fn first_cell_has_no_predecessors() {
        let shape = shape();
        let preds = get_point_predecessors(&shape, GridPoint::new(0, 0, 0, 0), &bounded(1));
        assert!(preds.is_empty());
    }

    #[test]
    fn groups_three_and_four_follow_the_window() {
        let shape = FieldShape::new(1, 1, 4, 5).unwrap();
        let point = GridPoint::new(0, 0, 2, 3);
        let preds = get_point_predecessors(&shape, point, &bounded(1));
        let expected: Vec<usize> = [(1, 2), (2, 2), (3, 2), (1, 3)]
            .iter()
            .map(|&(k, m)| PointOrder::Canonical.index(&shape, GridCell::new(0, 0, k, m)))
            .collect();
        assert_eq!(preds, expected);
    }

    #[test]
    fn predecessor_values_read_field_in_predecessor_order() {
        let field = Array4::from_shape_fn((2, 2, 4, 4), |(l, v, k, m)| {
            (l * 1000 + v * 100 + k * 10 + m) as f64
        });
        let shape = FieldShape::from_dims(field.shape()).unwrap();
        let stencil = Stencil::periodic(1).unwrap();
        let point = GridPoint::new(1, 1, 1, 1);
        let values = predecessor_values(field.view(), point, &stencil).unwrap();
        let indices = get_point_predecessors(&shape, point, &stencil);
        assert_eq!(values.len(), indices.len());
        for (value, idx) in values.iter().zip(indices) {
            let c = PointOrder::Canonical.cell(&shape, idx).unwrap();
            assert_eq!(*value, field[[c.layer, c.variable, c.latitude, c.longitude]]);
        }

        let outside =
            predecessor_values(field.view(), GridPoint::new(0, 0, 9, 0), &stencil).unwrap();
        assert!(outside.is_empty());
    }

    #[test]
    fn from_field_rejects_non_four_dimensional_arrays() {
        let flat = ndarray::Array2::<f64>::zeros((2, 2));
        assert!(matches!(
            PredecessorIndex::from_field(&flat),
            Err(GridError::InvalidRank(2))
        ));
    }

    #[test]
    fn all_predecessors_covers_grid_and_is_memoized_per_stencil() {
        let index = PredecessorIndex::new(shape());
        let narrow = bounded(1);
        let first = index.get_all_predecessors(&narrow);
        assert_eq!(first.len(), 2 * 3 * 4 * 5);
        let second = index.get_all_predecessors(&narrow);
        assert!(Arc::ptr_eq(&first, &second));

        let wide = Stencil::periodic(2).unwrap();
        let other = index.get_all_predecessors(&wide);
        assert_ne!(*first, *other);
        assert_eq!(index.cached_entries(), 2);

        for (cell, preds) in index.shape().cells().zip(first.iter()) {
            assert_eq!(preds, &index.get_point_predecessors(cell.into(), &narrow));
        }
    }

    #[test]
    fn ordered_predecessors_use_elimination_ranks() {
        let shape = shape();
        let index = PredecessorIndex::new(shape);
        let stencil = Stencil::periodic(1).unwrap();
        let ordered = index.ordered_predecessors(&stencil).unwrap();
        let canonical = index.get_all_predecessors(&stencil);
        assert_eq!(ordered.len(), shape.len());
        for (rank, (ranks, flat)) in ordered.iter().zip(canonical.iter()).enumerate() {
            assert!(ranks.iter().all(|&r| r < rank));
            let remapped: Vec<usize> = flat
                .iter()
                .map(|&p| {
                    let cell = PointOrder::Canonical.cell(&shape, p).unwrap();
                    PointOrder::Elimination.index(&shape, cell)
                })
                .collect();
            assert_eq!(ranks, remapped.as_slice());
        }
    }
}
