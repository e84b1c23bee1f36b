//! Reduction of accumulated scan points into a renderable grid.
//!
//! Everything here is pure: the merge rules live on [`PointMap`], and
//! [`reduce`] turns a merged map plus the operation's configured axis range
//! and floor into an immutable [`ScanGrid`]. Re-running a scan rebuilds a
//! whole new grid; nothing mutates a grid after construction.

use serde_json::Value;

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Measurement at one scan coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScanPoint {
    /// Estimated error rate (cumulative across repeated passes).
    pub rate: f64,
    /// Observed error count.
    pub errors: u64,
    /// Observed sample count.
    pub samples: u64,
}

/// Merged per-coordinate observations, keyed by raw (x, y) step codes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointMap {
    points: BTreeMap<(i64, i64), ScanPoint>,
}

impl PointMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one observation.
    ///
    /// Repeated coordinates are merged, never overwritten:
    /// - `rate` accumulates by addition (cumulative estimate across passes)
    /// - `errors` is sticky: the first nonzero value wins and a later zero
    ///   never reverts it
    /// - `samples` accumulates by addition
    pub fn merge(&mut self, x: i64, y: i64, rate: f64, errors: u64, samples: u64) {
        let point = self.points.entry((x, y)).or_default();
        point.rate += rate;
        if point.errors == 0 && errors != 0 {
            point.errors = errors;
        }
        point.samples += samples;
    }

    /// Build a map from an ordered list of raw observations.
    pub fn from_observations<I>(observations: I) -> Self
    where
        I: IntoIterator<Item = (i64, i64, f64, u64, u64)>,
    {
        let mut map = Self::new();
        for (x, y, rate, errors, samples) in observations {
            map.merge(x, y, rate, errors, samples);
        }
        map
    }

    /// Merge observations from their wire value: an array of
    /// `[x, y, rate, errors, samples]` rows.
    pub(crate) fn merge_from_value(&mut self, value: &Value) -> Result<()> {
        let rows = value
            .as_array()
            .ok_or_else(|| Error::protocol("scan points are not an array"))?;

        // Validate the whole batch before merging any of it.
        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            let row = row
                .as_array()
                .filter(|r| r.len() == 5)
                .ok_or_else(|| Error::protocol("scan point row is not a 5-element array"))?;
            let x = row[0]
                .as_i64()
                .ok_or_else(|| Error::protocol("scan point x is not an integer"))?;
            let y = row[1]
                .as_i64()
                .ok_or_else(|| Error::protocol("scan point y is not an integer"))?;
            let rate = row[2]
                .as_f64()
                .ok_or_else(|| Error::protocol("scan point rate is not a number"))?;
            let errors = row[3]
                .as_u64()
                .ok_or_else(|| Error::protocol("scan point error count is not an integer"))?;
            let samples = row[4]
                .as_u64()
                .ok_or_else(|| Error::protocol("scan point sample count is not an integer"))?;
            decoded.push((x, y, rate, errors, samples));
        }

        for (x, y, rate, errors, samples) in decoded {
            self.merge(x, y, rate, errors, samples);
        }
        Ok(())
    }

    /// Look up a coordinate.
    #[must_use]
    pub fn get(&self, x: i64, y: i64) -> Option<&ScanPoint> {
        self.points.get(&(x, y))
    }

    /// Number of distinct coordinates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate coordinates and points in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&(i64, i64), &ScanPoint)> {
        self.points.iter()
    }
}

/// An engineering axis range, e.g. parsed from `"-0.5 to 0.5"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl AxisRange {
    /// Parse a `"<lo> to <hi>"` range string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, " to ");
        let lo = parts.next().map(str::trim);
        let hi = parts.next().map(str::trim);
        let (Some(lo), Some(hi)) = (lo, hi) else {
            return Err(Error::protocol(format!("malformed range string '{s}'")));
        };

        let min: f64 = lo
            .parse()
            .map_err(|_| Error::protocol(format!("malformed range bound '{lo}'")))?;
        let max: f64 = hi
            .parse()
            .map_err(|_| Error::protocol(format!("malformed range bound '{hi}'")))?;
        if min >= max {
            return Err(Error::protocol(format!("empty range '{s}'")));
        }

        Ok(Self { min, max })
    }

    /// Linearly rescale a raw device step code into this range.
    #[must_use]
    pub fn rescale(&self, raw: f64, raw_min: f64, raw_max: f64) -> f64 {
        if raw_max <= raw_min {
            // Degenerate raw axis: a single column sits mid-range.
            return self.min + (self.max - self.min) / 2.0;
        }
        self.min + (raw - raw_min) * (self.max - self.min) / (raw_max - raw_min)
    }
}

/// One cell of a reduced grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    /// Normalized x position in engineering units.
    pub x: f64,
    /// Raw y step code.
    pub y: i64,
    /// Merged error rate (0.0 where nothing was observed erroring).
    pub rate: f64,
    /// Merged error count.
    pub errors: u64,
    /// Merged sample count.
    pub samples: u64,
}

/// The reduced, renderable result of a completed scan.
///
/// Immutable once built; re-running the scan produces a new grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGrid {
    cells: Vec<GridCell>,
    floor: f64,
    x_range: AxisRange,
}

impl ScanGrid {
    /// Cells in coordinate order.
    #[must_use]
    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    /// The rate to substitute for mathematically zero cells when plotting on
    /// a logarithmic scale. Recorded alongside the grid, never baked into
    /// the cells themselves.
    #[must_use]
    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// The engineering range the x axis was rescaled into.
    #[must_use]
    pub fn x_range(&self) -> AxisRange {
        self.x_range
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the grid is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Reduce a merged point map into a grid.
///
/// Raw x step codes are rescaled linearly into `x_range`; y codes are kept
/// as-is. `floor` is recorded on the grid for log-scale rendering.
#[must_use]
pub fn reduce(points: &PointMap, x_range: AxisRange, floor: f64) -> ScanGrid {
    let raw_min = points
        .iter()
        .map(|((x, _), _)| *x)
        .min()
        .unwrap_or_default() as f64;
    let raw_max = points
        .iter()
        .map(|((x, _), _)| *x)
        .max()
        .unwrap_or_default() as f64;

    let cells = points
        .iter()
        .map(|(&(x, y), point)| GridCell {
            x: x_range.rescale(x as f64, raw_min, raw_max),
            y,
            rate: point.rate,
            errors: point.errors,
            samples: point.samples,
        })
        .collect();

    ScanGrid {
        cells,
        floor,
        x_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_coordinate_accumulates_rate_and_keeps_sticky_errors() {
        let mut map = PointMap::new();
        map.merge(2, 3, 1e-6, 0, 1000);
        map.merge(2, 3, 2e-6, 4, 1000);

        let p = map.get(2, 3).unwrap();
        assert!((p.rate - 3e-6).abs() < 1e-12);
        assert_eq!(p.errors, 4);
        assert_eq!(p.samples, 2000);
    }

    #[test]
    fn error_count_never_reverts_to_zero() {
        let mut map = PointMap::new();
        map.merge(0, 0, 0.0, 0, 10);
        map.merge(0, 0, 0.0, 5, 10);
        map.merge(0, 0, 0.0, 0, 10);

        assert_eq!(map.get(0, 0).unwrap().errors, 5);
    }

    #[test]
    fn first_nonzero_error_count_wins() {
        let mut map = PointMap::new();
        map.merge(1, 1, 0.0, 3, 10);
        map.merge(1, 1, 0.0, 9, 10);

        assert_eq!(map.get(1, 1).unwrap().errors, 3);
    }

    #[test]
    fn range_parsing() {
        let r = AxisRange::parse("-0.5 to 0.5").unwrap();
        assert_eq!(r.min, -0.5);
        assert_eq!(r.max, 0.5);

        assert!(AxisRange::parse("0.5").is_err());
        assert!(AxisRange::parse("nope to 0.5").is_err());
        assert!(AxisRange::parse("0.5 to -0.5").is_err());
    }

    #[test]
    fn reduce_rescales_x_and_records_floor() {
        let map = PointMap::from_observations([
            (0, 0, 0.0, 0, 100),
            (32, 0, 1e-7, 1, 100),
            (64, 0, 0.0, 0, 100),
        ]);

        let range = AxisRange::parse("-0.5 to 0.5").unwrap();
        let grid = reduce(&map, range, 1e-12);

        assert_eq!(grid.len(), 3);
        assert_eq!(grid.floor(), 1e-12);

        let xs: Vec<f64> = grid.cells().iter().map(|c| c.x).collect();
        assert_eq!(xs, vec![-0.5, 0.0, 0.5]);

        // Zero rates stay zero in the cells; the floor is not baked in.
        assert_eq!(grid.cells()[0].rate, 0.0);
    }

    #[test]
    fn degenerate_raw_axis_maps_to_mid_range() {
        let map = PointMap::from_observations([(7, 0, 0.0, 0, 1)]);
        let range = AxisRange { min: -1.0, max: 1.0 };
        let grid = reduce(&map, range, 1e-12);
        assert_eq!(grid.cells()[0].x, 0.0);
    }

    #[test]
    fn malformed_point_rows_leave_map_untouched() {
        let mut map = PointMap::new();
        map.merge(0, 0, 1e-6, 0, 10);

        let bad = serde_json::json!([[1, 2, 1e-6, 0], [3]]);
        assert!(map.merge_from_value(&bad).is_err());
        assert_eq!(map.len(), 1);
    }
}
