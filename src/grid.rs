//! Uniform lat/lon grid coverage.
//!
//! Matched edge visits are reduced to hits (one point in space and time per
//! visit), attributed to grid cells and thinned per vehicle before being
//! aggregated like edge visits.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::{GridConfig, bounded_minutes};
use crate::error::ConfigError;
use crate::geo::{BoundingBox, GeoPosition};
use crate::matcher::MatchedVisit;

/// Index of one grid cell. Rows run south to north, columns west to east.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub row: usize,
    pub column: usize,
}

impl GridCell {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    config: GridConfig,
    lat_step: f64,
    lon_step: f64,
}

impl Grid {
    pub fn new(config: GridConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let lat_step = (config.max_lat - config.min_lat) / config.rows as f64;
        let lon_step = (config.max_lon - config.min_lon) / config.columns as f64;
        Ok(Self {
            config,
            lat_step,
            lon_step,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.config.rows * self.config.columns
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cell containing `position`, `None` outside the bounding box.
    ///
    /// Cells are half-open: a point on the northern or eastern edge of the box
    /// is outside.
    pub fn cell_for(&self, position: &GeoPosition) -> Option<GridCell> {
        if !position.is_valid() {
            return None;
        }
        let c = &self.config;
        if position.latitude < c.min_lat
            || position.latitude >= c.max_lat
            || position.longitude < c.min_lon
            || position.longitude >= c.max_lon
        {
            return None;
        }

        let row = ((position.latitude - c.min_lat) / self.lat_step).floor() as usize;
        let column = ((position.longitude - c.min_lon) / self.lon_step).floor() as usize;
        // float rounding right under the upper edge
        Some(GridCell::new(row.min(c.rows - 1), column.min(c.columns - 1)))
    }

    /// Stable numeric id, row-major.
    pub fn cell_id(&self, cell: GridCell) -> usize {
        cell.row * self.config.columns + cell.column
    }

    pub fn bounds(&self, cell: GridCell) -> BoundingBox {
        let c = &self.config;
        BoundingBox {
            min_lat: c.min_lat + cell.row as f64 * self.lat_step,
            max_lat: c.min_lat + (cell.row + 1) as f64 * self.lat_step,
            min_lon: c.min_lon + cell.column as f64 * self.lon_step,
            max_lon: c.min_lon + (cell.column + 1) as f64 * self.lon_step,
        }
    }

    /// All cells, row-major.
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        (0..self.config.rows)
            .flat_map(move |row| (0..self.config.columns).map(move |column| GridCell::new(row, column)))
    }
}

/// A vehicle seen inside a cell at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridHit {
    pub owner: i64,
    pub timestamp: NaiveDateTime,
    pub cell: GridCell,
}

/// Reduces matched visits to grid hits, sorted by time then owner.
///
/// Each visit contributes the midpoint of its path at the midpoint of its
/// interval. Visits without a path or landing outside the grid are dropped.
pub fn hits_from_visits<'a>(
    grid: &Grid,
    visits: impl IntoIterator<Item = &'a MatchedVisit>,
) -> Vec<GridHit> {
    let mut outside = 0usize;
    let mut hits: Vec<GridHit> = visits
        .into_iter()
        .filter_map(|visit| {
            let cell = visit
                .spatial_midpoint()
                .and_then(|point| grid.cell_for(&point));
            if cell.is_none() {
                outside += 1;
            }
            Some(GridHit {
                owner: visit.interval.owner,
                timestamp: visit.interval.midpoint(),
                cell: cell?,
            })
        })
        .collect();

    hits.sort_by_key(|h| (h.timestamp, h.owner));
    debug!(hits = hits.len(), outside, "Grid hits extracted");
    hits
}

/// Thins hits per owner: a vehicle lingering in one cell is counted again only
/// once the configured time has passed since its last kept hit.
#[derive(Debug, Clone)]
pub struct HitFilter {
    min_gap: Duration,
    last_kept: HashMap<i64, (GridCell, NaiveDateTime)>,
}

impl HitFilter {
    pub fn new(min_minutes_between_hits: i64) -> Result<Self, ConfigError> {
        Ok(Self {
            min_gap: bounded_minutes("minutes between hits", min_minutes_between_hits)?,
            last_kept: HashMap::new(),
        })
    }

    /// Hits must be offered in time order.
    pub fn keep(&mut self, hit: &GridHit) -> bool {
        let keep = match self.last_kept.get(&hit.owner) {
            None => true,
            Some((cell, _)) if *cell != hit.cell => true,
            Some((_, at)) => hit.timestamp - *at > self.min_gap,
        };
        if keep {
            self.last_kept.insert(hit.owner, (hit.cell, hit.timestamp));
        }
        keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{DirectedEdge, VisitInterval};
    use chrono::NaiveDate;

    fn unit_grid() -> Grid {
        Grid::new(GridConfig {
            min_lat: 0.0,
            max_lat: 10.0,
            min_lon: 20.0,
            max_lon: 25.0,
            rows: 10,
            columns: 5,
            min_minutes_between_hits: 10,
        })
        .unwrap()
    }

    fn t(minute: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2014, 2, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            + Duration::minutes(minute)
    }

    fn hit(owner: i64, minute: i64, row: usize, column: usize) -> GridHit {
        GridHit {
            owner,
            timestamp: t(minute),
            cell: GridCell::new(row, column),
        }
    }

    #[test]
    fn test_cell_lookup() {
        let grid = unit_grid();
        assert_eq!(
            grid.cell_for(&GeoPosition::new(0.0, 20.0)),
            Some(GridCell::new(0, 0))
        );
        assert_eq!(
            grid.cell_for(&GeoPosition::new(3.5, 22.2)),
            Some(GridCell::new(3, 2))
        );
        assert_eq!(
            grid.cell_for(&GeoPosition::new(9.999, 24.999)),
            Some(GridCell::new(9, 4))
        );
    }

    #[test]
    fn test_outside_positions() {
        let grid = unit_grid();
        assert_eq!(grid.cell_for(&GeoPosition::new(10.0, 21.0)), None);
        assert_eq!(grid.cell_for(&GeoPosition::new(5.0, 19.9)), None);
        assert_eq!(grid.cell_for(&GeoPosition::new(-0.1, 21.0)), None);
        assert_eq!(grid.cell_for(&GeoPosition::invalid()), None);
    }

    #[test]
    fn test_cells_and_ids() {
        let grid = unit_grid();
        let cells: Vec<_> = grid.cells().collect();
        assert_eq!(cells.len(), 50);
        assert_eq!(grid.len(), 50);
        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(grid.cell_id(*cell), i);
        }
    }

    #[test]
    fn test_bounds_wkt() {
        let grid = unit_grid();
        let b = grid.bounds(GridCell::new(1, 2));
        assert_eq!(b.min_lat, 1.0);
        assert_eq!(b.max_lat, 2.0);
        assert_eq!(b.min_lon, 22.0);
        assert_eq!(b.max_lon, 23.0);
        assert!(b.to_wkt().starts_with("POLYGON(("));
    }

    #[test]
    fn test_invalid_grid_is_rejected() {
        let cfg = GridConfig {
            columns: 0,
            ..Default::default()
        };
        assert!(Grid::new(cfg).is_err());
    }

    #[test]
    fn test_hits_from_visits() {
        let grid = unit_grid();
        let visit = |owner: i64, begin: i64, end: i64, lat: f64| {
            MatchedVisit::new(
                DirectedEdge::new(1, 2),
                VisitInterval::new(t(begin), t(end), owner),
            )
            .with_path(vec![GeoPosition::new(lat, 20.5), GeoPosition::new(lat + 1.0, 20.5)])
        };

        let visits = vec![
            visit(2, 10, 20, 4.0),
            visit(1, 10, 20, 0.0),
            visit(1, 0, 2, 2.0),
            visit(3, 0, 2, 30.0),
            MatchedVisit::new(DirectedEdge::new(5, 6), VisitInterval::instant(t(0), 4)),
        ];

        let hits = hits_from_visits(&grid, &visits);
        assert_eq!(
            hits,
            vec![hit(1, 1, 2, 0), hit(1, 15, 0, 0), hit(2, 15, 4, 0)]
        );
    }

    #[test]
    fn test_filter_same_cell_needs_time() {
        let mut filter = HitFilter::new(10).unwrap();
        assert!(filter.keep(&hit(1, 0, 0, 0)));
        assert!(!filter.keep(&hit(1, 5, 0, 0)));
        // exactly the minimum is not enough
        assert!(!filter.keep(&hit(1, 10, 0, 0)));
        assert!(filter.keep(&hit(1, 11, 0, 0)));
    }

    #[test]
    fn test_filter_cell_change_is_kept() {
        let mut filter = HitFilter::new(10).unwrap();
        assert!(filter.keep(&hit(1, 0, 0, 0)));
        assert!(filter.keep(&hit(1, 1, 0, 1)));
        assert!(filter.keep(&hit(1, 2, 0, 0)));
    }

    #[test]
    fn test_filter_rejects_out_of_range_minutes() {
        assert!(HitFilter::new(i64::MAX).is_err());
        assert!(HitFilter::new(-1).is_err());
        assert!(HitFilter::new(0).is_ok());
    }

    #[test]
    fn test_oversized_grid_is_rejected() {
        let cfg = GridConfig {
            rows: usize::MAX / 2,
            columns: 3,
            ..Default::default()
        };
        assert!(Grid::new(cfg).is_err());
    }

    #[test]
    fn test_filter_is_per_owner() {
        let mut filter = HitFilter::new(10).unwrap();
        assert!(filter.keep(&hit(1, 0, 0, 0)));
        assert!(filter.keep(&hit(2, 1, 0, 0)));
        assert!(!filter.keep(&hit(1, 2, 0, 0)));
    }
}
