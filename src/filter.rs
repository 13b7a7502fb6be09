//! Area filter on WKT geometries.
//!
//! A row is kept when the envelope of its geometry lies inside the configured
//! box, borders included. Rows without a readable geometry are dropped.

use serde::Serialize;
use std::fmt::Display;
use tracing::{debug, info, warn};

use crate::config::validate_area;
use crate::error::ConfigError;
use crate::geo::{BoundingBox, CoordinateOrder, Geometry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaFilter {
    area: BoundingBox,
    order: CoordinateOrder,
}

impl AreaFilter {
    pub fn new(area: BoundingBox, order: CoordinateOrder) -> Result<Self, ConfigError> {
        validate_area(&area)?;
        Ok(Self { area, order })
    }

    pub fn area(&self) -> &BoundingBox {
        &self.area
    }

    pub fn keeps(&self, wkt: &str) -> bool {
        Geometry::parse(wkt, self.order)
            .and_then(|geometry| geometry.envelope())
            .is_some_and(|envelope| self.area.contains(&envelope))
    }

    /// Same as [`AreaFilter::keeps`] for an optional column.
    pub fn keeps_field(&self, wkt: Option<&str>) -> bool {
        wkt.is_some_and(|wkt| self.keeps(wkt))
    }
}

/// Counters of one filter run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub rows_read: usize,
    pub kept: usize,
    pub outside: usize,
    pub unreadable: usize,
}

/// Keeps the records whose field at `column` lies inside the area. Kept
/// records are returned whole, every other field untouched.
#[tracing::instrument(skip(filter, records))]
pub fn filter_records<E: Display>(
    filter: &AreaFilter,
    column: usize,
    records: impl IntoIterator<Item = Result<csv::StringRecord, E>>,
) -> (Vec<Vec<String>>, FilterReport) {
    let mut report = FilterReport::default();
    let mut kept = Vec::new();

    for record in records {
        report.rows_read += 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(line = report.rows_read, error = %e, "Skipping unreadable row");
                report.unreadable += 1;
                continue;
            }
        };

        if filter.keeps_field(record.get(column)) {
            kept.push(record.iter().map(str::to_string).collect());
            report.kept += 1;
        } else {
            debug!(line = report.rows_read, "Row outside the area");
            report.outside += 1;
        }
    }

    info!(
        rows_read = report.rows_read,
        kept = report.kept,
        outside = report.outside,
        unreadable = report.unreadable,
        area = %filter.area.to_wkt(),
        "Area filter complete"
    );
    (kept, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv::StringRecord;

    fn rome() -> AreaFilter {
        AreaFilter::new(
            BoundingBox::new(41.8, 42.0, 12.4, 12.6),
            CoordinateOrder::LonLat,
        )
        .unwrap()
    }

    #[test]
    fn test_geometry_inside_is_kept() {
        let filter = rome();
        assert!(filter.keeps("POINT(12.5 41.9)"));
        assert!(filter.keeps("LINESTRING(12.45 41.85, 12.55 41.95)"));
        // on the border
        assert!(filter.keeps("LINESTRING(12.4 41.8, 12.6 42)"));
    }

    #[test]
    fn test_straddling_geometry_is_dropped() {
        let filter = rome();
        assert!(!filter.keeps("LINESTRING(12.5 41.9, 12.7 41.9)"));
        assert!(!filter.keeps("LINESTRING(12.5 41.7, 12.5 41.9)"));
    }

    #[test]
    fn test_geometry_outside_is_dropped() {
        let filter = rome();
        assert!(!filter.keeps("POINT(14.25 40.85)"));
        assert!(!filter.keeps("LINESTRING(14.2 40.8, 14.3 40.9)"));
    }

    #[test]
    fn test_unreadable_geometry_is_dropped() {
        let filter = rome();
        assert!(!filter.keeps("POLYGON((12.5 41.9, 12.5 41.9))"));
        assert!(!filter.keeps("POINT(abc 41.9)"));
        assert!(!filter.keeps_field(None));
    }

    #[test]
    fn test_coordinate_order_applies_to_geometries() {
        let filter = AreaFilter::new(
            BoundingBox::new(41.8, 42.0, 12.4, 12.6),
            CoordinateOrder::LatLon,
        )
        .unwrap();
        assert!(filter.keeps("POINT(41.9 12.5)"));
        assert!(!filter.keeps("POINT(12.5 41.9)"));
    }

    #[test]
    fn test_swapped_corners_are_rejected() {
        let result = AreaFilter::new(
            BoundingBox::new(42.0, 41.8, 12.4, 12.6),
            CoordinateOrder::LonLat,
        );
        assert!(matches!(result, Err(ConfigError::InvalidArea(_))));
    }

    #[test]
    fn test_filter_records_keeps_whole_rows() {
        let records: Vec<Result<StringRecord, String>> = vec![
            Ok(StringRecord::from(vec!["1", "POINT(12.5 41.9)", "a"])),
            Ok(StringRecord::from(vec!["2", "LINESTRING(12.5 41.9, 12.7 41.9)", "b"])),
            Err("bad row".to_string()),
            Ok(StringRecord::from(vec!["3"])),
            Ok(StringRecord::from(vec!["4", "POINT(12.41 41.81)", "d"])),
        ];

        let (kept, report) = filter_records(&rome(), 1, records);
        assert_eq!(
            kept,
            vec![
                vec!["1".to_string(), "POINT(12.5 41.9)".into(), "a".into()],
                vec!["4".to_string(), "POINT(12.41 41.81)".into(), "d".into()],
            ]
        );
        assert_eq!(
            report,
            FilterReport {
                rows_read: 5,
                kept: 2,
                outside: 2,
                unreadable: 1,
            }
        );
    }
}
