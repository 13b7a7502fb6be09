//! Run configuration.
//!
//! Every threshold the pipeline uses lives here. A [`PipelineConfig`] can be
//! loaded from a JSON file, is overridden field by field from the CLI, and
//! must pass [`PipelineConfig::validate`] before a run starts.

use chrono::{Duration, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::aggregator::TimeBucket;
use crate::error::ConfigError;
use crate::geo::{BoundingBox, CoordinateOrder};

/// Largest value any minutes setting accepts.
pub const MAX_MINUTES: i64 = i32::MAX as i64;

/// Largest number of cells (`rows * columns`) a grid may have.
pub const MAX_GRID_CELLS: usize = 1 << 24;

/// `minutes` as a duration, rejected when outside `[0, MAX_MINUTES]`.
pub fn bounded_minutes(setting: &'static str, minutes: i64) -> Result<Duration, ConfigError> {
    let out_of_range = ConfigError::MinutesOutOfRange { setting, minutes };
    if !(0..=MAX_MINUTES).contains(&minutes) {
        return Err(out_of_range);
    }
    Duration::try_minutes(minutes).ok_or(out_of_range)
}

/// Settings for splitting a vehicle's positions into trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Two consecutive positions this many minutes apart (or more) belong to
    /// different trips.
    pub stationary_gap_minutes: i64,
    /// Trips with this many positions or fewer are discarded.
    pub minimum_trip_length: usize,
    pub allow_cross_day_trips: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            stationary_gap_minutes: 3,
            minimum_trip_length: 15,
            allow_cross_day_trips: true,
        }
    }
}

impl SegmenterConfig {
    pub fn stationary_gap_limit(&self) -> Result<Duration, ConfigError> {
        if self.stationary_gap_minutes <= 0 {
            return Err(ConfigError::NonPositiveGapLimit {
                seconds: self.stationary_gap_minutes.saturating_mul(60),
            });
        }
        bounded_minutes("stationary gap limit", self.stationary_gap_minutes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stationary_gap_limit()?;
        if self.minimum_trip_length < 1 {
            return Err(ConfigError::MinimumTripLengthTooSmall(
                self.minimum_trip_length,
            ));
        }
        Ok(())
    }
}

/// Start hours of the four narrow time buckets.
///
/// Bucket `i` covers `[starts[i], starts[i + 1])`, the evening bucket runs to
/// midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBoundaries {
    pub starts: [u32; 4],
}

impl Default for BucketBoundaries {
    fn default() -> Self {
        Self {
            starts: [0, 6, 12, 18],
        }
    }
}

impl BucketBoundaries {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBuckets {
            starts: self.starts,
            reason: reason.to_string(),
        };

        if self.starts[0] != 0 {
            return Err(invalid("the first bucket must start at midnight"));
        }
        if self.starts.iter().any(|h| *h > 23) {
            return Err(invalid("start hours must be below 24"));
        }
        if self.starts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("start hours must be strictly increasing"));
        }
        Ok(())
    }

    /// The narrow bucket the given time of day falls into.
    pub fn bucket_for(&self, time: NaiveTime) -> TimeBucket {
        let hour = time.hour();
        let index = self.starts.iter().rposition(|start| hour >= *start).unwrap_or(0);
        TimeBucket::NARROW[index]
    }

    /// First and last hour (exclusive) covered by `bucket`.
    pub fn hours(&self, bucket: TimeBucket) -> (u32, u32) {
        match bucket.narrow_index() {
            Some(i) => {
                let end = self.starts.get(i + 1).copied().unwrap_or(24);
                (self.starts[i], end)
            }
            None => (0, 24),
        }
    }

    /// Human readable interval, e.g. `[06:00-12:00]`.
    pub fn label(&self, bucket: TimeBucket) -> String {
        let (start, end) = self.hours(bucket);
        format!("[{start:02}:00-{end:02}:00]")
    }
}

/// Settings for per-edge visit aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Visits closer than this to the previous visit are folded into it.
    pub minimum_gap_secs: i64,
    pub buckets: BucketBoundaries,
    /// Caps how many past visit ends are kept for out-of-order
    /// reconciliation. `None` keeps all of them.
    pub lookback_limit: Option<usize>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            minimum_gap_secs: 0,
            buckets: BucketBoundaries::default(),
            lookback_limit: None,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_gap_secs < 0 {
            return Err(ConfigError::NegativeVisitGap(self.minimum_gap_secs));
        }
        if self.lookback_limit == Some(0) {
            return Err(ConfigError::EmptyLookback);
        }
        self.buckets.validate()
    }
}

/// Bounding box and resolution of the coverage grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub rows: usize,
    pub columns: usize,
    /// A vehicle staying inside one cell is counted again only after this
    /// many minutes.
    pub min_minutes_between_hits: i64,
}

impl Default for GridConfig {
    fn default() -> Self {
        // Rome
        Self {
            min_lat: 41.7775,
            max_lat: 41.9962,
            min_lon: 12.3473,
            max_lon: 12.6508,
            rows: 10,
            columns: 10,
            min_minutes_between_hits: 10,
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [self.min_lat, self.max_lat, self.min_lon, self.max_lon];
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(ConfigError::InvalidGrid("bounds must be finite".into()));
        }
        if self.min_lat >= self.max_lat || self.min_lon >= self.max_lon {
            return Err(ConfigError::InvalidGrid(format!(
                "empty bounding box lat [{}, {}] lon [{}, {}]",
                self.min_lat, self.max_lat, self.min_lon, self.max_lon
            )));
        }
        if self.rows == 0 || self.columns == 0 {
            return Err(ConfigError::InvalidGrid(
                "rows and columns must be at least 1".into(),
            ));
        }
        match self.rows.checked_mul(self.columns) {
            Some(cells) if cells <= MAX_GRID_CELLS => {}
            _ => {
                return Err(ConfigError::InvalidGrid(format!(
                    "{} x {} cells exceed the limit of {MAX_GRID_CELLS}",
                    self.rows, self.columns
                )));
            }
        }
        self.min_gap_between_hits()?;
        Ok(())
    }

    pub fn min_gap_between_hits(&self) -> Result<Duration, ConfigError> {
        bounded_minutes("minutes between hits", self.min_minutes_between_hits)
    }
}

/// Checks a bounding box used to filter rows by geometry.
pub fn validate_area(area: &BoundingBox) -> Result<(), ConfigError> {
    let bounds = [area.min_lat, area.max_lat, area.min_lon, area.max_lon];
    if bounds.iter().any(|b| !b.is_finite()) {
        return Err(ConfigError::InvalidArea("bounds must be finite".into()));
    }
    if area.min_lat > area.max_lat || area.min_lon > area.max_lon {
        return Err(ConfigError::InvalidArea(format!(
            "lat [{}, {}] lon [{}, {}] has its corners swapped",
            area.min_lat, area.max_lat, area.min_lon, area.max_lon
        )));
    }
    Ok(())
}

/// Everything a run needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub coordinate_order: CoordinateOrder,
    pub segmenter: SegmenterConfig,
    pub aggregator: AggregatorConfig,
    pub grid: GridConfig,
    /// Keep only rows whose geometry lies entirely inside this box.
    pub area: Option<BoundingBox>,
}

impl PipelineConfig {
    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| ConfigError::Unreadable(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.segmenter.validate()?;
        self.aggregator.validate()?;
        self.grid.validate()?;
        match &self.area {
            Some(area) => validate_area(area),
            None => Ok(()),
        }
    }
}
