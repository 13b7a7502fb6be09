//! Visit aggregation per directed edge or grid cell.
//!
//! Visits are ingested one at a time, possibly slightly out of order, and
//! accumulated per key, calendar day and time bucket. Finalization turns the
//! state into zero-filled detailed rows and lifetime rows.

pub mod aggregate;
pub mod stats;
pub mod track;
pub mod types;
pub mod utility;

pub use aggregate::{
    AggregationReport, AggregatorState, DayRecord, LifetimeRecord, SegmentVisitAggregator,
};
pub use stats::{BucketStatistics, BucketSummary, DayStatistics};
pub use track::{KeyTrack, VisitOutcome};
pub use types::{DirectedEdge, TimeBucket, VisitInterval, VisitKey};
