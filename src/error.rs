//! Error types shared by the library.
//!
//! Data-quality problems never surface here: bad rows are skipped and counted.
//! What remains are rejected configurations, map-matcher failures and the
//! pipeline-level outcomes that stop a run.

use thiserror::Error;

/// A configuration that must be rejected before any processing starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("stationary gap limit must be positive, got {seconds}s")]
    NonPositiveGapLimit { seconds: i64 },

    #[error("{setting} must be between 0 and {max} minutes, got {minutes}", max = crate::config::MAX_MINUTES)]
    MinutesOutOfRange { setting: &'static str, minutes: i64 },

    #[error("minimum trip length must be at least 1, got {0}")]
    MinimumTripLengthTooSmall(usize),

    #[error("minimum gap between distinct visits cannot be negative, got {0}s")]
    NegativeVisitGap(i64),

    #[error("lookback limit must be at least 1 when set")]
    EmptyLookback,

    #[error("time bucket boundaries {starts:?} are invalid: {reason}")]
    InvalidBuckets { starts: [u32; 4], reason: String },

    #[error("grid configuration is invalid: {0}")]
    InvalidGrid(String),

    #[error("filter area is invalid: {0}")]
    InvalidArea(String),

    #[error("could not read configuration: {0}")]
    Unreadable(String),
}

/// Failure categories reported by a map-matching collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("no route found for trip")]
    NoRouteFound,

    #[error("trace with {positions} positions is too large for the matcher")]
    TraceTooLarge { positions: usize },

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failure to write or read back an aggregator checkpoint.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("could not encode aggregator state: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("could not decode aggregator state: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Reasons a pipeline run stops without producing results.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run cancelled after {rows_read} rows")]
    Cancelled { rows_read: usize },
}
