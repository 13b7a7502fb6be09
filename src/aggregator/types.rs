//! Keys and visit records consumed by the aggregator.

use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Anything visits can be aggregated under: a directed road edge, a grid cell.
pub trait VisitKey: Copy + Eq + Hash + Ord + Debug + Serialize + DeserializeOwned {}

impl<T> VisitKey for T where T: Copy + Eq + Hash + Ord + Debug + Serialize + DeserializeOwned {}

/// A directional road segment between two network nodes.
///
/// `(a, b)` and `(b, a)` are different edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectedEdge {
    pub origin: i64,
    pub destination: i64,
}

impl DirectedEdge {
    pub fn new(origin: i64, destination: i64) -> Self {
        Self {
            origin,
            destination,
        }
    }

    pub fn reversed(&self) -> Self {
        Self::new(self.destination, self.origin)
    }
}

/// One traversal of an edge by one vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitInterval {
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
    pub owner: i64,
}

impl VisitInterval {
    /// An `end` before `begin` is clamped to a zero-length visit.
    pub fn new(begin: NaiveDateTime, end: NaiveDateTime, owner: i64) -> Self {
        Self {
            begin,
            end: end.max(begin),
            owner,
        }
    }

    /// A visit with no duration, used for point observations.
    pub fn instant(at: NaiveDateTime, owner: i64) -> Self {
        Self::new(at, at, owner)
    }

    pub fn midpoint(&self) -> NaiveDateTime {
        self.begin + (self.end - self.begin) / 2
    }
}

/// A named part of the day visits are stratified by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeBucket {
    EarlyMorning,
    MidMorning,
    Afternoon,
    Evening,
    /// Union of the four narrow buckets.
    WholeDay,
}

impl TimeBucket {
    pub const ALL: [TimeBucket; 5] = [
        TimeBucket::EarlyMorning,
        TimeBucket::MidMorning,
        TimeBucket::Afternoon,
        TimeBucket::Evening,
        TimeBucket::WholeDay,
    ];

    pub const NARROW: [TimeBucket; 4] = [
        TimeBucket::EarlyMorning,
        TimeBucket::MidMorning,
        TimeBucket::Afternoon,
        TimeBucket::Evening,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Position among the narrow buckets, `None` for [`TimeBucket::WholeDay`].
    pub fn narrow_index(self) -> Option<usize> {
        match self {
            TimeBucket::WholeDay => None,
            other => Some(other.index()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TimeBucket::EarlyMorning => "early_morning",
            TimeBucket::MidMorning => "mid_morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
            TimeBucket::WholeDay => "whole_day",
        }
    }
}
