//! Boundary to the external map matcher.
//!
//! The crate never talks to a routing service itself. Whoever drives the
//! pipeline supplies a [`MapMatcher`] that turns a trip into the sequence of
//! directed edges it travelled.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregator::{DirectedEdge, VisitInterval};
use crate::error::MatchError;
use crate::geo::GeoPosition;
use crate::segmenter::Trip;

/// One traversal of one edge, as reported by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedVisit {
    pub edge: DirectedEdge,
    pub interval: VisitInterval,
    /// Shape of the traversed edge, may be empty when the matcher does not
    /// report geometry.
    pub path: Vec<GeoPosition>,
}

impl MatchedVisit {
    pub fn new(edge: DirectedEdge, interval: VisitInterval) -> Self {
        Self {
            edge,
            interval,
            path: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: Vec<GeoPosition>) -> Self {
        self.path = path;
        self
    }

    /// Midpoint between the first and last vertex of the path.
    pub fn spatial_midpoint(&self) -> Option<GeoPosition> {
        let first = self.path.first()?;
        let last = self.path.last()?;
        Some(first.midpoint(last))
    }
}

/// Turns trips into edge visits. Calls are blocking; time-bounding them is up
/// to the implementation.
pub trait MapMatcher {
    fn match_trip(&mut self, trip: &Trip) -> Result<Vec<MatchedVisit>, MatchError>;
}

impl<F> MapMatcher for F
where
    F: FnMut(&Trip) -> Result<Vec<MatchedVisit>, MatchError>,
{
    fn match_trip(&mut self, trip: &Trip) -> Result<Vec<MatchedVisit>, MatchError> {
        self(trip)
    }
}

/// Merges consecutive visits of the same edge into one, keeping the earliest
/// begin and the latest end.
pub fn merge_repeated_edges(visits: Vec<MatchedVisit>) -> Vec<MatchedVisit> {
    let mut merged: Vec<MatchedVisit> = Vec::with_capacity(visits.len());

    for visit in visits {
        match merged.last_mut() {
            Some(prev) if prev.edge == visit.edge => {
                prev.interval = VisitInterval::new(
                    prev.interval.begin.min(visit.interval.begin),
                    prev.interval.end.max(visit.interval.end),
                    prev.interval.owner,
                );
                let skip = usize::from(prev.path.last() == visit.path.first());
                prev.path.extend(visit.path.into_iter().skip(skip));
            }
            _ => merged.push(visit),
        }
    }

    merged
}

/// Matcher failures seen during a run, by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchFailures {
    pub no_route: usize,
    pub trace_too_large: usize,
    pub transport: usize,
}

impl MatchFailures {
    pub fn record(&mut self, trip: &Trip, error: &MatchError) {
        let category = match error {
            MatchError::NoRouteFound => {
                self.no_route += 1;
                "no_route"
            }
            MatchError::TraceTooLarge { .. } => {
                self.trace_too_large += 1;
                "trace_too_large"
            }
            MatchError::Transport(_) => {
                self.transport += 1;
                "transport"
            }
        };
        warn!(
            trip_id = trip.id,
            owner = trip.owner,
            positions = trip.len(),
            category,
            error = %error,
            "Map matching failed, dropping trip"
        );
    }

    pub fn total(&self) -> usize {
        self.no_route + self.trace_too_large + self.transport
    }
}
