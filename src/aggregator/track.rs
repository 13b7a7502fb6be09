//! Visit history of a single key.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::aggregator::types::VisitInterval;

/// What [`KeyTrack::record`] did with a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// The key's first visit, counted with a zero gap.
    First,
    /// A visit after the last one, counted with the elapsed gap.
    Forward { gap_secs: i64 },
    /// A late arrival, counted with a gap recovered from the lookback list.
    Reconciled { gap_secs: i64 },
    /// Too close to the previous visit, folded into it.
    Coalesced,
}

impl VisitOutcome {
    /// The gap to attribute to a time bucket, `None` if the visit was not counted.
    pub fn counted_gap(&self) -> Option<i64> {
        match *self {
            VisitOutcome::First => Some(0),
            VisitOutcome::Forward { gap_secs } | VisitOutcome::Reconciled { gap_secs } => {
                Some(gap_secs)
            }
            VisitOutcome::Coalesced => None,
        }
    }
}

/// Lifetime state of one key. `last_visited == None` means the key has been
/// registered but never visited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyTrack {
    last_visited: Option<NaiveDateTime>,
    /// Ends of closed visits, ascending.
    lookback: VecDeque<NaiveDateTime>,
    total_gap_secs: i64,
    visits: u64,
    gaps: Vec<i64>,
    /// Day -> index into the aggregator's day arena.
    days: BTreeMap<NaiveDate, usize>,
}

impl KeyTrack {
    pub fn is_empty(&self) -> bool {
        self.last_visited.is_none()
    }

    pub fn last_visited(&self) -> Option<NaiveDateTime> {
        self.last_visited
    }

    pub fn visits(&self) -> u64 {
        self.visits
    }

    pub fn total_gap_secs(&self) -> i64 {
        self.total_gap_secs
    }

    pub fn gaps(&self) -> &[i64] {
        &self.gaps
    }

    pub fn lookback_len(&self) -> usize {
        self.lookback.len()
    }

    pub fn day_slot(&self, day: NaiveDate) -> Option<usize> {
        self.days.get(&day).copied()
    }

    pub(crate) fn set_day_slot(&mut self, day: NaiveDate, slot: usize) {
        self.days.insert(day, slot);
    }

    /// Applies one visit to the lifetime counters.
    ///
    /// Gaps are measured from the previous visit's end to this visit's begin.
    /// Day and bucket routing is left to the caller.
    pub fn record(
        &mut self,
        visit: &VisitInterval,
        minimum_gap_secs: i64,
        lookback_limit: Option<usize>,
    ) -> VisitOutcome {
        let Some(last) = self.last_visited else {
            self.last_visited = Some(visit.end);
            self.push_lookback(visit.end, lookback_limit);
            self.count(0);
            return VisitOutcome::First;
        };

        let raw = (visit.begin - last).num_seconds();

        if raw >= minimum_gap_secs {
            self.last_visited = Some(visit.end);
            self.push_lookback(visit.end, lookback_limit);
            self.count(raw);
            return VisitOutcome::Forward { gap_secs: raw };
        }

        if raw < 0 {
            // Oldest first: the first closed end the visit begins after.
            let gap_secs = self
                .lookback
                .iter()
                .map(|end| (visit.begin - *end).num_seconds())
                .find(|gap| *gap >= 0)
                .unwrap_or(0);

            if visit.end > last {
                self.last_visited = Some(visit.end);
                self.push_lookback(visit.end, lookback_limit);
            }
            self.count(gap_secs);
            return VisitOutcome::Reconciled { gap_secs };
        }

        if visit.end > last {
            self.last_visited = Some(visit.end);
            if let Some(newest) = self.lookback.back_mut() {
                *newest = visit.end;
            }
        }
        VisitOutcome::Coalesced
    }

    fn count(&mut self, gap_secs: i64) {
        self.visits += 1;
        self.total_gap_secs += gap_secs;
        self.gaps.push(gap_secs);
    }

    fn push_lookback(&mut self, end: NaiveDateTime, limit: Option<usize>) {
        self.lookback.push_back(end);
        if let Some(limit) = limit {
            while self.lookback.len() > limit {
                self.lookback.pop_front();
            }
        }
    }
}
