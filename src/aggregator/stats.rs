//! Per-day, per-bucket visit statistics and their finalized summaries.

use serde::{Deserialize, Serialize};

use crate::aggregator::types::TimeBucket;
use crate::aggregator::utility::{mean, median};

/// Running statistics for one (key, day, bucket).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketStatistics {
    pub visits: u64,
    pub total_gap_secs: i64,
    /// Observed gaps in arrival order. Sorted only when summarized.
    pub gaps: Vec<i64>,
}

impl BucketStatistics {
    pub fn record(&mut self, gap_secs: i64) {
        self.visits += 1;
        self.total_gap_secs += gap_secs;
        self.gaps.push(gap_secs);
    }

    pub fn summary(&self) -> BucketSummary {
        BucketSummary::from_gaps(self.visits, self.total_gap_secs, &self.gaps)
    }
}

/// All five buckets of one key on one calendar day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayStatistics {
    buckets: [BucketStatistics; 5],
}

impl DayStatistics {
    /// Records a counted visit in `bucket` and in [`TimeBucket::WholeDay`].
    pub fn record(&mut self, bucket: TimeBucket, gap_secs: i64) {
        if bucket != TimeBucket::WholeDay {
            self.buckets[bucket.index()].record(gap_secs);
        }
        self.buckets[TimeBucket::WholeDay.index()].record(gap_secs);
    }

    pub fn bucket(&self, bucket: TimeBucket) -> &BucketStatistics {
        &self.buckets[bucket.index()]
    }

    /// Whole-day count equals the sum of the narrow buckets.
    pub fn is_consistent(&self) -> bool {
        let narrow: u64 = TimeBucket::NARROW
            .iter()
            .map(|b| self.bucket(*b).visits)
            .sum();
        narrow == self.bucket(TimeBucket::WholeDay).visits
    }

    pub fn summaries(&self) -> [BucketSummary; 5] {
        TimeBucket::ALL.map(|b| self.bucket(b).summary())
    }
}

/// Read-out of one bucket: counts plus gap average and median.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketSummary {
    pub visits: u64,
    pub total_gap_secs: i64,
    pub avg_gap_secs: f64,
    pub median_gap_secs: f64,
}

impl BucketSummary {
    pub fn from_gaps(visits: u64, total_gap_secs: i64, gaps: &[i64]) -> Self {
        let avg_gap_secs = if gaps.len() > 1 { mean(gaps) } else { 0.0 };
        Self {
            visits,
            total_gap_secs,
            avg_gap_secs,
            median_gap_secs: median(gaps),
        }
    }
}
