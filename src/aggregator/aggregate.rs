//! Streaming per-key visit aggregation.
//!
//! Keys live in an arena: `keys[i]` and `tracks[i]` describe the same key and
//! `index` resolves a key to `i`. Per-day statistics live in a second arena
//! that only grows; a track maps each of its days to a slot there.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, trace};

use crate::aggregator::stats::{BucketSummary, DayStatistics};
use crate::aggregator::track::{KeyTrack, VisitOutcome};
use crate::aggregator::types::{TimeBucket, VisitInterval, VisitKey};
use crate::config::AggregatorConfig;
use crate::error::{ConfigError, StateError};

/// Everything the aggregator knows after the visits ingested so far.
///
/// Serializable so a run can be checkpointed and resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: DeserializeOwned"))]
pub struct AggregatorState<K> {
    keys: Vec<K>,
    tracks: Vec<KeyTrack>,
    #[serde(skip)]
    index: HashMap<K, usize>,
    days: Vec<DayStatistics>,
    observed_days: BTreeSet<NaiveDate>,
}

impl<K: VisitKey> Default for AggregatorState<K> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            tracks: Vec::new(),
            index: HashMap::new(),
            days: Vec::new(),
            observed_days: BTreeSet::new(),
        }
    }
}

impl<K: VisitKey> AggregatorState<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `key` known without visiting it, so finalization emits it with
    /// zero statistics. Returns its arena slot.
    pub fn register(&mut self, key: K) -> usize {
        if let Some(slot) = self.index.get(&key) {
            return *slot;
        }
        let slot = self.keys.len();
        self.keys.push(key);
        self.tracks.push(KeyTrack::default());
        self.index.insert(key, slot);
        slot
    }

    /// Adds `day` to the days every key is reported for.
    pub fn observe_day(&mut self, day: NaiveDate) {
        self.observed_days.insert(day);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn track(&self, key: &K) -> Option<&KeyTrack> {
        self.index.get(key).map(|slot| &self.tracks[*slot])
    }

    pub fn day_statistics(&self, key: &K, day: NaiveDate) -> Option<&DayStatistics> {
        let slot = self.track(key)?.day_slot(day)?;
        self.days.get(slot)
    }

    pub fn observed_days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.observed_days.iter().copied()
    }

    /// Encodes the state as MessagePack.
    pub fn checkpoint(&self) -> Result<Vec<u8>, StateError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a state written by [`AggregatorState::checkpoint`].
    pub fn restore(bytes: &[u8]) -> Result<Self, StateError> {
        let mut state: Self = rmp_serde::from_slice(bytes)?;
        state.index = state
            .keys
            .iter()
            .enumerate()
            .map(|(slot, key)| (*key, slot))
            .collect();
        Ok(state)
    }

    fn day_slot(&mut self, slot: usize, day: NaiveDate) -> usize {
        if let Some(existing) = self.tracks[slot].day_slot(day) {
            return existing;
        }
        let new_slot = self.days.len();
        self.days.push(DayStatistics::default());
        self.tracks[slot].set_day_slot(day, new_slot);
        new_slot
    }
}

/// Per-day read-out of one key, all five buckets in [`TimeBucket::ALL`] order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayRecord<K> {
    pub key: K,
    pub day: NaiveDate,
    pub buckets: [BucketSummary; 5],
}

impl<K> DayRecord<K> {
    pub fn bucket(&self, bucket: TimeBucket) -> &BucketSummary {
        &self.buckets[bucket.index()]
    }
}

/// Lifetime read-out of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifetimeRecord<K> {
    pub key: K,
    pub summary: BucketSummary,
}

/// Result of [`SegmentVisitAggregator::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationReport<K> {
    /// Every day present in the dataset, ascending.
    pub days: Vec<NaiveDate>,
    /// One record per key and day, keys ascending, zero-filled.
    pub detailed: Vec<DayRecord<K>>,
    pub lifetime: Vec<LifetimeRecord<K>>,
}

/// Computes per-key, per-day, per-bucket visit statistics in one pass.
#[derive(Debug, Clone)]
pub struct SegmentVisitAggregator {
    config: AggregatorConfig,
}

impl SegmentVisitAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Applies one visit of `key`.
    ///
    /// Unknown keys are registered on the spot and take the first-visit path,
    /// so there is no way to mutate a key that was never initialized.
    pub fn ingest<K: VisitKey>(
        &self,
        state: &mut AggregatorState<K>,
        key: K,
        visit: &VisitInterval,
    ) -> VisitOutcome {
        let slot = state.register(key);
        let day = visit.begin.date();
        state.observe_day(day);

        let outcome = state.tracks[slot].record(
            visit,
            self.config.minimum_gap_secs,
            self.config.lookback_limit,
        );

        if let Some(gap_secs) = outcome.counted_gap() {
            let bucket = self.config.buckets.bucket_for(visit.begin.time());
            let day_slot = state.day_slot(slot, day);
            state.days[day_slot].record(bucket, gap_secs);
        }

        trace!(?key, begin = %visit.begin, ?outcome, "Visit ingested");
        outcome
    }

    /// Projects the state into detailed and lifetime records.
    ///
    /// Read-only: the state can keep ingesting afterwards.
    pub fn finalize<K: VisitKey>(&self, state: &AggregatorState<K>) -> AggregationReport<K> {
        let days: Vec<NaiveDate> = state.observed_days().collect();

        let mut order: Vec<usize> = (0..state.keys.len()).collect();
        order.sort_by_key(|slot| state.keys[*slot]);

        let mut detailed = Vec::with_capacity(order.len() * days.len());
        let mut lifetime = Vec::with_capacity(order.len());

        for slot in order {
            let key = state.keys[slot];
            let track = &state.tracks[slot];

            for day in &days {
                let buckets = match track.day_slot(*day) {
                    Some(day_slot) => {
                        let stats = &state.days[day_slot];
                        debug_assert!(stats.is_consistent(), "bucket counts diverged");
                        stats.summaries()
                    }
                    None => [BucketSummary::default(); 5],
                };
                detailed.push(DayRecord {
                    key,
                    day: *day,
                    buckets,
                });
            }

            lifetime.push(LifetimeRecord {
                key,
                summary: BucketSummary::from_gaps(
                    track.visits(),
                    track.total_gap_secs(),
                    track.gaps(),
                ),
            });
        }

        let never_visited = state.tracks.iter().filter(|t| t.is_empty()).count();
        debug!(never_visited, "Empty keys zero-filled");
        info!(
            keys = lifetime.len(),
            days = days.len(),
            rows = detailed.len(),
            "Aggregation finalized"
        );

        AggregationReport {
            days,
            detailed,
            lifetime,
        }
    }
}
