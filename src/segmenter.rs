//! Trajectory segmentation.
//!
//! Splits the time-ordered positions of a vehicle into trips. A trip ends when
//! the vehicle reports nothing new for at least the stationary gap limit, or
//! (optionally) when the calendar day changes. Repeated readings at the same
//! spot are dropped, and trips that end up too short are discarded.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::SegmenterConfig;
use crate::error::ConfigError;
use crate::geo::{GeoPosition, linestring_wkt};
use crate::parser::TimestampedPosition;
use chrono::{Duration, NaiveDateTime};

/// An ordered, non-empty run of positions of one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: u64,
    pub owner: i64,
    pub positions: Vec<TimestampedPosition>,
}

impl Trip {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn begin(&self) -> Option<NaiveDateTime> {
        self.positions.first().map(|p| p.timestamp)
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        self.positions.last().map(|p| p.timestamp)
    }

    pub fn locations(&self) -> Vec<GeoPosition> {
        self.positions.iter().map(|p| p.location).collect()
    }

    pub fn to_linestring_wkt(&self) -> String {
        linestring_wkt(&self.locations())
    }
}

/// Everything the segmenter carries between two calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmenterState {
    buffer: Vec<TimestampedPosition>,
    next_trip_id: u64,
}

impl SegmenterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts numbering emitted trips at `first_id`.
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            buffer: Vec::new(),
            next_trip_id: first_id,
        }
    }

    /// Positions of the trip currently being built.
    pub fn open_trip(&self) -> &[TimestampedPosition] {
        &self.buffer
    }

    pub fn next_trip_id(&self) -> u64 {
        self.next_trip_id
    }
}

/// Splits time-ordered positions into trips.
#[derive(Debug, Clone)]
pub struct TrajectorySegmenter {
    gap_limit: Duration,
    minimum_trip_length: usize,
    allow_cross_day_trips: bool,
}

impl TrajectorySegmenter {
    pub fn new(config: &SegmenterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            gap_limit: config.stationary_gap_limit()?,
            minimum_trip_length: config.minimum_trip_length,
            allow_cross_day_trips: config.allow_cross_day_trips,
        })
    }

    /// Feeds the next position. Returns a trip when `position` closed one.
    ///
    /// Positions must arrive in ascending time order per owner. A position of
    /// a different owner than the open trip closes that trip first.
    pub fn push(
        &self,
        state: &mut SegmenterState,
        position: TimestampedPosition,
    ) -> Option<Trip> {
        let Some(prev) = state.buffer.last().copied() else {
            state.buffer.push(position);
            return None;
        };

        if prev.owner != position.owner || self.starts_new_trip(&prev, &position) {
            let closed = self.close(state);
            state.buffer.push(position);
            return closed;
        }

        if prev.location.distance_meters(&position.location) > 0 {
            state.buffer.push(position);
        }
        None
    }

    /// Closes whatever trip is still open.
    pub fn finish(&self, state: &mut SegmenterState) -> Option<Trip> {
        self.close(state)
    }

    /// Segments a complete, time-ordered sequence in one go.
    pub fn segment(
        &self,
        state: &mut SegmenterState,
        positions: impl IntoIterator<Item = TimestampedPosition>,
    ) -> Vec<Trip> {
        let mut trips: Vec<Trip> = positions
            .into_iter()
            .filter_map(|p| self.push(state, p))
            .collect();
        trips.extend(self.finish(state));
        trips
    }

    fn starts_new_trip(&self, prev: &TimestampedPosition, next: &TimestampedPosition) -> bool {
        if next.timestamp - prev.timestamp >= self.gap_limit {
            return true;
        }
        !self.allow_cross_day_trips && next.timestamp.date() != prev.timestamp.date()
    }

    fn close(&self, state: &mut SegmenterState) -> Option<Trip> {
        let positions = std::mem::take(&mut state.buffer);
        let owner = positions.first()?.owner;

        if positions.len() <= self.minimum_trip_length {
            trace!(
                owner,
                positions = positions.len(),
                minimum = self.minimum_trip_length,
                "Discarding short trip"
            );
            return None;
        }

        let id = state.next_trip_id;
        state.next_trip_id += 1;
        Some(Trip {
            id,
            owner,
            positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2014, 2, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    /// Position `seconds` after 08:00, a little further east each time.
    fn pos_at(owner: i64, seconds: i64, step: u32) -> TimestampedPosition {
        TimestampedPosition::new(
            owner,
            base() + Duration::seconds(seconds),
            GeoPosition::new(41.9, 12.4 + step as f64 * 0.001),
        )
    }

    fn segmenter(gap_minutes: i64, min_len: usize, cross_day: bool) -> TrajectorySegmenter {
        TrajectorySegmenter::new(&SegmenterConfig {
            stationary_gap_minutes: gap_minutes,
            minimum_trip_length: min_len,
            allow_cross_day_trips: cross_day,
        })
        .unwrap()
    }

    fn sizes(trips: &[Trip]) -> Vec<usize> {
        trips.iter().map(Trip::len).collect()
    }

    #[test]
    fn test_two_trips_split_by_gap() {
        let input: Vec<_> = [0, 5, 70, 75]
            .iter()
            .enumerate()
            .map(|(i, m)| pos_at(1, m * 60, i as u32))
            .collect();

        let trips = segmenter(60, 1, true).segment(&mut SegmenterState::new(), input);
        assert_eq!(sizes(&trips), vec![2, 2]);
        assert_eq!(trips[0].positions[0].timestamp, base());
        assert_eq!(
            trips[1].positions[0].timestamp,
            base() + Duration::minutes(70)
        );
        assert_eq!(trips[0].id, 0);
        assert_eq!(trips[1].id, 1);
    }

    #[test]
    fn test_trips_of_minimum_length_are_discarded() {
        let input: Vec<_> = [0, 5, 70, 75]
            .iter()
            .enumerate()
            .map(|(i, m)| pos_at(1, m * 60, i as u32))
            .collect();

        let trips = segmenter(60, 2, true).segment(&mut SegmenterState::new(), input);
        assert!(trips.is_empty());
    }

    #[test]
    fn test_gap_exactly_at_limit_splits() {
        let seg = segmenter(60, 1, true);

        let at_limit = vec![pos_at(1, 0, 0), pos_at(1, 10, 1), pos_at(1, 3610, 2), pos_at(1, 3620, 3)];
        let trips = seg.segment(&mut SegmenterState::new(), at_limit);
        assert_eq!(sizes(&trips), vec![2, 2]);

        let below_limit = vec![pos_at(1, 0, 0), pos_at(1, 10, 1), pos_at(1, 3609, 2), pos_at(1, 3620, 3)];
        let trips = seg.segment(&mut SegmenterState::new(), below_limit);
        assert_eq!(sizes(&trips), vec![4]);
    }

    #[test]
    fn test_minimum_length_boundary() {
        let seg = segmenter(60, 3, true);

        let three: Vec<_> = (0..3).map(|i| pos_at(1, i * 30, i as u32)).collect();
        assert!(seg.segment(&mut SegmenterState::new(), three).is_empty());

        let four: Vec<_> = (0..4).map(|i| pos_at(1, i * 30, i as u32)).collect();
        assert_eq!(sizes(&seg.segment(&mut SegmenterState::new(), four)), vec![4]);
    }

    #[test]
    fn test_single_position_is_always_discarded() {
        let seg = segmenter(60, 1, true);
        let trips = seg.segment(&mut SegmenterState::new(), vec![pos_at(1, 0, 0)]);
        assert!(trips.is_empty());
    }

    #[test]
    fn test_zero_distance_positions_collapse() {
        let seg = segmenter(60, 1, true);
        let input = vec![
            pos_at(1, 0, 0),
            pos_at(1, 60, 0),
            pos_at(1, 120, 0),
            pos_at(1, 180, 1),
        ];

        let trips = seg.segment(&mut SegmenterState::new(), input);
        assert_eq!(sizes(&trips), vec![2]);
        // The gap is measured from the last position actually kept.
        assert_eq!(trips[0].positions[1].timestamp, base() + Duration::seconds(180));
    }

    #[test]
    fn test_stationary_readings_measure_gap_from_last_kept() {
        // Duplicates at 30 and 50 minutes are dropped, so the move at 65
        // minutes is 65 minutes after the last kept position.
        let seg = segmenter(60, 1, true);
        let input = vec![
            pos_at(1, 0, 0),
            pos_at(1, 60, 1),
            pos_at(1, 30 * 60, 1),
            pos_at(1, 50 * 60, 1),
            pos_at(1, 65 * 60, 2),
            pos_at(1, 66 * 60, 3),
        ];

        let trips = seg.segment(&mut SegmenterState::new(), input);
        assert_eq!(sizes(&trips), vec![2, 2]);
    }

    #[test]
    fn test_day_boundary() {
        let late = NaiveDate::from_ymd_opt(2014, 2, 3)
            .unwrap()
            .and_hms_opt(23, 58, 0)
            .unwrap();
        let input: Vec<_> = (0..4)
            .map(|i| {
                TimestampedPosition::new(
                    1,
                    late + Duration::minutes(i),
                    GeoPosition::new(41.9, 12.4 + i as f64 * 0.001),
                )
            })
            .collect();

        let same_day_only = segmenter(60, 1, false);
        let trips = same_day_only.segment(&mut SegmenterState::new(), input.clone());
        assert_eq!(sizes(&trips), vec![2, 2]);

        let cross_day = segmenter(60, 1, true);
        let trips = cross_day.segment(&mut SegmenterState::new(), input);
        assert_eq!(sizes(&trips), vec![4]);
    }

    #[test]
    fn test_owner_change_closes_trip() {
        let seg = segmenter(60, 1, true);
        let input = vec![
            pos_at(1, 0, 0),
            pos_at(1, 10, 1),
            pos_at(2, 20, 2),
            pos_at(2, 30, 3),
        ];

        let trips = seg.segment(&mut SegmenterState::new(), input);
        assert_eq!(trips.len(), 2);
        assert_eq!(trips[0].owner, 1);
        assert_eq!(trips[1].owner, 2);
    }

    #[test]
    fn test_deterministic() {
        let seg = segmenter(5, 2, false);
        let input: Vec<_> = (0..50)
            .map(|i| pos_at(7, i * 200 + i * 97 % 150, (i % 7) as u32))
            .collect();

        let first = seg.segment(&mut SegmenterState::new(), input.clone());
        let second = seg.segment(&mut SegmenterState::new(), input);
        assert_eq!(first, second);
    }

    #[test]
    fn test_state_survives_serialization_mid_stream() {
        let seg = segmenter(60, 1, true);
        let input: Vec<_> = [0, 5, 70, 75]
            .iter()
            .enumerate()
            .map(|(i, m)| pos_at(1, m * 60, i as u32))
            .collect();

        let mut state = SegmenterState::new();
        let mut trips: Vec<Trip> = input[..3].iter().filter_map(|p| seg.push(&mut state, *p)).collect();

        let saved = serde_json::to_string(&state).unwrap();
        let mut resumed: SegmenterState = serde_json::from_str(&saved).unwrap();
        assert_eq!(resumed.open_trip().len(), 1);

        trips.extend(input[3..].iter().filter_map(|p| seg.push(&mut resumed, *p)));
        trips.extend(seg.finish(&mut resumed));
        assert_eq!(sizes(&trips), vec![2, 2]);
    }

    #[test]
    fn test_out_of_range_gap_limit_is_rejected() {
        let config = SegmenterConfig {
            stationary_gap_minutes: i64::MAX / 60,
            ..Default::default()
        };
        assert!(matches!(
            TrajectorySegmenter::new(&config),
            Err(ConfigError::MinutesOutOfRange { .. })
        ));
    }

    #[test]
    fn test_trip_linestring() {
        let trip = Trip {
            id: 0,
            owner: 1,
            positions: vec![
                TimestampedPosition::new(1, base(), GeoPosition::new(41.0, 12.0)),
                TimestampedPosition::new(1, base(), GeoPosition::new(41.5, 12.5)),
            ],
        };
        assert_eq!(trip.to_linestring_wkt(), "LINESTRING(12 41, 12.5 41.5)");
    }
}
