//! Run orchestration.
//!
//! A run goes through three entry points: [`Pipeline::new`] validates the
//! configuration, one of the `process`/`segment_rows`/`aggregate_edge_visits`
//! calls consumes a row stream, and [`Pipeline::finalize`] projects the
//! aggregated state into result rows. Bad rows and matcher failures are
//! skipped and counted in a [`PipelineReport`]; only a rejected configuration
//! or a cancellation stop a run.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::aggregator::{
    AggregationReport, AggregatorState, DirectedEdge, SegmentVisitAggregator, VisitInterval,
    VisitOutcome,
};
use crate::config::{AggregatorConfig, PipelineConfig};
use crate::error::{ConfigError, PipelineError};
use crate::filter::AreaFilter;
use crate::grid::{Grid, GridCell, HitFilter, hits_from_visits};
use crate::matcher::{MapMatcher, MatchFailures, MatchedVisit, merge_repeated_edges};
use crate::parser::{
    RawEdgeVisit, RawPosition, RowIssue, TimestampedPosition, parse_edge_visit, parse_position,
};
use crate::segmenter::{SegmenterState, TrajectorySegmenter, Trip};

/// Skipped input rows, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkippedRows {
    pub unreadable: usize,
    pub bad_timestamp: usize,
    pub bad_geometry: usize,
    pub invalid_coordinates: usize,
    pub missing_field: usize,
}

impl SkippedRows {
    fn record(&mut self, issue: &RowIssue) {
        match issue {
            RowIssue::BadTimestamp => self.bad_timestamp += 1,
            RowIssue::BadGeometry => self.bad_geometry += 1,
            RowIssue::InvalidCoordinates => self.invalid_coordinates += 1,
            RowIssue::MissingField(_) => self.missing_field += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.unreadable
            + self.bad_timestamp
            + self.bad_geometry
            + self.invalid_coordinates
            + self.missing_field
    }
}

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub rows_read: usize,
    pub skipped: SkippedRows,
    pub owners: usize,
    pub trips: usize,
    pub matched_trips: usize,
    pub visits: usize,
    pub coalesced_visits: usize,
    pub never_visited_edges: usize,
    /// Rows dropped because their geometry is not inside the filter area.
    pub outside_area: usize,
    pub match_failures: MatchFailures,
}

/// Tags and geometry of an edge, as found in the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeAttributes {
    pub tags: Option<String>,
    pub geometry: Option<String>,
}

/// Result of [`Pipeline::segment_rows`].
#[derive(Debug, Clone)]
pub struct SegmentedRun {
    pub trips: Vec<Trip>,
    pub report: PipelineReport,
}

/// Result of [`Pipeline::process`] and [`Pipeline::aggregate_edge_visits`].
#[derive(Debug, Clone)]
pub struct AggregatedRun {
    pub trips: Vec<Trip>,
    /// Matched visits after merging repeated edges, in ingestion order.
    pub visits: Vec<MatchedVisit>,
    pub state: AggregatorState<DirectedEdge>,
    pub attributes: BTreeMap<DirectedEdge, EdgeAttributes>,
    pub report: PipelineReport,
}

/// Grid coverage result.
#[derive(Debug, Clone)]
pub struct GridRun {
    pub grid: Grid,
    pub hits: usize,
    pub kept_hits: usize,
    pub aggregation: AggregationReport<GridCell>,
}

pub struct Pipeline {
    config: PipelineConfig,
    segmenter: TrajectorySegmenter,
    aggregator: SegmentVisitAggregator,
    area: Option<AreaFilter>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Pipeline {
    /// Validates `config`; nothing is processed when it is rejected.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let segmenter = TrajectorySegmenter::new(&config.segmenter)?;
        let aggregator = SegmentVisitAggregator::new(config.aggregator.clone())?;
        let area = config
            .area
            .map(|area| AreaFilter::new(area, config.coordinate_order))
            .transpose()?;
        Ok(Self {
            config,
            segmenter,
            aggregator,
            area,
            cancel: None,
        })
    }

    /// Stops the run at the next row or trip once `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn check_cancelled(&self, rows_read: usize) -> Result<(), PipelineError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                warn!(rows_read, "Run cancelled, discarding partial state");
                Err(PipelineError::Cancelled { rows_read })
            }
            _ => Ok(()),
        }
    }

    fn outside_area(&self, geometry: Option<&str>) -> bool {
        self.area
            .as_ref()
            .is_some_and(|filter| !filter.keeps_field(geometry))
    }

    /// Reads positions and groups them per owner, time-ordered. Equal
    /// timestamps keep their input order.
    fn read_positions<E: Display>(
        &self,
        rows: impl IntoIterator<Item = Result<RawPosition, E>>,
        report: &mut PipelineReport,
    ) -> Result<BTreeMap<i64, Vec<TimestampedPosition>>, PipelineError> {
        let mut by_owner: BTreeMap<i64, Vec<TimestampedPosition>> = BTreeMap::new();

        for row in rows {
            self.check_cancelled(report.rows_read)?;
            report.rows_read += 1;
            let line = report.rows_read;

            let raw = match row {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(line, error = %e, "Skipping unreadable position row");
                    report.skipped.unreadable += 1;
                    continue;
                }
            };
            if self.outside_area(Some(&raw.geometry)) {
                debug!(line, owner = raw.owner_id, "Position outside the filter area");
                report.outside_area += 1;
                continue;
            }

            match parse_position(&raw, self.config.coordinate_order) {
                Ok(position) => by_owner.entry(position.owner).or_default().push(position),
                Err(issue) => {
                    warn!(
                        line,
                        owner = raw.owner_id,
                        issue = issue.as_str(),
                        "Skipping position row"
                    );
                    report.skipped.record(&issue);
                }
            }
        }

        for positions in by_owner.values_mut() {
            positions.sort_by_key(|p| p.timestamp);
        }
        report.owners = by_owner.len();
        Ok(by_owner)
    }

    /// Reads, groups and segments positions into trips.
    #[tracing::instrument(skip_all)]
    pub fn segment_rows<E: Display>(
        &self,
        rows: impl IntoIterator<Item = Result<RawPosition, E>>,
    ) -> Result<SegmentedRun, PipelineError> {
        let mut report = PipelineReport::default();
        let by_owner = self.read_positions(rows, &mut report)?;

        let mut state = SegmenterState::new();
        let mut trips = Vec::new();
        for (owner, positions) in by_owner {
            let before = trips.len();
            trips.extend(self.segmenter.segment(&mut state, positions));
            debug!(owner, trips = trips.len() - before, "Owner segmented");
        }
        report.trips = trips.len();

        info!(
            rows_read = report.rows_read,
            skipped = report.skipped.total(),
            owners = report.owners,
            trips = report.trips,
            "Segmentation complete"
        );
        Ok(SegmentedRun { trips, report })
    }

    /// Segments positions, map-matches every trip and aggregates the
    /// matched visits per directed edge.
    #[tracing::instrument(skip_all)]
    pub fn process<E: Display, M: MapMatcher>(
        &self,
        rows: impl IntoIterator<Item = Result<RawPosition, E>>,
        matcher: &mut M,
    ) -> Result<AggregatedRun, PipelineError> {
        let SegmentedRun { trips, mut report } = self.segment_rows(rows)?;

        let mut state = AggregatorState::new();
        let mut all_visits = Vec::new();

        for trip in &trips {
            self.check_cancelled(report.rows_read)?;

            let visits = match matcher.match_trip(trip) {
                Ok(visits) => merge_repeated_edges(visits),
                Err(e) => {
                    report.match_failures.record(trip, &e);
                    continue;
                }
            };
            report.matched_trips += 1;

            for visit in &visits {
                self.ingest(&mut state, visit.edge, &visit.interval, &mut report);
            }
            all_visits.extend(visits);
        }

        info!(
            trips = report.trips,
            matched = report.matched_trips,
            failures = report.match_failures.total(),
            visits = report.visits,
            edges = state.len(),
            "Map matching and aggregation complete"
        );
        Ok(AggregatedRun {
            trips,
            visits: all_visits,
            state,
            attributes: BTreeMap::new(),
            report,
        })
    }

    /// Aggregates already matched edge visits on top of `state`, which is
    /// either fresh or restored from a checkpoint.
    #[tracing::instrument(skip_all, fields(known_edges = state.len()))]
    pub fn aggregate_edge_visits<E: Display>(
        &self,
        mut state: AggregatorState<DirectedEdge>,
        rows: impl IntoIterator<Item = Result<RawEdgeVisit, E>>,
    ) -> Result<AggregatedRun, PipelineError> {
        let mut report = PipelineReport::default();
        let mut visits = Vec::new();
        let mut attributes: BTreeMap<DirectedEdge, EdgeAttributes> = BTreeMap::new();

        for row in rows {
            self.check_cancelled(report.rows_read)?;
            report.rows_read += 1;
            let line = report.rows_read;

            let raw = match row {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(line, error = %e, "Skipping unreadable edge visit row");
                    report.skipped.unreadable += 1;
                    continue;
                }
            };
            if self.outside_area(raw.the_geom.as_deref()) {
                debug!(
                    line,
                    origin = raw.origin_id,
                    destination = raw.destination_id,
                    "Edge outside the filter area"
                );
                report.outside_area += 1;
                continue;
            }

            let record = match parse_edge_visit(&raw, self.config.coordinate_order) {
                Ok(record) => record,
                Err(issue) => {
                    warn!(
                        line,
                        origin = raw.origin_id,
                        destination = raw.destination_id,
                        issue = issue.as_str(),
                        "Skipping edge visit row"
                    );
                    report.skipped.record(&issue);
                    continue;
                }
            };

            let known = attributes.entry(record.edge).or_default();
            if known.tags.is_none() {
                known.tags = record.tags.clone();
            }
            if known.geometry.is_none() {
                known.geometry = record.geometry.clone();
            }

            match record.visit {
                Some(interval) => {
                    self.ingest(&mut state, record.edge, &interval, &mut report);
                    visits.push(MatchedVisit::new(record.edge, interval).with_path(record.path));
                }
                None => {
                    state.register(record.edge);
                    report.never_visited_edges += 1;
                }
            }
        }

        info!(
            rows_read = report.rows_read,
            skipped = report.skipped.total(),
            visits = report.visits,
            coalesced = report.coalesced_visits,
            edges = state.len(),
            "Edge visits aggregated"
        );
        Ok(AggregatedRun {
            trips: Vec::new(),
            visits,
            state,
            attributes,
            report,
        })
    }

    fn ingest(
        &self,
        state: &mut AggregatorState<DirectedEdge>,
        edge: DirectedEdge,
        interval: &VisitInterval,
        report: &mut PipelineReport,
    ) {
        report.visits += 1;
        if self.aggregator.ingest(state, edge, interval) == VisitOutcome::Coalesced {
            report.coalesced_visits += 1;
        }
    }

    /// Detailed and lifetime rows for every edge seen in the run.
    pub fn finalize(
        &self,
        state: &AggregatorState<DirectedEdge>,
    ) -> AggregationReport<DirectedEdge> {
        self.aggregator.finalize(state)
    }

    /// Aggregates matched visits per grid cell.
    ///
    /// Every cell is reported, visited or not, for every day a visit begins on.
    #[tracing::instrument(skip_all)]
    pub fn grid_coverage(&self, visits: &[MatchedVisit]) -> Result<GridRun, PipelineError> {
        let grid = Grid::new(self.config.grid.clone())?;
        let aggregator = SegmentVisitAggregator::new(AggregatorConfig {
            minimum_gap_secs: 0,
            ..self.config.aggregator.clone()
        })?;

        let mut state: AggregatorState<GridCell> = AggregatorState::new();
        for cell in grid.cells() {
            state.register(cell);
        }
        for visit in visits {
            state.observe_day(visit.interval.begin.date());
        }

        let hits = hits_from_visits(&grid, visits);
        let mut filter = HitFilter::new(self.config.grid.min_minutes_between_hits)?;
        let mut kept_hits = 0;
        for (i, hit) in hits.iter().enumerate() {
            self.check_cancelled(i)?;
            if filter.keep(hit) {
                let visit = VisitInterval::instant(hit.timestamp, hit.owner);
                aggregator.ingest(&mut state, hit.cell, &visit);
                kept_hits += 1;
            }
        }

        info!(
            cells = grid.len(),
            hits = hits.len(),
            kept_hits,
            "Grid coverage complete"
        );
        Ok(GridRun {
            aggregation: aggregator.finalize(&state),
            grid,
            hits: hits.len(),
            kept_hits,
        })
    }
}
