use fcd_analyzer::aggregator::{AggregatorState, DirectedEdge, TimeBucket, VisitInterval};
use fcd_analyzer::config::PipelineConfig;
use fcd_analyzer::error::MatchError;
use fcd_analyzer::filter::{AreaFilter, filter_records};
use fcd_analyzer::geo::{BoundingBox, CoordinateOrder, GeoPosition};
use fcd_analyzer::input::{read_edge_visits, read_positions, read_records};
use fcd_analyzer::matcher::MatchedVisit;
use fcd_analyzer::output::{
    SinkOptions, write_edge_detailed, write_edge_simple, write_grid_simple, write_records,
    write_trips,
};
use fcd_analyzer::pipeline::Pipeline;
use fcd_analyzer::segmenter::Trip;
use std::env;
use std::fs;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn temp_path(name: &str) -> PathBuf {
    env::temp_dir().join(name)
}

/// Splits every trip into two edges at its middle position.
fn fake_matcher(trip: &Trip) -> Result<Vec<MatchedVisit>, MatchError> {
    if trip.len() > 18 {
        return Err(MatchError::TraceTooLarge {
            positions: trip.len(),
        });
    }
    let mid = trip.len() / 2;
    let first = &trip.positions[0];
    let middle = &trip.positions[mid];
    let last = &trip.positions[trip.len() - 1];

    let a = DirectedEdge::new(trip.owner, 1000);
    let b = DirectedEdge::new(1000, trip.owner);
    Ok(vec![
        MatchedVisit::new(a, VisitInterval::new(first.timestamp, middle.timestamp, trip.owner))
            .with_path(vec![first.location, middle.location]),
        MatchedVisit::new(b, VisitInterval::new(middle.timestamp, last.timestamp, trip.owner))
            .with_path(vec![middle.location, last.location]),
    ])
}

#[test]
fn test_segment_fixture() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let rows = read_positions(fixture("positions.csv"), b',').unwrap();
    let run = pipeline.segment_rows(rows).unwrap();

    assert_eq!(run.report.rows_read, 45);
    assert_eq!(run.report.skipped.bad_timestamp, 1);
    assert_eq!(run.report.skipped.invalid_coordinates, 1);
    assert_eq!(run.report.owners, 2);

    // owner 156: 20 positions then a short second trip that is discarded;
    // owner 157: 18 positions, two of them repeated readings
    assert_eq!(run.trips.len(), 2);
    assert_eq!((run.trips[0].id, run.trips[0].owner), (0, 156));
    assert_eq!(run.trips[0].len(), 20);
    assert_eq!((run.trips[1].id, run.trips[1].owner), (1, 157));
    assert_eq!(run.trips[1].len(), 16);

    let path = temp_path("fcd_analyzer_it_trips.csv");
    let _ = fs::remove_file(&path);
    assert_eq!(
        write_trips(&path, SinkOptions::default(), &run.trips).unwrap(),
        2
    );
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("0,156,2014-02-01 08:00:00,2014-02-01 08:03:10,20,"));
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_segmentation_is_deterministic() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let first = pipeline
        .segment_rows(read_positions(fixture("positions.csv"), b',').unwrap())
        .unwrap();
    let second = pipeline
        .segment_rows(read_positions(fixture("positions.csv"), b',').unwrap())
        .unwrap();
    assert_eq!(first.trips, second.trips);
}

#[test]
fn test_full_chain_with_fake_matcher() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let rows = read_positions(fixture("positions.csv"), b',').unwrap();
    let mut matcher = fake_matcher;
    let run = pipeline.process(rows, &mut matcher).unwrap();

    // the 20 position trip is too large for the fake matcher
    assert_eq!(run.report.match_failures.trace_too_large, 1);
    assert_eq!(run.report.matched_trips, 1);
    assert_eq!(run.report.visits, 2);

    let report = pipeline.finalize(&run.state);
    let keys: Vec<_> = report.lifetime.iter().map(|r| r.key).collect();
    assert_eq!(
        keys,
        vec![DirectedEdge::new(157, 1000), DirectedEdge::new(1000, 157)]
    );
    for record in &report.detailed {
        assert_eq!(record.bucket(TimeBucket::MidMorning).visits, 1);
        assert_eq!(record.bucket(TimeBucket::WholeDay).visits, 1);
    }
}

#[test]
fn test_aggregate_edge_visit_fixture() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let rows = read_edge_visits(fixture("edge_visits.csv"), b',').unwrap();
    let run = pipeline
        .aggregate_edge_visits(AggregatorState::new(), rows)
        .unwrap();

    assert_eq!(run.report.rows_read, 7);
    assert_eq!(run.report.skipped.bad_timestamp, 1);
    assert_eq!(run.report.visits, 5);
    assert_eq!(run.report.never_visited_edges, 1);

    let report = pipeline.finalize(&run.state);
    assert_eq!(report.days.len(), 2);
    // three edges, every one of them on both days
    assert_eq!(report.detailed.len(), 6);

    let ab = DirectedEdge::new(1, 2);
    let ab_days: Vec<_> = report.detailed.iter().filter(|r| r.key == ab).collect();
    assert_eq!(ab_days[0].bucket(TimeBucket::MidMorning).visits, 2);
    assert_eq!(ab_days[0].bucket(TimeBucket::MidMorning).total_gap_secs, 270);
    assert_eq!(ab_days[1].bucket(TimeBucket::Evening).visits, 2);
    assert_eq!(ab_days[1].bucket(TimeBucket::WholeDay).visits, 2);

    let ba_days: Vec<_> = report
        .detailed
        .iter()
        .filter(|r| r.key == ab.reversed())
        .collect();
    assert_eq!(ba_days[0].bucket(TimeBucket::Afternoon).visits, 1);
    assert_eq!(ba_days[1].bucket(TimeBucket::WholeDay).visits, 0);

    let never = report
        .lifetime
        .iter()
        .find(|r| r.key == DirectedEdge::new(5, 6))
        .unwrap();
    assert_eq!(never.summary.visits, 0);

    for record in &report.detailed {
        let narrow: u64 = TimeBucket::NARROW
            .iter()
            .map(|b| record.bucket(*b).visits)
            .sum();
        assert_eq!(narrow, record.bucket(TimeBucket::WholeDay).visits);
    }

    let detailed = temp_path("fcd_analyzer_it_edges_detailed.csv");
    let simple = temp_path("fcd_analyzer_it_edges_simple.csv");
    assert_eq!(
        write_edge_detailed(&detailed, SinkOptions::default(), &report).unwrap(),
        6
    );
    assert_eq!(
        write_edge_simple(&simple, SinkOptions::default(), &report, &run.attributes).unwrap(),
        3
    );
    let content = fs::read_to_string(&simple).unwrap();
    assert!(content.lines().nth(1).unwrap().starts_with("1,2,4,"));
    assert!(content.contains("highway=service"));
    fs::remove_file(&detailed).unwrap();
    fs::remove_file(&simple).unwrap();
}

#[test]
fn test_checkpoint_and_resume() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let first = pipeline
        .aggregate_edge_visits(
            AggregatorState::new(),
            read_edge_visits(fixture("edge_visits.csv"), b',').unwrap(),
        )
        .unwrap();

    let path = temp_path("fcd_analyzer_it_state.msgpack");
    fs::write(&path, first.state.checkpoint().unwrap()).unwrap();
    let restored: AggregatorState<DirectedEdge> =
        AggregatorState::restore(&fs::read(&path).unwrap()).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(
        pipeline.finalize(&restored),
        pipeline.finalize(&first.state)
    );

    // feeding the same visits again counts each of them once more
    let second = pipeline
        .aggregate_edge_visits(
            restored,
            read_edge_visits(fixture("edge_visits.csv"), b',').unwrap(),
        )
        .unwrap();
    let report = pipeline.finalize(&second.state);
    let ab = report
        .lifetime
        .iter()
        .find(|r| r.key == DirectedEdge::new(1, 2))
        .unwrap();
    assert_eq!(ab.summary.visits, 8);
}

#[test]
fn test_grid_coverage_fixture() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let rows = read_edge_visits(fixture("edge_visits.csv"), b',').unwrap();
    let run = pipeline
        .aggregate_edge_visits(AggregatorState::new(), rows)
        .unwrap();

    let grid_run = pipeline.grid_coverage(&run.visits).unwrap();
    assert_eq!(grid_run.hits, 5);
    // owner 12 stays in the same cell for exactly ten minutes
    assert_eq!(grid_run.kept_hits, 4);

    let report = &grid_run.aggregation;
    assert_eq!(report.lifetime.len(), 100);
    assert_eq!(report.detailed.len(), 200);

    let cell = grid_run
        .grid
        .cell_for(&GeoPosition::new(41.89, 12.485))
        .unwrap();
    let visited: Vec<_> = report
        .lifetime
        .iter()
        .filter(|r| r.summary.visits > 0)
        .collect();
    assert_eq!(visited.len(), 1);
    assert_eq!(visited[0].key, cell);
    assert_eq!(visited[0].summary.visits, 4);

    let path = temp_path("fcd_analyzer_it_grid_simple.csv");
    assert_eq!(
        write_grid_simple(&path, SinkOptions::default(), report, &grid_run.grid).unwrap(),
        100
    );
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_gzip_append_reads_back_every_row() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let run = pipeline
        .segment_rows(read_positions(fixture("positions.csv"), b',').unwrap())
        .unwrap();

    let path = temp_path("fcd_analyzer_it_trips_appended.csv.gz");
    let _ = fs::remove_file(&path);
    let options = SinkOptions {
        gzip: true,
        append: true,
    };
    write_trips(&path, options, &run.trips).unwrap();
    write_trips(&path, options, &run.trips).unwrap();

    let (header, records) = read_records(&path, b',').unwrap();
    assert_eq!(header[0], "trip_id");
    let records: Vec<_> = records.collect::<Result<_, _>>().unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[2].get(1), Some("156"));
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_filter_edge_visit_fixture() {
    let filter = AreaFilter::new(
        BoundingBox::new(41.8, 42.0, 12.4, 12.6),
        CoordinateOrder::LonLat,
    )
    .unwrap();
    let (header, records) = read_records(fixture("edge_visits.csv"), b',').unwrap();
    let column = header.iter().position(|h| h == "the_geom").unwrap();

    let (kept, report) = filter_records(&filter, column, records);
    // the two rows without a geometry are dropped
    assert_eq!(report.kept, 5);
    assert_eq!(report.outside, 2);

    let path = temp_path("fcd_analyzer_it_filtered.csv");
    let _ = fs::remove_file(&path);
    assert_eq!(
        write_records(&path, SinkOptions::default(), header, kept).unwrap(),
        5
    );

    // the filtered file is still a valid edge visit input
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let run = pipeline
        .aggregate_edge_visits(
            AggregatorState::new(),
            read_edge_visits(&path, b',').unwrap(),
        )
        .unwrap();
    assert_eq!(run.report.visits, 5);
    fs::remove_file(&path).unwrap();

    let narrow = AreaFilter::new(
        BoundingBox::new(41.88, 41.9, 12.485, 12.5),
        CoordinateOrder::LonLat,
    )
    .unwrap();
    let (_, records) = read_records(fixture("edge_visits.csv"), b',').unwrap();
    let (kept, _) = filter_records(&narrow, column, records);
    // every edge straddles the western border
    assert!(kept.is_empty());
}
