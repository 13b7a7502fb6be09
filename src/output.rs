//! CSV result sinks.
//!
//! Every sink writes a headed CSV file, optionally gzip-compressed. In append
//! mode the header is only written when the file does not exist yet.

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};
use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::aggregator::{AggregationReport, BucketSummary, DirectedEdge, TimeBucket};
use crate::grid::{Grid, GridCell};
use crate::pipeline::EdgeAttributes;
use crate::segmenter::Trip;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a sink file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkOptions {
    pub gzip: bool,
    pub append: bool,
}

enum Records<'a, T> {
    Serialized(&'a mut dyn Iterator<Item = T>),
    Raw {
        header: Vec<String>,
        rows: &'a mut dyn Iterator<Item = Vec<String>>,
    },
}

fn write_to<W: Write, T: Serialize>(
    writer: &mut csv::Writer<W>,
    records: Records<'_, T>,
    write_header: bool,
) -> Result<usize> {
    let mut count = 0;
    match records {
        Records::Serialized(rows) => {
            for row in rows {
                writer.serialize(row)?;
                count += 1;
            }
        }
        Records::Raw { header, rows } => {
            if write_header {
                writer.write_record(&header)?;
            }
            for row in rows {
                writer.write_record(&row)?;
                count += 1;
            }
        }
    }
    writer.flush()?;
    Ok(count)
}

fn write_csv<T: Serialize>(
    path: &Path,
    options: SinkOptions,
    records: Records<'_, T>,
) -> Result<usize> {
    let file_exists = path.exists();
    let write_header = !(options.append && file_exists);
    debug!(path = %path.display(), file_exists, ?options, "Writing CSV");

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(options.append)
        .truncate(!options.append)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut builder = WriterBuilder::new();
    // serialized rows write their own header from the field names
    builder.has_headers(write_header);

    let count = if options.gzip {
        let mut writer = builder.from_writer(GzEncoder::new(file, Compression::default()));
        let count = write_to(&mut writer, records, write_header)?;
        writer
            .into_inner()
            .map_err(|e| anyhow!("flushing {}: {}", path.display(), e.error()))?
            .finish()?;
        count
    } else {
        let mut writer = builder.from_writer(BufWriter::new(file));
        write_to(&mut writer, records, write_header)?
    };

    info!(path = %path.display(), rows = count, "CSV written");
    Ok(count)
}

fn write_serialized<T: Serialize>(
    path: impl AsRef<Path>,
    options: SinkOptions,
    rows: impl IntoIterator<Item = T>,
) -> Result<usize> {
    let mut rows = rows.into_iter();
    write_csv(path.as_ref(), options, Records::Serialized(&mut rows))
}

fn write_raw(
    path: impl AsRef<Path>,
    options: SinkOptions,
    header: Vec<String>,
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Result<usize> {
    let mut rows = rows.into_iter();
    write_csv::<()>(
        path.as_ref(),
        options,
        Records::Raw {
            header,
            rows: &mut rows,
        },
    )
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Serialize)]
pub struct TripRow {
    pub trip_id: u64,
    pub owner_id: i64,
    pub begin_at: String,
    pub end_at: String,
    pub positions: usize,
    pub the_geom: String,
}

impl From<&Trip> for TripRow {
    fn from(trip: &Trip) -> Self {
        Self {
            trip_id: trip.id,
            owner_id: trip.owner,
            begin_at: trip.begin().map(format_timestamp).unwrap_or_default(),
            end_at: trip.end().map(format_timestamp).unwrap_or_default(),
            positions: trip.len(),
            the_geom: trip.to_linestring_wkt(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TripPositionRow {
    pub owner_id: i64,
    pub trip_id: u64,
    pub timestamp: String,
    pub the_geom: String,
}

/// One row per trip, with its path as a `LINESTRING`.
pub fn write_trips(
    path: impl AsRef<Path>,
    options: SinkOptions,
    trips: &[Trip],
) -> Result<usize> {
    write_serialized(path, options, trips.iter().map(TripRow::from))
}

/// One row per position of every trip.
pub fn write_trip_positions(
    path: impl AsRef<Path>,
    options: SinkOptions,
    trips: &[Trip],
) -> Result<usize> {
    let rows = trips.iter().flat_map(|trip| {
        trip.positions.iter().map(move |p| TripPositionRow {
            owner_id: trip.owner,
            trip_id: trip.id,
            timestamp: format_timestamp(p.timestamp),
            the_geom: p.location.to_wkt(),
        })
    });
    write_serialized(path, options, rows)
}

/// Rows passed through from an input file, e.g. after area filtering.
pub fn write_records(
    path: impl AsRef<Path>,
    options: SinkOptions,
    header: Vec<String>,
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Result<usize> {
    write_raw(path, options, header, rows)
}

/// Buckets in output column order.
const COLUMN_ORDER: [TimeBucket; 5] = [
    TimeBucket::WholeDay,
    TimeBucket::EarlyMorning,
    TimeBucket::MidMorning,
    TimeBucket::Afternoon,
    TimeBucket::Evening,
];

fn bucket_header() -> Vec<String> {
    COLUMN_ORDER
        .iter()
        .flat_map(|b| {
            ["visits", "total_gap_secs", "avg_gap_secs", "median_gap_secs"]
                .map(|field| format!("{}_{field}", b.name()))
        })
        .collect()
}

fn bucket_columns(buckets: &[BucketSummary; 5]) -> Vec<String> {
    COLUMN_ORDER
        .iter()
        .flat_map(|b| {
            let s = &buckets[b.index()];
            [
                s.visits.to_string(),
                s.total_gap_secs.to_string(),
                s.avg_gap_secs.to_string(),
                s.median_gap_secs.to_string(),
            ]
        })
        .collect()
}

fn write_detailed<K>(
    path: impl AsRef<Path>,
    options: SinkOptions,
    report: &AggregationReport<K>,
    key_header: &[&str],
    key_columns: impl Fn(&K) -> Vec<String>,
) -> Result<usize> {
    let mut header: Vec<String> = key_header.iter().map(|h| h.to_string()).collect();
    header.push("day".into());
    header.extend(bucket_header());

    let rows = report.detailed.iter().map(|record| {
        let mut row = key_columns(&record.key);
        row.push(format_day(record.day));
        row.extend(bucket_columns(&record.buckets));
        row
    });
    write_raw(path, options, header, rows)
}

/// One row per edge and day, zero-filled.
pub fn write_edge_detailed(
    path: impl AsRef<Path>,
    options: SinkOptions,
    report: &AggregationReport<DirectedEdge>,
) -> Result<usize> {
    write_detailed(
        path,
        options,
        report,
        &["origin_id", "destination_id"],
        |edge| vec![edge.origin.to_string(), edge.destination.to_string()],
    )
}

#[derive(Debug, Serialize)]
pub struct EdgeSimpleRow {
    pub origin_id: i64,
    pub destination_id: i64,
    pub visits: u64,
    pub total_gap_secs: i64,
    pub avg_gap_secs: f64,
    pub median_gap_secs: f64,
    pub tags: Option<String>,
    pub the_geom: Option<String>,
}

/// One row per edge with lifetime totals.
pub fn write_edge_simple(
    path: impl AsRef<Path>,
    options: SinkOptions,
    report: &AggregationReport<DirectedEdge>,
    attributes: &BTreeMap<DirectedEdge, EdgeAttributes>,
) -> Result<usize> {
    let rows = report.lifetime.iter().map(|record| {
        let attrs = attributes.get(&record.key);
        EdgeSimpleRow {
            origin_id: record.key.origin,
            destination_id: record.key.destination,
            visits: record.summary.visits,
            total_gap_secs: record.summary.total_gap_secs,
            avg_gap_secs: record.summary.avg_gap_secs,
            median_gap_secs: record.summary.median_gap_secs,
            tags: attrs.and_then(|a| a.tags.clone()),
            the_geom: attrs.and_then(|a| a.geometry.clone()),
        }
    });
    write_serialized(path, options, rows)
}

/// One row per cell and day, zero-filled.
pub fn write_grid_detailed(
    path: impl AsRef<Path>,
    options: SinkOptions,
    report: &AggregationReport<GridCell>,
    grid: &Grid,
) -> Result<usize> {
    write_detailed(
        path,
        options,
        report,
        &["cell_id", "row", "column"],
        |cell| {
            vec![
                grid.cell_id(*cell).to_string(),
                cell.row.to_string(),
                cell.column.to_string(),
            ]
        },
    )
}

#[derive(Debug, Serialize)]
pub struct GridSimpleRow {
    pub cell_id: usize,
    pub row: usize,
    pub column: usize,
    pub visits: u64,
    pub total_gap_secs: i64,
    pub avg_gap_secs: f64,
    pub median_gap_secs: f64,
    pub the_geom: String,
}

/// One row per cell with lifetime totals and the cell outline.
pub fn write_grid_simple(
    path: impl AsRef<Path>,
    options: SinkOptions,
    report: &AggregationReport<GridCell>,
    grid: &Grid,
) -> Result<usize> {
    let rows = report.lifetime.iter().map(|record| GridSimpleRow {
        cell_id: grid.cell_id(record.key),
        row: record.key.row,
        column: record.key.column,
        visits: record.summary.visits,
        total_gap_secs: record.summary.total_gap_secs,
        avg_gap_secs: record.summary.avg_gap_secs,
        median_gap_secs: record.summary.median_gap_secs,
        the_geom: grid.bounds(record.key).to_wkt(),
    });
    write_serialized(path, options, rows)
}
