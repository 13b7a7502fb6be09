//! CSV row sources.
//!
//! Files ending in `.gz` are decompressed on the fly. Rows are handed out as
//! `Result`s so a single bad line is skipped by the pipeline instead of
//! failing the whole read.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use flate2::read::MultiGzDecoder;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::parser::{RawEdgeVisit, RawPosition};

fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let gzipped = path.extension().and_then(|e| e.to_str()) == Some("gz");
    debug!(path = %path.display(), gzipped, "Opening CSV source");

    if gzipped {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Streams the rows of a headed CSV file.
pub fn read_rows<T: DeserializeOwned>(
    path: impl AsRef<Path>,
    delimiter: u8,
) -> Result<impl Iterator<Item = csv::Result<T>>> {
    let reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(open(path.as_ref())?);
    Ok(reader.into_deserialize())
}

/// Untyped records with their header, for passing rows through unchanged.
pub fn read_records(
    path: impl AsRef<Path>,
    delimiter: u8,
) -> Result<(Vec<String>, impl Iterator<Item = csv::Result<csv::StringRecord>>)> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(open(path)?);
    let header = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    Ok((header, reader.into_records()))
}

/// Position rows: `owner_id, timestamp, geometry`.
pub fn read_positions(
    path: impl AsRef<Path>,
    delimiter: u8,
) -> Result<impl Iterator<Item = csv::Result<RawPosition>>> {
    read_rows(path, delimiter)
}

/// Edge-visit rows: `owner_id, begin_at, end_at, origin_id, destination_id`
/// plus the optional `tags`, `the_geom` and `never_visited`.
pub fn read_edge_visits(
    path: impl AsRef<Path>,
    delimiter: u8,
) -> Result<impl Iterator<Item = csv::Result<RawEdgeVisit>>> {
    read_rows(path, delimiter)
}
