//! Parsing of raw position rows into [`TimestampedPosition`]s.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::aggregator::{DirectedEdge, VisitInterval};
use crate::geo::{CoordinateOrder, GeoPosition, Geometry};

/// One vehicle position with its owner and time of record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampedPosition {
    pub owner: i64,
    pub timestamp: NaiveDateTime,
    pub location: GeoPosition,
}

impl TimestampedPosition {
    pub fn new(owner: i64, timestamp: NaiveDateTime, location: GeoPosition) -> Self {
        Self {
            owner,
            timestamp,
            location,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.location.is_valid()
    }
}

/// A position row as it arrives from the source table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPosition {
    #[serde(alias = "id")]
    pub owner_id: i64,
    pub timestamp: String,
    #[serde(alias = "location", alias = "the_geom")]
    pub geometry: String,
}

/// Why a raw row did not become a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIssue {
    BadTimestamp,
    BadGeometry,
    InvalidCoordinates,
    MissingField(&'static str),
}

impl RowIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowIssue::BadTimestamp => "bad_timestamp",
            RowIssue::BadGeometry => "bad_geometry",
            RowIssue::InvalidCoordinates => "invalid_coordinates",
            RowIssue::MissingField(_) => "missing_field",
        }
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parses an ISO-8601-like local date-time.
///
/// A trailing `Z` or `±hh:mm` offset is accepted and dropped: the wall-clock
/// time as written is kept.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();

    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_local());
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.naive_local());
        }
    }

    let without_zulu = raw.strip_suffix(['Z', 'z'])?;
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(without_zulu, format).ok())
}

/// Converts a raw row into a position.
///
/// Coordinates that do not parse produce an invalid position, which is
/// reported as [`RowIssue::InvalidCoordinates`] so the caller can skip it.
pub fn parse_position(
    raw: &RawPosition,
    order: CoordinateOrder,
) -> Result<TimestampedPosition, RowIssue> {
    let timestamp = parse_timestamp(&raw.timestamp).ok_or(RowIssue::BadTimestamp)?;
    let geometry = Geometry::parse(&raw.geometry, order).ok_or(RowIssue::BadGeometry)?;
    let position = TimestampedPosition::new(
        raw.owner_id,
        timestamp,
        geometry.representative_position(),
    );

    if !position.is_valid() {
        return Err(RowIssue::InvalidCoordinates);
    }
    Ok(position)
}

/// A matched edge-visit row. Rows flagged `never_visited` only name an edge
/// of the network and may leave the visit columns empty.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEdgeVisit {
    pub owner_id: Option<i64>,
    pub begin_at: Option<String>,
    pub end_at: Option<String>,
    pub origin_id: i64,
    pub destination_id: i64,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default, alias = "geometry")]
    pub the_geom: Option<String>,
    #[serde(default)]
    pub never_visited: Option<bool>,
}

/// A parsed edge-visit row.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeVisitRecord {
    pub edge: DirectedEdge,
    /// `None` for edges that were never visited.
    pub visit: Option<VisitInterval>,
    pub path: Vec<GeoPosition>,
    pub tags: Option<String>,
    pub geometry: Option<String>,
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub fn parse_edge_visit(
    raw: &RawEdgeVisit,
    order: CoordinateOrder,
) -> Result<EdgeVisitRecord, RowIssue> {
    let edge = DirectedEdge::new(raw.origin_id, raw.destination_id);

    let path = match non_empty(&raw.the_geom) {
        Some(wkt) => match Geometry::parse(wkt, order).ok_or(RowIssue::BadGeometry)? {
            Geometry::Point(p) => vec![p],
            Geometry::LineString(vertices) => vertices,
        },
        None => Vec::new(),
    };
    if path.iter().any(|p| !p.is_valid()) {
        return Err(RowIssue::InvalidCoordinates);
    }

    let visit = if raw.never_visited.unwrap_or(false) {
        None
    } else {
        let owner = raw.owner_id.ok_or(RowIssue::MissingField("owner_id"))?;
        let begin = non_empty(&raw.begin_at).ok_or(RowIssue::MissingField("begin_at"))?;
        let end = non_empty(&raw.end_at).ok_or(RowIssue::MissingField("end_at"))?;
        let begin = parse_timestamp(begin).ok_or(RowIssue::BadTimestamp)?;
        let end = parse_timestamp(end).ok_or(RowIssue::BadTimestamp)?;
        Some(VisitInterval::new(begin, end, owner))
    };

    Ok(EdgeVisitRecord {
        edge,
        visit,
        path,
        tags: non_empty(&raw.tags).map(str::to_string),
        geometry: non_empty(&raw.the_geom).map(str::to_string),
    })
}
