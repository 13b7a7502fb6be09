//! Geographic primitives: positions, Haversine distance and the small subset
//! of WKT (`POINT`, `LINESTRING`, `POLYGON`) the pipeline reads and writes.

use serde::{Deserialize, Serialize};

/// Equatorial Earth radius in kilometres used by the Haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6378.137;

/// How the two numbers of a WKT coordinate pair are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateOrder {
    /// `lat lon`
    LatLon,
    /// `lon lat`, the WKT convention.
    #[default]
    LonLat,
}

/// A WGS84 coordinate in degrees.
///
/// Coordinates that failed to parse are represented with NaN components and
/// report `false` from [`GeoPosition::is_valid`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// The sentinel for a coordinate pair that could not be parsed.
    pub fn invalid() -> Self {
        Self::new(f64::NAN, f64::NAN)
    }

    /// Check if the position has usable coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to `other` in kilometres.
    pub fn distance_km(&self, other: &GeoPosition) -> f64 {
        let to_rad = |deg: f64| deg.to_radians();
        let dlat = to_rad(other.latitude - self.latitude);
        let dlon = to_rad(other.longitude - self.longitude);
        let a = (dlat / 2.0).sin().powi(2)
            + to_rad(self.latitude).cos()
                * to_rad(other.latitude).cos()
                * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// Great-circle distance to `other` in whole metres (truncated).
    pub fn distance_meters(&self, other: &GeoPosition) -> u64 {
        (self.distance_km(other) * 1000.0) as u64
    }

    /// Midpoint of the straight segment between two positions in degree space.
    pub fn midpoint(&self, other: &GeoPosition) -> GeoPosition {
        GeoPosition::new(
            (self.latitude + other.latitude) / 2.0,
            (self.longitude + other.longitude) / 2.0,
        )
    }

    pub fn to_wkt(&self) -> String {
        format!("POINT({} {})", self.longitude, self.latitude)
    }
}

/// A parsed WKT geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(GeoPosition),
    LineString(Vec<GeoPosition>),
}

impl Geometry {
    /// Parses a WKT `POINT` or `LINESTRING`.
    ///
    /// Returns `None` when the geometry kind is not recognised. Malformed
    /// coordinate pairs do not fail the parse; they become invalid positions.
    pub fn parse(wkt: &str, order: CoordinateOrder) -> Option<Geometry> {
        let trimmed = wkt.trim();
        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("POINT") {
            let body = wkt_body(trimmed)?;
            Some(Geometry::Point(parse_pair(body, order)))
        } else if upper.starts_with("LINESTRING") {
            let body = wkt_body(trimmed)?;
            let vertices: Vec<GeoPosition> =
                body.split(',').map(|pair| parse_pair(pair, order)).collect();
            if vertices.is_empty() {
                return None;
            }
            Some(Geometry::LineString(vertices))
        } else {
            None
        }
    }

    /// Smallest box holding every vertex. `None` when a vertex is invalid.
    pub fn envelope(&self) -> Option<BoundingBox> {
        match self {
            Geometry::Point(p) => BoundingBox::around(std::slice::from_ref(p)),
            Geometry::LineString(vertices) => BoundingBox::around(vertices),
        }
    }

    /// A single position standing for the geometry: the point itself, or the
    /// midpoint between the first and last vertex of a line string.
    pub fn representative_position(&self) -> GeoPosition {
        match self {
            Geometry::Point(p) => *p,
            Geometry::LineString(vertices) => match (vertices.first(), vertices.last()) {
                (Some(first), Some(last)) => first.midpoint(last),
                _ => GeoPosition::invalid(),
            },
        }
    }
}

fn wkt_body(wkt: &str) -> Option<&str> {
    let open = wkt.find('(')?;
    let close = wkt.rfind(')')?;
    if close <= open {
        return None;
    }
    Some(&wkt[open + 1..close])
}

fn parse_pair(pair: &str, order: CoordinateOrder) -> GeoPosition {
    let parts: Vec<&str> = pair.split_whitespace().collect();
    if parts.len() != 2 {
        return GeoPosition::invalid();
    }

    let first = parts[0].parse::<f64>().unwrap_or(f64::NAN);
    let second = parts[1].parse::<f64>().unwrap_or(f64::NAN);

    match order {
        CoordinateOrder::LatLon => GeoPosition::new(first, second),
        CoordinateOrder::LonLat => GeoPosition::new(second, first),
    }
}

/// Renders positions as `LINESTRING(lon lat, lon lat, ...)`.
pub fn linestring_wkt(positions: &[GeoPosition]) -> String {
    let coords: Vec<String> = positions
        .iter()
        .map(|p| format!("{} {}", p.longitude, p.latitude))
        .collect();
    format!("LINESTRING({})", coords.join(", "))
}

/// An axis-aligned box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Envelope of `positions`, `None` if there are none or one is invalid.
    pub fn around(positions: &[GeoPosition]) -> Option<Self> {
        let (first, rest) = positions.split_first()?;
        if !first.is_valid() {
            return None;
        }
        let mut bbox = Self::new(first.latitude, first.latitude, first.longitude, first.longitude);
        for p in rest {
            if !p.is_valid() {
                return None;
            }
            bbox.min_lat = bbox.min_lat.min(p.latitude);
            bbox.max_lat = bbox.max_lat.max(p.latitude);
            bbox.min_lon = bbox.min_lon.min(p.longitude);
            bbox.max_lon = bbox.max_lon.max(p.longitude);
        }
        Some(bbox)
    }

    /// Edges included.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.min_lat
            && other.max_lat <= self.max_lat
            && self.min_lon <= other.min_lon
            && other.max_lon <= self.max_lon
    }

    pub fn to_wkt(&self) -> String {
        rectangle_wkt(self.min_lat, self.max_lat, self.min_lon, self.max_lon)
    }
}

/// Renders an axis-aligned box as a closed WKT polygon.
pub fn rectangle_wkt(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> String {
    format!(
        "POLYGON(({min_lon} {min_lat}, {min_lon} {max_lat}, {max_lon} {max_lat}, {max_lon} {min_lat}, {min_lon} {min_lat}))"
    )
}
