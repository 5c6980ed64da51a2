use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{squared_distance, Point};

/// Identifier of a grid bucket (mixed-radix over the per-dimension cells).
pub type BucketId = u32;

/// Identifier of a silo within one federation.
pub type SiloId = u32;

/// Reserved record id marking padding records.
pub const DUMMY_ID: i32 = -1;

/// Size of a record in its packed little-endian form (`i32`, `f32`, `f32`).
pub const RECORD_WIRE_BYTES: usize = 12;

/// A point record owned by a silo.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: i32,
    pub x: f32,
    pub y: f32,
}

impl Record {
    pub fn new(id: i32, x: f32, y: f32) -> Self {
        Self { id, x, y }
    }

    pub fn dummy(x: f32, y: f32) -> Self {
        Self { id: DUMMY_ID, x, y }
    }

    pub fn is_dummy(&self) -> bool {
        self.id == DUMMY_ID
    }

    pub fn point(&self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y))
    }

    /// Coordinate along dimension `dim` (0 = x, 1 = y).
    pub fn coord(&self, dim: usize) -> f64 {
        match dim {
            0 => f64::from(self.x),
            _ => f64::from(self.y),
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_WIRE_BYTES] {
        let mut out = [0u8; RECORD_WIRE_BYTES];
        out[..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.x.to_le_bytes());
        out[8..].copy_from_slice(&self.y.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_WIRE_BYTES {
            return None;
        }
        let word = |range: std::ops::Range<usize>| -> [u8; 4] {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[range]);
            buf
        };
        Some(Self {
            id: i32::from_le_bytes(word(0..4)),
            x: f32::from_le_bytes(word(4..8)),
            y: f32::from_le_bytes(word(8..12)),
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Circle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl Circle {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self { x, y, radius }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn contains(&self, point: Point) -> bool {
        squared_distance(self.center(), point) <= self.radius * self.radius
    }

    pub fn contains_record(&self, record: &Record) -> bool {
        self.contains(record.point())
    }

    pub fn bounding_box(&self) -> Rectangle {
        Rectangle::new(self.x, self.y, self.radius, self.radius)
    }

    /// Exact circle/rectangle overlap: the point of `rect` closest to the
    /// center must lie within the radius. An inverted `rect` never overlaps.
    pub fn intersects_rectangle(&self, rect: &Rectangle) -> bool {
        if !(rect.min_x() <= rect.max_x() && rect.min_y() <= rect.max_y()) {
            return false;
        }
        let nearest = Point::new(
            self.x.max(rect.min_x()).min(rect.max_x()),
            self.y.max(rect.min_y()).min(rect.max_y()),
        );
        self.contains(nearest)
    }
}

/// Axis-aligned box given by its center and half extents.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rectangle {
    pub x: f64,
    pub y: f64,
    pub half_width: f64,
    pub half_height: f64,
}

impl Rectangle {
    pub fn new(x: f64, y: f64, half_width: f64, half_height: f64) -> Self {
        Self {
            x,
            y,
            half_width,
            half_height,
        }
    }

    pub fn from_bounds(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            x: (min_x + max_x) / 2.0,
            y: (min_y + max_y) / 2.0,
            half_width: (max_x - min_x) / 2.0,
            half_height: (max_y - min_y) / 2.0,
        }
    }

    pub fn min_x(&self) -> f64 {
        self.x - self.half_width
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.half_width
    }

    pub fn min_y(&self) -> f64 {
        self.y - self.half_height
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.half_height
    }

    /// Lower bound along `dim`.
    pub fn lo(&self, dim: usize) -> f64 {
        match dim {
            0 => self.min_x(),
            _ => self.min_y(),
        }
    }

    /// Upper bound along `dim`.
    pub fn hi(&self, dim: usize) -> f64 {
        match dim {
            0 => self.max_x(),
            _ => self.max_y(),
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        self.min_x() <= point.x
            && point.x <= self.max_x()
            && self.min_y() <= point.y
            && point.y <= self.max_y()
    }

    pub fn contains_record(&self, record: &Record) -> bool {
        self.contains(record.point())
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.min_x() <= other.max_x()
            && other.min_x() <= self.max_x()
            && self.min_y() <= other.max_y()
            && other.min_y() <= self.max_y()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QueryKind {
    RangeQuery,
    RangeCount,
    DistanceJoin,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::RangeQuery => "RangeQuery",
            QueryKind::RangeCount => "RangeCount",
            QueryKind::DistanceJoin => "DistanceJoin",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown query kind {0:?}")]
pub struct UnknownQueryKind(pub String);

impl FromStr for QueryKind {
    type Err = UnknownQueryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RangeQuery" => Ok(QueryKind::RangeQuery),
            "RangeCount" => Ok(QueryKind::RangeCount),
            "DistanceJoin" => Ok(QueryKind::DistanceJoin),
            other => Err(UnknownQueryKind(other.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum QueryShape {
    Circle(Circle),
    Rectangle(Rectangle),
}

impl QueryShape {
    pub fn contains_record(&self, record: &Record) -> bool {
        match self {
            QueryShape::Circle(circle) => circle.contains_record(record),
            QueryShape::Rectangle(rect) => rect.contains_record(record),
        }
    }

    pub fn center(&self) -> Point {
        match self {
            QueryShape::Circle(circle) => circle.center(),
            QueryShape::Rectangle(rect) => Point::new(rect.x, rect.y),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpatialQuery {
    pub kind: QueryKind,
    pub shape: QueryShape,
}

impl SpatialQuery {
    pub fn range_circle(x: f64, y: f64, radius: f64) -> Self {
        Self {
            kind: QueryKind::RangeQuery,
            shape: QueryShape::Circle(Circle::new(x, y, radius)),
        }
    }

    pub fn count_circle(x: f64, y: f64, radius: f64) -> Self {
        Self {
            kind: QueryKind::RangeCount,
            shape: QueryShape::Circle(Circle::new(x, y, radius)),
        }
    }

    pub fn range_rectangle(x: f64, y: f64, half_width: f64, half_height: f64) -> Self {
        Self {
            kind: QueryKind::RangeQuery,
            shape: QueryShape::Rectangle(Rectangle::new(x, y, half_width, half_height)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_bytes_are_little_endian_triplets() {
        let record = Record::new(7, 1.5, -2.25);
        let bytes = record.to_bytes();
        assert_eq!(&bytes[..4], &7i32.to_le_bytes());
        assert_eq!(Record::from_bytes(&bytes), Some(record));
        assert_eq!(Record::from_bytes(&bytes[..11]), None);
    }

    #[test]
    fn circle_rectangle_overlap_catches_edge_crossings() {
        // neither the circle center nor any corner is involved here
        let rect = Rectangle::from_bounds(0.0, 0.0, 10.0, 10.0);
        let circle = Circle::new(5.0, -1.0, 1.5);
        assert!(circle.intersects_rectangle(&rect));
        assert!(!Circle::new(-2.0, -2.0, 1.0).intersects_rectangle(&rect));
    }

    #[test]
    fn inverted_rectangle_never_overlaps() {
        let inverted = Rectangle::from_bounds(10.0, 0.0, 2.5, 1.0);
        assert!(!Circle::new(5.0, 0.5, 100.0).intersects_rectangle(&inverted));
    }

    #[test]
    fn query_kind_parses_known_names() {
        assert_eq!("RangeCount".parse(), Ok(QueryKind::RangeCount));
        assert!("Knn".parse::<QueryKind>().is_err());
    }
}
