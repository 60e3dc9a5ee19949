//! Dynamically typed property values and their canonical ordering.
//!
//! `compare_values` defines the total order every index key must agree
//! with. Values of different groups order by `ValueGroup`; within a group
//! each category has its own comparator. Integers and floats share the
//! number group and compare numerically, so `1` and `1.0` are equal.

use crate::error::{IndexError, Result};
use crate::types::ValueGroup;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const SECONDS_PER_DAY: i64 = 86_400;
/// Average month length (365.2425 days / 12) used to order durations.
pub const AVG_SECONDS_PER_MONTH: i64 = 2_629_746;

// ============================================================================
// Spatial
// ============================================================================

/// Coordinate reference system of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Crs {
    Wgs84,
    Wgs84_3D,
    Cartesian,
    Cartesian3D,
}

impl Crs {
    /// Numeric code persisted in keys.
    pub fn code(&self) -> u16 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::Wgs84_3D => 4979,
            Crs::Cartesian => 7203,
            Crs::Cartesian3D => 9157,
        }
    }

    /// Resolves a persisted code.
    pub fn from_code(code: u16) -> Option<Crs> {
        match code {
            4326 => Some(Crs::Wgs84),
            4979 => Some(Crs::Wgs84_3D),
            7203 => Some(Crs::Cartesian),
            9157 => Some(Crs::Cartesian3D),
            _ => None,
        }
    }

    /// Number of coordinates of a point in this system.
    pub fn dimension(&self) -> usize {
        match self {
            Crs::Wgs84 | Crs::Cartesian => 2,
            Crs::Wgs84_3D | Crs::Cartesian3D => 3,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Wgs84 | Crs::Wgs84_3D)
    }
}

/// A point in a coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    crs: Crs,
    coords: [f64; 3],
}

impl Point {
    /// Creates a point, checking the coordinate count against the CRS.
    pub fn new(crs: Crs, coordinates: &[f64]) -> Result<Self> {
        if coordinates.len() != crs.dimension() {
            return Err(IndexError::InvalidArgument(format!(
                "{:?} needs {} coordinates, got {}",
                crs,
                crs.dimension(),
                coordinates.len()
            )));
        }
        let mut coords = [0.0; 3];
        coords[..coordinates.len()].copy_from_slice(coordinates);
        Ok(Self { crs, coords })
    }

    /// Creates a 2D cartesian point.
    pub fn cartesian(x: f64, y: f64) -> Self {
        Self {
            crs: Crs::Cartesian,
            coords: [x, y, 0.0],
        }
    }

    /// Creates a 2D geographic point from longitude and latitude.
    pub fn wgs84(longitude: f64, latitude: f64) -> Self {
        Self {
            crs: Crs::Wgs84,
            coords: [longitude, latitude, 0.0],
        }
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn coordinates(&self) -> &[f64] {
        &self.coords[..self.crs.dimension()]
    }
}

// ============================================================================
// Temporal
// ============================================================================

/// Calendar date as days since 1970-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    pub epoch_day: i64,
}

/// Wall-clock time without zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime {
    pub nanos_of_day: i64,
}

/// Time of day with a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZonedTime {
    /// Nanoseconds of day normalized to UTC.
    pub nanos_of_day_utc: i64,
    pub offset_seconds: i32,
}

/// Date and time without zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDateTime {
    pub epoch_second: i64,
    pub nanos: i32,
}

/// Instant with a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZonedDateTime {
    pub epoch_second_utc: i64,
    pub nanos: i32,
    pub offset_seconds: i32,
}

/// Calendar-aware duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Duration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanos: i32,
}

impl ZonedTime {
    fn compare(&self, other: &Self) -> Ordering {
        self.nanos_of_day_utc
            .cmp(&other.nanos_of_day_utc)
            .then(self.offset_seconds.cmp(&other.offset_seconds))
    }
}

impl ZonedDateTime {
    fn compare(&self, other: &Self) -> Ordering {
        self.epoch_second_utc
            .cmp(&other.epoch_second_utc)
            .then(self.nanos.cmp(&other.nanos))
            .then(self.offset_seconds.cmp(&other.offset_seconds))
    }
}

impl Duration {
    /// Total length in seconds, counting months at their average length.
    pub fn average_seconds(&self) -> i128 {
        self.months as i128 * AVG_SECONDS_PER_MONTH as i128
            + self.days as i128 * SECONDS_PER_DAY as i128
            + self.seconds as i128
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.average_seconds()
            .cmp(&other.average_seconds())
            .then(self.nanos.cmp(&other.nanos))
            .then(self.months.cmp(&other.months))
            .then(self.days.cmp(&other.days))
    }
}

// ============================================================================
// Value
// ============================================================================

/// A homogeneous array of scalar values.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    element: ValueGroup,
    items: Vec<Value>,
}

impl ArrayValue {
    /// Creates an array whose items all belong to `element`.
    pub fn new(element: ValueGroup, items: Vec<Value>) -> Result<Self> {
        if element.is_array() {
            return Err(IndexError::InvalidArgument(
                "nested arrays are not indexable".to_string(),
            ));
        }
        for item in &items {
            if item.group() != element {
                return Err(IndexError::TypeMismatch {
                    expected: element.to_string(),
                    actual: item.group().to_string(),
                });
            }
        }
        Ok(Self { element, items })
    }

    /// Creates an array inferring the element group from the first item.
    pub fn from_values(items: Vec<Value>) -> Result<Self> {
        let element = items
            .first()
            .map(Value::group)
            .ok_or_else(|| {
                IndexError::InvalidArgument("empty array needs an element group".to_string())
            })?;
        Self::new(element, items)
    }

    pub fn element_group(&self) -> ValueGroup {
        self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An indexable property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Date(Date),
    LocalTime(LocalTime),
    ZonedTime(ZonedTime),
    LocalDateTime(LocalDateTime),
    ZonedDateTime(ZonedDateTime),
    Duration(Duration),
    Point(Point),
    Array(ArrayValue),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Builds a homogeneous array value, inferring its element group.
    pub fn array(items: Vec<Value>) -> Result<Self> {
        Ok(Value::Array(ArrayValue::from_values(items)?))
    }

    /// Returns the value group of this value.
    pub fn group(&self) -> ValueGroup {
        match self {
            Value::Int(_) | Value::Float(_) => ValueGroup::Number,
            Value::Bool(_) => ValueGroup::Boolean,
            Value::Text(_) => ValueGroup::Text,
            Value::Date(_) => ValueGroup::Date,
            Value::LocalTime(_) => ValueGroup::LocalTime,
            Value::ZonedTime(_) => ValueGroup::ZonedTime,
            Value::LocalDateTime(_) => ValueGroup::LocalDateTime,
            Value::ZonedDateTime(_) => ValueGroup::ZonedDateTime,
            Value::Duration(_) => ValueGroup::Duration,
            Value::Point(_) => ValueGroup::Geometry,
            Value::Array(a) => a
                .element_group()
                .array_of()
                .unwrap_or(ValueGroup::NumberArray),
        }
    }

    /// Returns the text content if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true if both values are equal under the index ordering.
    pub fn index_eq(&self, other: &Value) -> bool {
        compare_values(self, other) == Ordering::Equal
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Point> for Value {
    fn from(v: Point) -> Self {
        Value::Point(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Date(d) => write!(f, "date({})", d.epoch_day),
            Value::LocalTime(t) => write!(f, "localtime({})", t.nanos_of_day),
            Value::ZonedTime(t) => {
                write!(f, "time({}, {:+})", t.nanos_of_day_utc, t.offset_seconds)
            }
            Value::LocalDateTime(t) => {
                write!(f, "localdatetime({}.{:09})", t.epoch_second, t.nanos)
            }
            Value::ZonedDateTime(t) => write!(
                f,
                "datetime({}.{:09}, {:+})",
                t.epoch_second_utc, t.nanos, t.offset_seconds
            ),
            Value::Duration(d) => write!(
                f,
                "duration(P{}M{}DT{}.{:09}S)",
                d.months, d.days, d.seconds, d.nanos
            ),
            Value::Point(p) => {
                write!(f, "point({}", p.crs().code())?;
                for c in p.coordinates() {
                    write!(f, ", {:?}", c)?;
                }
                write!(f, ")")
            }
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, item) in a.items().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// Total order over values: group first, then the group's own comparator.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let by_group = a.group().cmp(&b.group());
    if by_group != Ordering::Equal {
        return by_group;
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(x), Value::Float(y)) => compare_int_float(*x, *y),
        (Value::Float(x), Value::Int(y)) => compare_int_float(*y, *x).reverse(),
        (Value::Float(x), Value::Float(y)) => compare_floats(*x, *y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::LocalTime(x), Value::LocalTime(y)) => x.cmp(y),
        (Value::ZonedTime(x), Value::ZonedTime(y)) => x.compare(y),
        (Value::LocalDateTime(x), Value::LocalDateTime(y)) => x.cmp(y),
        (Value::ZonedDateTime(x), Value::ZonedDateTime(y)) => x.compare(y),
        (Value::Duration(x), Value::Duration(y)) => x.compare(y),
        (Value::Point(x), Value::Point(y)) => compare_points(x, y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.items().iter().zip(y.items()) {
                let c = compare_values(l, r);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        // Same group guarantees matching variants above.
        _ => Ordering::Equal,
    }
}

/// Orders floats with NaN above every other number.
pub fn compare_floats(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison of an integer against a float.
pub fn compare_int_float(i: i64, f: f64) -> Ordering {
    // 2^63, the first float above i64::MAX.
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() || f >= TWO_POW_63 {
        return Ordering::Less;
    }
    if f < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => compare_floats(0.0, f - whole),
        other => other,
    }
}

/// Orders points by CRS code and then coordinates.
pub fn compare_points(a: &Point, b: &Point) -> Ordering {
    let by_crs = a.crs().code().cmp(&b.crs().code());
    if by_crs != Ordering::Equal {
        return by_crs;
    }
    for (x, y) in a.coordinates().iter().zip(b.coordinates()) {
        let c = compare_floats(*x, *y);
        if c != Ordering::Equal {
            return c;
        }
    }
    Ordering::Equal
}
