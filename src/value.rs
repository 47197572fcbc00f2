//! Scalar kinds and the value representation shared by every backend
//!
//! Every persisted property has one logical [`ScalarKind`]. Rust types opt in
//! through the [`Field`] trait, which fixes the kind and converts to and from
//! [`Value`], the engine-neutral cell representation.
//!
//! Temporal kinds are stored as integers:
//! - `Date`: days since 1970-01-01
//! - `Time`: nanoseconds since midnight
//! - `DateTime` / `Timestamp`: milliseconds since the Unix epoch (UTC);
//!   sub-millisecond digits are truncated on write

use crate::{Error, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Days from 0001-01-01 (day 1) to 1970-01-01
const EPOCH_DAYS_FROM_CE: i64 = 719_163;
const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Logical scalar types a property can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Int,
    Long,
    Short,
    Byte,
    Float,
    Double,
    Boolean,
    String,
    List,
    Date,
    Time,
    DateTime,
    Timestamp,
}

impl ScalarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::Int => "int",
            ScalarKind::Long => "long",
            ScalarKind::Short => "short",
            ScalarKind::Byte => "byte",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Boolean => "boolean",
            ScalarKind::String => "string",
            ScalarKind::List => "list",
            ScalarKind::Date => "date",
            ScalarKind::Time => "time",
            ScalarKind::DateTime => "datetime",
            ScalarKind::Timestamp => "timestamp",
        }
    }

    pub fn all() -> &'static [ScalarKind] {
        &[
            ScalarKind::Int,
            ScalarKind::Long,
            ScalarKind::Short,
            ScalarKind::Byte,
            ScalarKind::Float,
            ScalarKind::Double,
            ScalarKind::Boolean,
            ScalarKind::String,
            ScalarKind::List,
            ScalarKind::Date,
            ScalarKind::Time,
            ScalarKind::DateTime,
            ScalarKind::Timestamp,
        ]
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarKind::Int
                | ScalarKind::Long
                | ScalarKind::Short
                | ScalarKind::Byte
                | ScalarKind::Float
                | ScalarKind::Double
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ScalarKind::Date | ScalarKind::Time | ScalarKind::DateTime | ScalarKind::Timestamp
        )
    }
}

impl FromStr for ScalarKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "int" | "integer" | "i32" => Ok(ScalarKind::Int),
            "long" | "bigint" | "i64" => Ok(ScalarKind::Long),
            "short" | "i16" => Ok(ScalarKind::Short),
            "byte" | "i8" => Ok(ScalarKind::Byte),
            "float" | "f32" => Ok(ScalarKind::Float),
            "double" | "f64" => Ok(ScalarKind::Double),
            "boolean" | "bool" => Ok(ScalarKind::Boolean),
            "string" | "text" | "str" => Ok(ScalarKind::String),
            "list" | "array" => Ok(ScalarKind::List),
            "date" => Ok(ScalarKind::Date),
            "time" => Ok(ScalarKind::Time),
            "datetime" | "local_datetime" => Ok(ScalarKind::DateTime),
            "timestamp" | "instant" => Ok(ScalarKind::Timestamp),
            _ => Err(Error::MalformedConfiguration(format!("Unknown scalar kind: {}", s))),
        }
    }
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine-neutral cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::List(_) => "list",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering between values of compatible kinds; numbers compare across int and float
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(std::cmp::Ordering::Equal),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Convert to the JSON form used by document stores
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().cloned().map(serde_json::Value::String).collect(),
            ),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            serde_json::Value::Object(_) => Value::Text(json.to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::List(items) => write!(f, "{:?}", items),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

fn mismatch(expected: ScalarKind, found: &Value) -> Error {
    Error::Decode { expected, found: format!("{} {}", found.type_name(), found) }
}

/// A Rust type that can be stored as a property
pub trait Field: Clone + Send + Sync + 'static {
    const KIND: ScalarKind;

    /// Value a property is reset to by a partial delete
    fn zero() -> Self;

    fn to_value(&self) -> Value;

    fn from_value(value: &Value) -> Result<Self>;
}

/// Marker for kinds that support ordering comparisons against numbers
pub trait Numeric: Field {}

/// Marker for date and time kinds.
///
/// Date-times and timestamps keep millisecond precision: a value read back
/// after a save equals the original truncated to the millisecond.
pub trait Temporal: Field {}

macro_rules! integer_field {
    ($ty:ty, $kind:expr) => {
        impl Field for $ty {
            const KIND: ScalarKind = $kind;

            fn zero() -> Self {
                0
            }

            fn to_value(&self) -> Value {
                Value::Int(i64::from(*self))
            }

            fn from_value(value: &Value) -> Result<Self> {
                value
                    .as_i64()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .ok_or_else(|| mismatch(Self::KIND, value))
            }
        }

        impl Numeric for $ty {}
    };
}

integer_field!(i32, ScalarKind::Int);
integer_field!(i64, ScalarKind::Long);
integer_field!(i16, ScalarKind::Short);
integer_field!(i8, ScalarKind::Byte);

impl Field for f64 {
    const KIND: ScalarKind = ScalarKind::Double;

    fn zero() -> Self {
        0.0
    }

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl Numeric for f64 {}

impl Field for f32 {
    const KIND: ScalarKind = ScalarKind::Float;

    fn zero() -> Self {
        0.0
    }

    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }

    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().map(|v| v as f32).ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl Numeric for f32 {}

impl Field for bool {
    const KIND: ScalarKind = ScalarKind::Boolean;

    fn zero() -> Self {
        false
    }

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl Field for String {
    const KIND: ScalarKind = ScalarKind::String;

    fn zero() -> Self {
        String::new()
    }

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl Field for Vec<String> {
    const KIND: ScalarKind = ScalarKind::List;

    fn zero() -> Self {
        Vec::new()
    }

    fn to_value(&self) -> Value {
        Value::List(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::List(items) => Ok(items.clone()),
            // SQL engines hand lists back as JSON text
            Value::Text(json) => serde_json::from_str(json).map_err(Error::from),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl<T: Field> Field for Option<T> {
    const KIND: ScalarKind = T::KIND;

    fn zero() -> Self {
        None
    }

    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: Numeric> Numeric for Option<T> {}

impl Field for NaiveDate {
    const KIND: ScalarKind = ScalarKind::Date;

    fn zero() -> Self {
        NaiveDate::default()
    }

    fn to_value(&self) -> Value {
        Value::Int(i64::from(self.num_days_from_ce()) - EPOCH_DAYS_FROM_CE)
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_i64()
            .and_then(|days| i32::try_from(days + EPOCH_DAYS_FROM_CE).ok())
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl Temporal for NaiveDate {}

impl Field for NaiveTime {
    const KIND: ScalarKind = ScalarKind::Time;

    fn zero() -> Self {
        NaiveTime::default()
    }

    fn to_value(&self) -> Value {
        Value::Int(
            i64::from(self.num_seconds_from_midnight()) * NANOS_PER_SECOND
                + i64::from(self.nanosecond()),
        )
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_i64()
            .filter(|nanos| *nanos >= 0)
            .and_then(|nanos| {
                let secs = u32::try_from(nanos / NANOS_PER_SECOND).ok()?;
                let frac = u32::try_from(nanos % NANOS_PER_SECOND).ok()?;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, frac)
            })
            .ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl Temporal for NaiveTime {}

impl Field for NaiveDateTime {
    const KIND: ScalarKind = ScalarKind::DateTime;

    fn zero() -> Self {
        NaiveDateTime::default()
    }

    fn to_value(&self) -> Value {
        Value::Int(self.and_utc().timestamp_millis())
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl Temporal for NaiveDateTime {}

impl Field for DateTime<Utc> {
    const KIND: ScalarKind = ScalarKind::Timestamp;

    fn zero() -> Self {
        DateTime::<Utc>::default()
    }

    fn to_value(&self) -> Value {
        Value::Int(self.timestamp_millis())
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl Temporal for DateTime<Utc> {}
