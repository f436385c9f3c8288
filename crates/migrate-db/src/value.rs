//! Row values passed from the source reader to the COPY writer.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::schema::DataType;

/// A single decoded source value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Short type label for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::I16(_) => "smallint",
            SqlValue::I32(_) => "int",
            SqlValue::I64(_) => "bigint",
            SqlValue::F32(_) => "real",
            SqlValue::F64(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::DateTime(_) => "datetime",
            SqlValue::DateTimeOffset(_) => "datetimeoffset",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
        }
    }

    /// Integer value of an identity column. NULL yields `None`.
    pub fn as_identity(&self) -> Result<Option<i64>> {
        let id = match self {
            SqlValue::Null => return Ok(None),
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            SqlValue::F64(f) if f.fract() == 0.0 => f.to_i64(),
            SqlValue::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        id.map(Some).ok_or_else(|| {
            MigrateError::Conversion(format!(
                "identity value {} ({}) is not an integer",
                self,
                self.type_name()
            ))
        })
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(true) => f.write_str("True"),
            SqlValue::Bool(false) => f.write_str("False"),
            SqlValue::I16(v) => write!(f, "{}", v),
            SqlValue::I32(v) => write!(f, "{}", v),
            SqlValue::I64(v) => write!(f, "{}", v),
            SqlValue::F32(v) => write!(f, "{}", v),
            SqlValue::F64(v) => write!(f, "{}", v),
            SqlValue::Text(s) => f.write_str(s),
            SqlValue::Bytes(b) => write!(f, "\\x{}", hex::encode(b)),
            SqlValue::Uuid(u) => write!(f, "{}", u),
            SqlValue::Decimal(d) => write!(f, "{}", d),
            SqlValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            SqlValue::DateTimeOffset(dt) => write!(f, "{}", dt.to_rfc3339()),
            SqlValue::Date(d) => write!(f, "{}", d),
            SqlValue::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
        }
    }
}

/// Turn textual booleans into 1/0 for columns that are not boolean.
///
/// Applies when the textual form is exactly `True` or `False`; every other
/// column/value pair passes through unchanged.
pub fn coerce_boolean(value: SqlValue, target: DataType) -> SqlValue {
    if target == DataType::Boolean {
        return value;
    }
    match value {
        SqlValue::Bool(b) => SqlValue::I32(i32::from(b)),
        SqlValue::Text(ref s) if s == "True" => SqlValue::I32(1),
        SqlValue::Text(ref s) if s == "False" => SqlValue::I32(0),
        other => other,
    }
}
