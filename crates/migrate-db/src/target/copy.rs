//! PGCOPY binary encoding.
//!
//! Format: an 11-byte signature, i32 flags, i32 header extension length,
//! then per row an i16 field count followed by `i32 length + bytes` per
//! field (length -1 for NULL), and finally an i16 -1 trailer.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::schema::{Column, DataType};
use crate::value::SqlValue;

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between 1970-01-01 and 2000-01-01.
const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// `num_days_from_ce()` of 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

const JSONB_VERSION: u8 = 1;

const NUMERIC_POS: i16 = 0x0000;
const NUMERIC_NEG: i16 = 0x4000;

/// Buffers PGCOPY rows for one table.
pub struct BinaryCopyEncoder {
    buf: BytesMut,
    rows: u64,
}

impl Default for BinaryCopyEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryCopyEncoder {
    /// Start a stream; the header is written immediately.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        buf.put_slice(SIGNATURE);
        buf.put_i32(0); // flags
        buf.put_i32(0); // extension area length
        Self { buf, rows: 0 }
    }

    /// Append one row. The row must have exactly one value per column.
    pub fn encode_row(&mut self, columns: &[Column], row: &[SqlValue]) -> Result<()> {
        if row.len() != columns.len() {
            return Err(MigrateError::Conversion(format!(
                "row has {} values but {} columns were selected",
                row.len(),
                columns.len()
            )));
        }
        let count = i16::try_from(columns.len()).map_err(|_| {
            MigrateError::Conversion(format!("{} columns exceed the COPY limit", columns.len()))
        })?;

        // Encode into a scratch buffer so a failed field leaves no partial row.
        let mut row_buf = BytesMut::with_capacity(16 * columns.len());
        row_buf.put_i16(count);
        for (column, value) in columns.iter().zip(row) {
            encode_field(&mut row_buf, value, column.data_type).map_err(|e| match e {
                MigrateError::Conversion(msg) => {
                    MigrateError::Conversion(format!("column \"{}\": {}", column.name, msg))
                }
                other => other,
            })?;
        }
        self.buf.extend_from_slice(&row_buf);
        self.rows += 1;
        Ok(())
    }

    /// Bytes buffered since the last [`take`](Self::take).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Hand out the buffered bytes.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Append the trailer and hand out the remaining bytes.
    pub fn finish(&mut self) -> Bytes {
        self.buf.put_i16(-1);
        self.take()
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| MigrateError::Conversion(format!("value of {} bytes is too large", len)))?;
    buf.put_i32(len);
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    put_len(buf, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

fn mismatch(value: &SqlValue, data_type: DataType) -> MigrateError {
    MigrateError::Conversion(format!(
        "cannot write {} value '{}' as {:?}",
        value.type_name(),
        value,
        data_type
    ))
}

/// Encode one field, converting the value to the column's type.
pub fn encode_field(buf: &mut BytesMut, value: &SqlValue, data_type: DataType) -> Result<()> {
    if value.is_null() {
        buf.put_i32(-1);
        return Ok(());
    }

    match data_type {
        DataType::Unknown => encode_native(buf, value),
        DataType::Text => match value {
            SqlValue::Text(s) => put_bytes(buf, s.as_bytes()),
            other => put_bytes(buf, other.to_string().as_bytes()),
        },
        DataType::Json => {
            let text = json_text(value).ok_or_else(|| mismatch(value, data_type))?;
            put_bytes(buf, text.as_bytes())
        }
        DataType::Jsonb => {
            let text = json_text(value).ok_or_else(|| mismatch(value, data_type))?;
            put_len(buf, text.len() + 1)?;
            buf.put_u8(JSONB_VERSION);
            buf.put_slice(text.as_bytes());
            Ok(())
        }
        DataType::Bytea => match value {
            SqlValue::Bytes(b) => put_bytes(buf, b),
            SqlValue::Text(s) => put_bytes(buf, s.as_bytes()),
            other => Err(mismatch(other, data_type)),
        },
        DataType::Boolean => {
            let b = to_bool(value).ok_or_else(|| mismatch(value, data_type))?;
            buf.put_i32(1);
            buf.put_u8(u8::from(b));
            Ok(())
        }
        DataType::SmallInt => {
            let v = to_i64(value)
                .and_then(|v| i16::try_from(v).ok())
                .ok_or_else(|| mismatch(value, data_type))?;
            buf.put_i32(2);
            buf.put_i16(v);
            Ok(())
        }
        DataType::Integer => {
            let v = to_i64(value)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| mismatch(value, data_type))?;
            buf.put_i32(4);
            buf.put_i32(v);
            Ok(())
        }
        DataType::BigInt => {
            let v = to_i64(value).ok_or_else(|| mismatch(value, data_type))?;
            buf.put_i32(8);
            buf.put_i64(v);
            Ok(())
        }
        DataType::Real => {
            let v = to_f64(value).ok_or_else(|| mismatch(value, data_type))?;
            buf.put_i32(4);
            buf.put_f32(v as f32);
            Ok(())
        }
        DataType::Double => {
            let v = to_f64(value).ok_or_else(|| mismatch(value, data_type))?;
            buf.put_i32(8);
            buf.put_f64(v);
            Ok(())
        }
        DataType::Numeric => {
            let d = to_decimal(value).ok_or_else(|| mismatch(value, data_type))?;
            encode_numeric(buf, &d);
            Ok(())
        }
        DataType::Timestamp => {
            let dt = to_naive_datetime(value).ok_or_else(|| mismatch(value, data_type))?;
            encode_timestamp(buf, &dt);
            Ok(())
        }
        DataType::TimestampTz => {
            let dt = match value {
                SqlValue::DateTimeOffset(dto) => dto.naive_utc(),
                SqlValue::Text(s) => match DateTime::parse_from_rfc3339(s.trim()) {
                    Ok(dto) => dto.naive_utc(),
                    Err(_) => parse_naive_datetime(s).ok_or_else(|| mismatch(value, data_type))?,
                },
                other => to_naive_datetime(other).ok_or_else(|| mismatch(value, data_type))?,
            };
            encode_timestamp(buf, &dt);
            Ok(())
        }
        DataType::Date => {
            let d = match value {
                SqlValue::Date(d) => *d,
                SqlValue::DateTime(dt) => dt.date(),
                SqlValue::DateTimeOffset(dto) => dto.date_naive(),
                SqlValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|_| mismatch(value, data_type))?,
                other => return Err(mismatch(other, data_type)),
            };
            encode_date(buf, &d);
            Ok(())
        }
        DataType::Time => {
            let t = match value {
                SqlValue::Time(t) => *t,
                SqlValue::DateTime(dt) => dt.time(),
                SqlValue::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .map_err(|_| mismatch(value, data_type))?,
                other => return Err(mismatch(other, data_type)),
            };
            encode_time(buf, &t);
            Ok(())
        }
        DataType::TimeTz => {
            let (t, utc_offset) = match value {
                SqlValue::Time(t) => (*t, 0),
                SqlValue::DateTimeOffset(dto) => (dto.time(), dto.offset().local_minus_utc()),
                SqlValue::Text(s) => parse_time_tz(s).ok_or_else(|| mismatch(value, data_type))?,
                other => return Err(mismatch(other, data_type)),
            };
            buf.put_i32(12);
            buf.put_i64(time_micros(&t));
            // zone is stored as seconds west of UTC
            buf.put_i32(-utc_offset);
            Ok(())
        }
        DataType::Uuid => {
            let u = match value {
                SqlValue::Uuid(u) => *u,
                SqlValue::Text(s) => {
                    Uuid::parse_str(s.trim()).map_err(|_| mismatch(value, data_type))?
                }
                SqlValue::Bytes(b) => Uuid::from_slice(b).map_err(|_| mismatch(value, data_type))?,
                other => return Err(mismatch(other, data_type)),
            };
            buf.put_i32(16);
            buf.put_slice(u.as_bytes());
            Ok(())
        }
    }
}

/// Encode a value with the wire format of its own type.
fn encode_native(buf: &mut BytesMut, value: &SqlValue) -> Result<()> {
    match value {
        SqlValue::Null => buf.put_i32(-1),
        SqlValue::Bool(b) => {
            buf.put_i32(1);
            buf.put_u8(u8::from(*b));
        }
        SqlValue::I16(v) => {
            buf.put_i32(2);
            buf.put_i16(*v);
        }
        SqlValue::I32(v) => {
            buf.put_i32(4);
            buf.put_i32(*v);
        }
        SqlValue::I64(v) => {
            buf.put_i32(8);
            buf.put_i64(*v);
        }
        SqlValue::F32(v) => {
            buf.put_i32(4);
            buf.put_f32(*v);
        }
        SqlValue::F64(v) => {
            buf.put_i32(8);
            buf.put_f64(*v);
        }
        SqlValue::Text(s) => put_bytes(buf, s.as_bytes())?,
        SqlValue::Bytes(b) => put_bytes(buf, b)?,
        SqlValue::Uuid(u) => {
            buf.put_i32(16);
            buf.put_slice(u.as_bytes());
        }
        SqlValue::Decimal(d) => encode_numeric(buf, d),
        SqlValue::DateTime(dt) => encode_timestamp(buf, dt),
        SqlValue::DateTimeOffset(dto) => encode_timestamp(buf, &dto.naive_utc()),
        SqlValue::Date(d) => encode_date(buf, d),
        SqlValue::Time(t) => encode_time(buf, t),
    }
    Ok(())
}

fn encode_timestamp(buf: &mut BytesMut, dt: &NaiveDateTime) {
    buf.put_i32(8);
    buf.put_i64(dt.and_utc().timestamp_micros() - PG_EPOCH_MICROS);
}

fn encode_date(buf: &mut BytesMut, d: &NaiveDate) {
    buf.put_i32(4);
    buf.put_i32(d.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE);
}

fn time_micros(t: &NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * 1_000_000 + i64::from(t.nanosecond() / 1_000)
}

fn encode_time(buf: &mut BytesMut, t: &NaiveTime) {
    buf.put_i32(8);
    buf.put_i64(time_micros(t));
}

/// JSON document text. Binary values must be UTF-8.
fn json_text(value: &SqlValue) -> Option<&str> {
    match value {
        SqlValue::Text(s) => Some(s),
        SqlValue::Bytes(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}

/// `HH:MM:SS[.f][+hh[:mm]]`, returning the time and its offset east of UTC.
fn parse_time_tz(s: &str) -> Option<(NaiveTime, i32)> {
    let s = s.trim();
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return Some((t, 0));
    }
    let anchored = format!("2000-01-01 {}", s);
    DateTime::parse_from_str(&anchored, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dto| (dto.time(), dto.offset().local_minus_utc()))
}

/// Encode a Decimal as PostgreSQL NUMERIC.
///
/// Layout: ndigits, weight, sign, dscale (all i16), then `ndigits`
/// base-10000 digits, most significant first. `weight` is the power of
/// 10000 of the first digit.
pub fn encode_numeric(buf: &mut BytesMut, d: &Decimal) {
    let scale = d.scale();
    let dscale = scale as i16;

    if d.is_zero() {
        buf.put_i32(8);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(NUMERIC_POS);
        buf.put_i16(dscale);
        return;
    }

    let sign = if d.is_sign_negative() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    // Align the fractional part to whole base-10000 groups.
    let pad = (4 - scale % 4) % 4;
    let mut mantissa = d.mantissa().unsigned_abs() * 10u128.pow(pad);
    let frac_groups = ((scale + pad) / 4) as i16;

    let mut digits: Vec<i16> = Vec::new();
    while mantissa > 0 {
        digits.push((mantissa % 10_000) as i16);
        mantissa /= 10_000;
    }
    digits.reverse();

    let weight = digits.len() as i16 - frac_groups - 1;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    buf.put_i32(8 + 2 * digits.len() as i32);
    buf.put_i16(digits.len() as i16);
    buf.put_i16(weight);
    buf.put_i16(sign);
    buf.put_i16(dscale);
    for digit in digits {
        buf.put_i16(digit);
    }
}

fn to_bool(value: &SqlValue) -> Option<bool> {
    match value {
        SqlValue::Bool(b) => Some(*b),
        SqlValue::I16(v) => Some(*v != 0),
        SqlValue::I32(v) => Some(*v != 0),
        SqlValue::I64(v) => Some(*v != 0),
        SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Some(true),
            "false" | "f" | "0" | "no" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_i64(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Bool(b) => Some(i64::from(*b)),
        SqlValue::I16(v) => Some(i64::from(*v)),
        SqlValue::I32(v) => Some(i64::from(*v)),
        SqlValue::I64(v) => Some(*v),
        SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        SqlValue::F32(f) if f.fract() == 0.0 => f.to_i64(),
        SqlValue::F64(f) if f.fract() == 0.0 => f.to_i64(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::I16(v) => Some(f64::from(*v)),
        SqlValue::I32(v) => Some(f64::from(*v)),
        SqlValue::I64(v) => Some(*v as f64),
        SqlValue::F32(f) => Some(f64::from(*f)),
        SqlValue::F64(f) => Some(*f),
        SqlValue::Decimal(d) => d.to_f64(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_decimal(value: &SqlValue) -> Option<Decimal> {
    match value {
        SqlValue::Decimal(d) => Some(*d),
        SqlValue::I16(v) => Some(Decimal::from(*v)),
        SqlValue::I32(v) => Some(Decimal::from(*v)),
        SqlValue::I64(v) => Some(Decimal::from(*v)),
        SqlValue::F32(f) => Decimal::from_f32(*f),
        SqlValue::F64(f) => Decimal::from_f64(*f),
        SqlValue::Text(s) => {
            let s = s.trim();
            s.parse::<Decimal>()
                .ok()
                .or_else(|| Decimal::from_scientific(s).ok())
        }
        _ => None,
    }
}

fn to_naive_datetime(value: &SqlValue) -> Option<NaiveDateTime> {
    match value {
        SqlValue::DateTime(dt) => Some(*dt),
        SqlValue::DateTimeOffset(dto) => Some(dto.naive_local()),
        SqlValue::Date(d) => Some(d.and_time(NaiveTime::MIN)),
        SqlValue::Text(s) => parse_naive_datetime(s),
        _ => None,
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}
