//! Conversions applied when a replayed cell is read through a typed getter.
//!
//! Each target accepts its own storage kind plus the kinds listed on its impl.
//! Anything else is a [`QueryCacheError::TypeCoercion`] that carries the raw
//! captured value back to the caller.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use querycache_core::{DbValue, QueryCacheError, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use uuid::Uuid;

const DATE_TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMATS: [&str; 2] = ["%H:%M:%S%.f", "%H:%M"];

/// A type a captured [`DbValue`] can be coerced into.
pub trait FromDbValue: Sized {
    /// Name reported in coercion errors.
    const TARGET: &'static str;

    fn from_db_value(value: &DbValue) -> Result<Self>;
}

fn mismatch<T: FromDbValue>(value: &DbValue) -> QueryCacheError {
    QueryCacheError::coercion(T::TARGET, value)
}

impl FromDbValue for DbValue {
    const TARGET: &'static str = "value";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    const TARGET: &'static str = T::TARGET;

    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Null => Ok(None),
            other => T::from_db_value(other).map(Some),
        }
    }
}

/// Numeric cells are truthy when non-zero; text accepts `true`/`false`.
impl FromDbValue for bool {
    const TARGET: &'static str = "bool";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        if let Some(v) = value.as_i128() {
            return Ok(v != 0);
        }
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Single(v) => Ok(*v != 0.0),
            DbValue::Double(v) => Ok(*v != 0.0),
            DbValue::Decimal(v) => Ok(!v.is_zero()),
            DbValue::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(true),
            DbValue::String(s) if s.trim().eq_ignore_ascii_case("false") => Ok(false),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

/// Integral view of a numeric cell, `None` when it has a fractional part.
fn integral_value(value: &DbValue) -> Option<i128> {
    if let Some(v) = value.as_i128() {
        return Some(v);
    }
    match value {
        DbValue::Boolean(v) => Some(i128::from(*v)),
        DbValue::Single(v) if v.fract() == 0.0 => float_to_i128(f64::from(*v)),
        DbValue::Double(v) if v.fract() == 0.0 => float_to_i128(*v),
        DbValue::Decimal(v) if v.fract().is_zero() => v.to_i128(),
        _ => None,
    }
}

fn float_to_i128(v: f64) -> Option<i128> {
    // i64 range is all the integer targets need
    if v.is_finite() && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Some(v as i128)
    } else {
        None
    }
}

macro_rules! impl_integer_coercion {
    ($($target:ty => $name:literal),* $(,)?) => {
        $(
            /// Any numeric or boolean cell whose value fits without loss.
            impl FromDbValue for $target {
                const TARGET: &'static str = $name;

                fn from_db_value(value: &DbValue) -> Result<Self> {
                    integral_value(value)
                        .and_then(|v| <$target>::try_from(v).ok())
                        .ok_or_else(|| mismatch::<Self>(value))
                }
            }
        )*
    };
}

impl_integer_coercion! {
    u8 => "u8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
}

impl FromDbValue for f64 {
    const TARGET: &'static str = "f64";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        if let Some(v) = value.as_i128() {
            return Ok(v as f64);
        }
        match value {
            DbValue::Single(v) => Ok(f64::from(*v)),
            DbValue::Double(v) => Ok(*v),
            DbValue::Decimal(v) => v.to_f64().ok_or_else(|| mismatch::<Self>(value)),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl FromDbValue for f32 {
    const TARGET: &'static str = "f32";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Single(v) => Ok(*v),
            DbValue::Double(v) if !v.is_finite() || v.abs() <= f64::from(f32::MAX) => {
                Ok(*v as f32)
            }
            DbValue::Double(_) => Err(mismatch::<Self>(value)),
            other => f64::from_db_value(other)
                .map(|v| v as f32)
                .map_err(|_| mismatch::<Self>(other)),
        }
    }
}

impl FromDbValue for Decimal {
    const TARGET: &'static str = "decimal";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let converted = match value {
            DbValue::Decimal(v) => Some(*v),
            DbValue::Single(v) => Decimal::from_f32(*v),
            DbValue::Double(v) => Decimal::from_f64(*v),
            other => other.as_i128().and_then(Decimal::from_i128),
        };
        converted.ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromDbValue for String {
    const TARGET: &'static str = "string";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::String(s) => Ok(s.clone()),
            DbValue::Guid(g) => Ok(g.to_string()),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

/// Only from a string holding exactly one character.
impl FromDbValue for char {
    const TARGET: &'static str = "char";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let single = value.as_str().and_then(|s| {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        });
        single.ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromDbValue for Vec<u8> {
    const TARGET: &'static str = "bytes";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        match value {
            DbValue::Bytes(b) => Ok(b.clone()),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

/// From a guid, its text form, or 16 bytes in mixed-endian field order.
impl FromDbValue for Uuid {
    const TARGET: &'static str = "guid";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let converted = match value {
            DbValue::Guid(g) => Some(*g),
            DbValue::String(s) => Uuid::parse_str(s.trim()).ok(),
            DbValue::Bytes(b) => <[u8; 16]>::try_from(b.as_slice())
                .ok()
                .map(Uuid::from_bytes_le),
            _ => None,
        };
        converted.ok_or_else(|| mismatch::<Self>(value))
    }
}

fn parse_date_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl FromDbValue for NaiveDateTime {
    const TARGET: &'static str = "datetime";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let converted = match value {
            DbValue::DateTime(v) => Some(*v),
            DbValue::DateTimeOffset(v) => Some(v.naive_local()),
            DbValue::Date(v) => v.and_hms_opt(0, 0, 0),
            DbValue::String(s) => parse_date_time(s),
            _ => None,
        };
        converted.ok_or_else(|| mismatch::<Self>(value))
    }
}

/// Naive date-times are taken as UTC.
impl FromDbValue for DateTime<FixedOffset> {
    const TARGET: &'static str = "datetimeoffset";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let converted = match value {
            DbValue::DateTimeOffset(v) => Some(*v),
            DbValue::DateTime(v) => Some(v.and_utc().fixed_offset()),
            DbValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .or_else(|| DateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f %:z").ok())
                .or_else(|| parse_date_time(s).map(|v| v.and_utc().fixed_offset())),
            _ => None,
        };
        converted.ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromDbValue for DateTime<Utc> {
    const TARGET: &'static str = "datetime_utc";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        DateTime::<FixedOffset>::from_db_value(value)
            .map(|v| v.with_timezone(&Utc))
            .map_err(|_| mismatch::<Self>(value))
    }
}

impl FromDbValue for NaiveDate {
    const TARGET: &'static str = "date";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let converted = match value {
            DbValue::Date(v) => Some(*v),
            DbValue::DateTime(v) => Some(v.date()),
            DbValue::DateTimeOffset(v) => Some(v.date_naive()),
            DbValue::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .ok()
                .or_else(|| parse_date_time(s).map(|v| v.date())),
            _ => None,
        };
        converted.ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromDbValue for NaiveTime {
    const TARGET: &'static str = "time";

    fn from_db_value(value: &DbValue) -> Result<Self> {
        let converted = match value {
            DbValue::Time(v) => Some(*v),
            DbValue::DateTime(v) => Some(v.time()),
            DbValue::String(s) => TIME_FORMATS
                .iter()
                .find_map(|format| NaiveTime::parse_from_str(s.trim(), format).ok()),
            _ => None,
        };
        converted.ok_or_else(|| mismatch::<Self>(value))
    }
}
