use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Storage kinds a captured cell or bound parameter can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Declared type is unknown to the provider; the cell's own kind decides.
    Object,
    Boolean,
    Byte,
    Int16,
    Int32,
    Int64,
    Single,
    Double,
    Decimal,
    String,
    Bytes,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
    Guid,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Object => "Object",
            ValueKind::Boolean => "Boolean",
            ValueKind::Byte => "Byte",
            ValueKind::Int16 => "Int16",
            ValueKind::Int32 => "Int32",
            ValueKind::Int64 => "Int64",
            ValueKind::Single => "Single",
            ValueKind::Double => "Double",
            ValueKind::Decimal => "Decimal",
            ValueKind::String => "String",
            ValueKind::Bytes => "Bytes",
            ValueKind::DateTime => "DateTime",
            ValueKind::DateTimeOffset => "DateTimeOffset",
            ValueKind::Date => "Date",
            ValueKind::Time => "Time",
            ValueKind::Guid => "Guid",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueKind::Byte
                | ValueKind::Int16
                | ValueKind::Int32
                | ValueKind::Int64
                | ValueKind::Single
                | ValueKind::Double
                | ValueKind::Decimal
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single captured value. Null is an explicit marker, never a type default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    Boolean(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Single(#[serde(with = "float_repr::single")] f32),
    Double(#[serde(with = "float_repr::double")] f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
    Guid(Uuid),
}

impl DbValue {
    /// Storage kind of this value; `Null` reports `Object`.
    pub fn kind(&self) -> ValueKind {
        match self {
            DbValue::Null => ValueKind::Object,
            DbValue::Boolean(_) => ValueKind::Boolean,
            DbValue::Byte(_) => ValueKind::Byte,
            DbValue::Int16(_) => ValueKind::Int16,
            DbValue::Int32(_) => ValueKind::Int32,
            DbValue::Int64(_) => ValueKind::Int64,
            DbValue::Single(_) => ValueKind::Single,
            DbValue::Double(_) => ValueKind::Double,
            DbValue::Decimal(_) => ValueKind::Decimal,
            DbValue::String(_) => ValueKind::String,
            DbValue::Bytes(_) => ValueKind::Bytes,
            DbValue::DateTime(_) => ValueKind::DateTime,
            DbValue::DateTimeOffset(_) => ValueKind::DateTimeOffset,
            DbValue::Date(_) => ValueKind::Date,
            DbValue::Time(_) => ValueKind::Time,
            DbValue::Guid(_) => ValueKind::Guid,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Integer view of any integral storage kind.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            DbValue::Byte(v) => Some(i128::from(*v)),
            DbValue::Int16(v) => Some(i128::from(*v)),
            DbValue::Int32(v) => Some(i128::from(*v)),
            DbValue::Int64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for DbValue {
    fn default() -> Self {
        DbValue::Null
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbValue::Null => f.write_str("NULL"),
            DbValue::Boolean(v) => write!(f, "{}", v),
            DbValue::Byte(v) => write!(f, "{}", v),
            DbValue::Int16(v) => write!(f, "{}", v),
            DbValue::Int32(v) => write!(f, "{}", v),
            DbValue::Int64(v) => write!(f, "{}", v),
            DbValue::Single(v) => write!(f, "{}", v),
            DbValue::Double(v) => write!(f, "{}", v),
            DbValue::Decimal(v) => write!(f, "{}", v),
            DbValue::String(v) => f.write_str(v),
            DbValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            DbValue::DateTime(v) => write!(f, "{}", v),
            DbValue::DateTimeOffset(v) => write!(f, "{}", v.to_rfc3339()),
            DbValue::Date(v) => write!(f, "{}", v),
            DbValue::Time(v) => write!(f, "{}", v),
            DbValue::Guid(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from_for_db_value {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for DbValue {
                fn from(value: $source) -> Self {
                    DbValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_db_value! {
    bool => Boolean,
    u8 => Byte,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Single,
    f64 => Double,
    Decimal => Decimal,
    String => String,
    Vec<u8> => Bytes,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
    NaiveDate => Date,
    NaiveTime => Time,
    Uuid => Guid,
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        DbValue::String(value.to_string())
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(DbValue::Null, Into::into)
    }
}

/// Float cells as JSON numbers, with `NaN`, `Infinity` and `-Infinity` spelled
/// out as strings. Plain serde_json writes all three as `null`.
mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    fn non_finite_name(value: f64) -> Option<&'static str> {
        if value.is_nan() {
            Some("NaN")
        } else if value == f64::INFINITY {
            Some("Infinity")
        } else if value == f64::NEG_INFINITY {
            Some("-Infinity")
        } else {
            None
        }
    }

    fn read<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float literal '{}'", other))),
            },
        }
    }

    pub mod double {
        use super::*;

        pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            match non_finite_name(*value) {
                Some(name) => serializer.serialize_str(name),
                None => serializer.serialize_f64(*value),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            read(deserializer)
        }
    }

    pub mod single {
        use super::*;

        pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
            match non_finite_name(f64::from(*value)) {
                Some(name) => serializer.serialize_str(name),
                None => serializer.serialize_f32(*value),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
            read(deserializer).map(|value| value as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reports_object_kind() {
        assert_eq!(DbValue::Null.kind(), ValueKind::Object);
        assert!(DbValue::Null.is_null());
        assert_eq!(DbValue::from(None::<i32>), DbValue::Null);
    }

    #[test]
    fn test_integer_view() {
        assert_eq!(DbValue::Byte(7).as_i128(), Some(7));
        assert_eq!(DbValue::Int64(-3).as_i128(), Some(-3));
        assert_eq!(DbValue::Double(1.0).as_i128(), None);
    }

    #[test]
    fn test_json_shape_is_stable() {
        let json = serde_json::to_string(&DbValue::Int32(5)).unwrap();
        assert_eq!(json, r#"{"Int32":5}"#);
        assert_eq!(serde_json::to_string(&DbValue::Null).unwrap(), r#""Null""#);
    }

    #[test]
    fn test_non_finite_floats_survive_json() {
        let cases = [
            (DbValue::Double(f64::INFINITY), r#"{"Double":"Infinity"}"#),
            (DbValue::Double(f64::NEG_INFINITY), r#"{"Double":"-Infinity"}"#),
            (DbValue::Single(f32::INFINITY), r#"{"Single":"Infinity"}"#),
            (DbValue::Double(2.5), r#"{"Double":2.5}"#),
        ];
        for (value, expected) in cases {
            let json = serde_json::to_string(&value).unwrap();
            assert_eq!(json, expected);
            assert_eq!(serde_json::from_str::<DbValue>(&json).unwrap(), value);
        }

        let nan = serde_json::to_string(&DbValue::Single(f32::NAN)).unwrap();
        assert_eq!(nan, r#"{"Single":"NaN"}"#);
        match serde_json::from_str::<DbValue>(&nan).unwrap() {
            DbValue::Single(v) => assert!(v.is_nan()),
            other => panic!("unexpected {:?}", other),
        }

        assert!(serde_json::from_str::<DbValue>(r#"{"Double":"Lots"}"#).is_err());
        assert_eq!(
            serde_json::from_str::<DbValue>(r#"{"Double":3}"#).unwrap(),
            DbValue::Double(3.0)
        );
    }
}
