//! Dialect-aware value conversion.
//!
//! Change-set field values always arrive as strings. Before a row mutation is
//! buffered, every value is converted into a typed [`Value`] for the target
//! column, using the [`ValueConverter`] of the store's [`Dialect`]. Conversion
//! never coerces silently: unparsable input is a [`SinkError::Conversion`].

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SinkError};

// ─── ColumnType ──────────────────────────────────────────────────────────────

/// Logical type of a destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    /// Arbitrary precision decimal, carried as text.
    Numeric,
    Date,
    Timestamp,
    Json,
    Array(Box<ColumnType>),
}

impl ColumnType {
    /// Map a declared SQL type (`BIGINT`, `timestamptz`, `_text`, `Array(String)`, ...)
    /// to its logical type. Unrecognized declarations are treated as text.
    pub fn from_sql(declared: &str) -> Self {
        let decl = declared.trim().to_ascii_lowercase();

        if let Some(inner) = decl.strip_suffix("[]") {
            return Self::Array(Box::new(Self::from_sql(inner)));
        }
        if let Some(inner) = decl.strip_prefix('_') {
            return Self::Array(Box::new(Self::from_sql(inner)));
        }
        if let Some(inner) = decl.strip_prefix("array(").and_then(|s| s.strip_suffix(')')) {
            return Self::Array(Box::new(Self::from_sql(inner)));
        }
        if let Some(inner) = decl.strip_prefix("nullable(").and_then(|s| s.strip_suffix(')')) {
            return Self::from_sql(inner);
        }

        let base = decl.split('(').next().unwrap_or_default().trim();
        match base {
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "mediumint" | "int2"
            | "int4" | "int8" | "serial" | "bigserial" | "smallserial" | "int16" | "int32"
            | "int64" | "uint8" | "uint16" | "uint32" => Self::Integer,
            "real" | "float" | "double" | "double precision" | "float4" | "float8"
            | "float32" | "float64" => Self::Float,
            "bool" | "boolean" => Self::Boolean,
            "numeric" | "decimal" | "uint64" | "int128" | "uint128" | "int256" | "uint256" => {
                Self::Numeric
            }
            "date" | "date32" => Self::Date,
            "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" | "datetime" | "datetime64" => Self::Timestamp,
            "json" | "jsonb" => Self::Json,
            _ => Self::Text,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "Text"),
            Self::Integer => write!(f, "Integer"),
            Self::Float => write!(f, "Float"),
            Self::Boolean => write!(f, "Boolean"),
            Self::Numeric => write!(f, "Numeric"),
            Self::Date => write!(f, "Date"),
            Self::Timestamp => write!(f, "Timestamp"),
            Self::Json => write!(f, "Json"),
            Self::Array(inner) => write!(f, "Array({inner})"),
        }
    }
}

// ─── Value ───────────────────────────────────────────────────────────────────

/// A typed column value ready to be bound to a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    BoolArray(Vec<bool>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// JSON rendering, used for array columns of dialects without native arrays.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Text(s) => json!(s),
            Self::Int(i) => json!(i),
            Self::Float(f) => json!(f),
            Self::Bool(b) => json!(b),
            Self::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            Self::TextArray(v) => json!(v),
            Self::IntArray(v) => json!(v),
            Self::FloatArray(v) => json!(v),
            Self::BoolArray(v) => json!(v),
        }
    }
}

// ─── Dialect ─────────────────────────────────────────────────────────────────

/// SQL dialect a store speaks. Selected once, when the store is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Clickhouse,
    Sqlite,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres => "Postgres",
            Self::Clickhouse => "Clickhouse",
            Self::Sqlite => "Sqlite",
        }
    }

    /// The converter implementing this dialect's rules.
    pub fn converter(&self) -> &'static dyn ValueConverter {
        match self {
            Self::Postgres => &PostgresConverter,
            Self::Clickhouse => &ClickhouseConverter,
            Self::Sqlite => &SqliteConverter,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─── ValueConverter ──────────────────────────────────────────────────────────

/// Converts raw field strings into typed values for one dialect.
///
/// Scalars share the same parsing rules everywhere; dialects differ in how
/// dates are represented and in which array element types they accept.
pub trait ValueConverter: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Whether `element` can be stored as an array element.
    fn supports_array_of(&self, element: &ColumnType) -> bool;

    /// Representation of a validated calendar date.
    fn date_value(&self, raw: &str, date: NaiveDate) -> Value;

    /// Convert `raw` for a column of type `ty`.
    fn convert(&self, raw: &str, ty: &ColumnType) -> Result<Value> {
        match ty {
            ColumnType::Text => Ok(Value::Text(raw.to_string())),
            ColumnType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| conversion(raw, "integer", e)),
            ColumnType::Float => raw
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| conversion(raw, "float", e)),
            ColumnType::Boolean => parse_bool(raw).map(Value::Bool),
            ColumnType::Numeric => {
                validate_numeric(raw)?;
                Ok(Value::Text(raw.trim().to_string()))
            }
            ColumnType::Json => {
                serde_json::from_str::<serde_json::Value>(raw)
                    .map_err(|e| conversion(raw, "json", e))?;
                Ok(Value::Text(raw.to_string()))
            }
            ColumnType::Date => Ok(self.date_value(raw, parse_date(raw)?)),
            ColumnType::Timestamp => parse_timestamp(raw).map(Value::Int),
            ColumnType::Array(element) => {
                if !self.supports_array_of(element) {
                    return Err(SinkError::UnsupportedArrayType {
                        element: element.to_string(),
                        dialect: self.dialect().name(),
                    });
                }
                match element.as_ref() {
                    ColumnType::Text => parse_array(raw, element).map(Value::TextArray),
                    ColumnType::Integer => parse_array(raw, element).map(Value::IntArray),
                    ColumnType::Float => parse_array(raw, element).map(Value::FloatArray),
                    ColumnType::Boolean => parse_array(raw, element).map(Value::BoolArray),
                    other => Err(SinkError::UnsupportedArrayType {
                        element: other.to_string(),
                        dialect: self.dialect().name(),
                    }),
                }
            }
        }
    }
}

/// PostgreSQL: native dates and arrays of text, integers, floats and booleans.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConverter;

impl ValueConverter for PostgresConverter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn supports_array_of(&self, element: &ColumnType) -> bool {
        matches!(
            element,
            ColumnType::Text | ColumnType::Integer | ColumnType::Float | ColumnType::Boolean
        )
    }

    fn date_value(&self, _raw: &str, date: NaiveDate) -> Value {
        Value::Date(date)
    }
}

/// ClickHouse: dates are passed as their literal string form.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClickhouseConverter;

impl ValueConverter for ClickhouseConverter {
    fn dialect(&self) -> Dialect {
        Dialect::Clickhouse
    }

    fn supports_array_of(&self, element: &ColumnType) -> bool {
        matches!(
            element,
            ColumnType::Text | ColumnType::Integer | ColumnType::Float
        )
    }

    fn date_value(&self, raw: &str, _date: NaiveDate) -> Value {
        Value::Text(raw.to_string())
    }
}

/// SQLite: dates stay text, arrays are stored as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConverter;

impl ValueConverter for SqliteConverter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn supports_array_of(&self, element: &ColumnType) -> bool {
        matches!(
            element,
            ColumnType::Text | ColumnType::Integer | ColumnType::Float
        )
    }

    fn date_value(&self, raw: &str, _date: NaiveDate) -> Value {
        Value::Text(raw.to_string())
    }
}

// ─── Parsing helpers ─────────────────────────────────────────────────────────

fn conversion(raw: &str, target: &str, err: impl std::fmt::Display) -> SinkError {
    SinkError::Conversion(format!("could not convert {raw} to {target}: {err}"))
}

/// Strict `YYYY-MM-DD` parsing with a reason naming the bad component.
fn parse_date(raw: &str) -> Result<NaiveDate> {
    let fail = |reason: &str| {
        SinkError::Conversion(format!(
            "could not convert {raw} to date: parsing time {raw:?}: {reason}"
        ))
    };

    let parts: Vec<&str> = raw.split('-').collect();
    let [year, month, day] = parts[..] else {
        return Err(fail("cannot parse as YYYY-MM-DD"));
    };
    let all_digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(year, 4) || !all_digits(month, 2) || !all_digits(day, 2) {
        return Err(fail("cannot parse as YYYY-MM-DD"));
    }

    let year: i32 = year.parse().map_err(|_| fail("year out of range"))?;
    let month: u32 = month.parse().map_err(|_| fail("month out of range"))?;
    let day: u32 = day.parse().map_err(|_| fail("day out of range"))?;
    if !(1..=12).contains(&month) {
        return Err(fail("month out of range"));
    }
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| fail("day out of range"))
}

/// RFC 3339 with offset, or `YYYY-MM-DD HH:MM:SS[.fff]` read as UTC.
fn parse_timestamp(raw: &str) -> Result<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ts| ts.and_utc().timestamp())
        .map_err(|e| conversion(raw, "timestamp", e))
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(conversion(raw, "boolean", "expected true/false")),
    }
}

fn validate_numeric(raw: &str) -> Result<()> {
    let s = raw.trim();
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if digits(int_part) && frac_part.map_or(true, digits) {
        Ok(())
    } else {
        Err(conversion(raw, "numeric", "not a decimal number"))
    }
}

fn parse_array<T: DeserializeOwned>(raw: &str, element: &ColumnType) -> Result<Vec<T>> {
    serde_json::from_str(raw).map_err(|e| conversion(raw, &format!("{element} array"), e))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
