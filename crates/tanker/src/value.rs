//! Runtime values shared by the read and write paths.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::{Error, Result};

/// A runtime SQL value.
///
/// Used for query parameters, staged rows and cursor output. Maps to the
/// column types of both backends.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL
    Null,

    /// Boolean
    Bool(bool),

    /// Signed integer (INTEGER and BIGINT)
    Int(i64),

    /// Double precision float (FLOAT)
    Float(f64),

    /// Text (VARCHAR)
    Str(String),

    /// Binary data (BYTEA)
    Bytes(Vec<u8>),

    /// Calendar date (DATE)
    Date(NaiveDate),

    /// Naive timestamp (TIMESTAMP)
    Timestamp(NaiveDateTime),

    /// Timezone-aware timestamp (TIMESTAMPTZ)
    Timestamptz(DateTime<Utc>),

    /// JSON document (JSONB)
    Json(serde_json::Value),

    /// Array of values; expands to one placeholder per element when bound
    Array(Vec<Value>),
}

pub(crate) const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const TIMESTAMPTZ_FMT: &str = "%Y-%m-%d %H:%M:%S%z";
pub(crate) const DATE_FMT: &str = "%Y-%m-%d";

impl Value {
    /// Returns true if this is a NULL value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Build an array value from anything convertible.
    pub fn array<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Value {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// Convert a JSON document into a runtime value. Objects stay JSON.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Json(v.clone()),
        }
    }

    /// Render as a JSON document.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::from(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(String::from_utf8_lossy(b).into_owned()),
            Value::Date(d) => serde_json::Value::from(d.format(DATE_FMT).to_string()),
            Value::Timestamp(t) => serde_json::Value::from(t.format(TIMESTAMP_FMT).to_string()),
            Value::Timestamptz(t) => {
                serde_json::Value::from(t.format(TIMESTAMPTZ_FMT).to_string())
            }
            Value::Json(j) => j.clone(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Text rendering used inside array literals (`{a,b,null}`) and by
    /// plain-text front-ends.
    pub fn literal_text(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Date(d) => d.format(DATE_FMT).to_string(),
            Value::Timestamp(t) => t.format(TIMESTAMP_FMT).to_string(),
            Value::Timestamptz(t) => t.format(TIMESTAMPTZ_FMT).to_string(),
            Value::Json(j) => j.to_string(),
            Value::Array(items) => {
                let cells: Vec<String> = items.iter().map(Value::literal_text).collect();
                format!("{{{}}}", cells.join(","))
            }
        }
    }

    /// Render as a standalone SQL literal, used by the client-side batch
    /// insert that loads staging tables when no copy channel is available.
    pub(crate) fn sql_literal(&self) -> String {
        fn quoted(s: &str) -> String {
            format!("'{}'", s.replace('\'', "''"))
        }
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => quoted(s),
            Value::Bytes(b) => {
                let hex: String = b.iter().map(|x| format!("{x:02x}")).collect();
                format!("'\\x{hex}'")
            }
            Value::Date(_) | Value::Timestamp(_) | Value::Timestamptz(_) | Value::Json(_) => {
                quoted(&self.literal_text())
            }
            Value::Array(_) => quoted(&self.literal_text()),
        }
    }

    /// Text-format cell for the copy channel. `None` encodes NULL.
    pub(crate) fn copy_text(&self) -> Option<String> {
        if self.is_null() {
            return None;
        }
        let raw = self.literal_text();
        let mut out = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\t' => out.push_str("\\t"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                c => out.push(c),
            }
        }
        Some(out)
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "varchar",
            Value::Bytes(_) => "bytea",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::Timestamptz(_) => "timestamptz",
            Value::Json(_) => "jsonb",
            Value::Array(_) => "array",
        }
    }
}

// FK-cache keys are tuples of values; floats hash through their bit
// pattern, which is good enough for key columns.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Timestamptz(t) => t.hash(state),
            Value::Json(j) => j.to_string().hash(state),
            Value::Array(items) => items.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
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

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamptz(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl rusqlite::types::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(*b as i64)),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Str(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Date(_)
            | Value::Timestamp(_)
            | Value::Timestamptz(_)
            | Value::Json(_)
            | Value::Array(_) => ToSqlOutput::Owned(SqlValue::Text(self.literal_text())),
        })
    }
}

impl postgres_types::ToSql for Value {
    fn to_sql(
        &self,
        ty: &postgres_types::Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<postgres_types::IsNull, Box<dyn std::error::Error + Sync + Send>>
    {
        use postgres_types::{IsNull, ToSql, Type};
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => (*i as i16).to_sql(ty, out),
                Type::INT4 => (*i as i32).to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            // The statement may have inferred a typed parameter from the
            // comparison context; re-parse the text form in that case.
            Value::Str(s) => match *ty {
                Type::TIMESTAMP => parse_timestamp(s)?.to_sql(ty, out),
                Type::TIMESTAMPTZ => parse_timestamptz(s)?.to_sql(ty, out),
                Type::DATE => parse_date(s)?.to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => s.parse::<i64>()?.to_sql(ty, out),
                Type::FLOAT4 | Type::FLOAT8 => s.parse::<f64>()?.to_sql(ty, out),
                _ => s.to_sql(ty, out),
            },
            Value::Bytes(b) => b.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::Timestamp(t) => t.to_sql(ty, out),
            Value::Timestamptz(t) => t.to_sql(ty, out),
            Value::Json(j) => j.to_sql(ty, out),
            Value::Array(_) => Err(format!(
                "array value cannot be bound as a single parameter: {self:?}"
            )
            .into()),
        }
    }

    fn accepts(_ty: &postgres_types::Type) -> bool {
        true
    }

    postgres_types::to_sql_checked!();
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|_| Error::Coercion {
        value: s.to_string(),
        ctype: "date".to_string(),
    })
}

pub(crate) fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        TIMESTAMP_FMT,
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    Err(Error::Coercion {
        value: s.to_string(),
        ctype: "timestamp".to_string(),
    })
}

pub(crate) fn parse_timestamptz(s: &str) -> Result<DateTime<Utc>> {
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        TIMESTAMPTZ_FMT,
        "%Y-%m-%dT%H:%M:%S%z",
    ] {
        if let Ok(t) = DateTime::parse_from_str(s, fmt) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    // Fall back to a naive timestamp taken as UTC.
    parse_timestamp(s)
        .map(|t| t.and_utc())
        .map_err(|_| Error::Coercion {
            value: s.to_string(),
            ctype: "timestamptz".to_string(),
        })
}
