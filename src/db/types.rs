//! Engine-agnostic row rendering.
//!
//! Rows fetched through an execution context are returned as JSON maps so calling
//! code does not depend on which engine produced them.
//!
//! PostgreSQL columns are classified by their exact type name and decoded with the
//! matching Rust type. SQLite values are decoded by the storage class of the value
//! itself (column affinity does not constrain what a cell holds), with the declared
//! type only deciding whether an integer is a boolean.
//!
//! Rendering:
//! - NUMERIC as its exact decimal string, BYTEA/BLOB as base64
//! - TIMESTAMPTZ as RFC 3339 in UTC, TIMESTAMP as ISO 8601 without offset
//! - DATE as `YYYY-MM-DD`, TIME as `HH:MM:SS[.f]`, INTERVAL as ISO 8601 duration

use crate::models::Row;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};
use uuid::Uuid;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Interval,
    /// No dedicated decoder; rendered as text when the driver allows it.
    Other,
}

/// Classify a PostgreSQL type name (as reported by the driver) into a category.
pub fn categorize_pg_type(type_name: &str) -> TypeCategory {
    match type_name.to_ascii_uppercase().as_str() {
        "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "SMALLSERIAL"
        | "SERIAL" | "BIGSERIAL" => TypeCategory::Integer,
        "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" => TypeCategory::Float,
        "NUMERIC" | "DECIMAL" => TypeCategory::Decimal,
        "BOOL" | "BOOLEAN" => TypeCategory::Boolean,
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
            TypeCategory::Text
        }
        "BYTEA" => TypeCategory::Binary,
        "JSON" | "JSONB" => TypeCategory::Json,
        "UUID" => TypeCategory::Uuid,
        "TIMESTAMP" => TypeCategory::Timestamp,
        "TIMESTAMPTZ" => TypeCategory::TimestampTz,
        "DATE" => TypeCategory::Date,
        "TIME" => TypeCategory::Time,
        "INTERVAL" => TypeCategory::Interval,
        _ => TypeCategory::Other,
    }
}

/// Classify a SQLite value from its runtime storage class and the column's
/// declared type.
pub fn categorize_sqlite_value(storage_class: &str, declared: &str) -> TypeCategory {
    match storage_class {
        "INTEGER" if declared.eq_ignore_ascii_case("BOOLEAN") => TypeCategory::Boolean,
        "INTEGER" => TypeCategory::Integer,
        "REAL" => TypeCategory::Float,
        "BLOB" => TypeCategory::Binary,
        _ => TypeCategory::Text,
    }
}

/// Exact NUMERIC value as a decimal string.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("NUMERIC")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary wire form of NUMERIC: a header of four big-endian 16-bit
/// words (digit count, weight, sign, display scale) followed by base-10000 digits.
fn numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    let word = |i: usize| -> Result<u16, sqlx::error::BoxDynError> {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i64;
    let sign = word(2)?;
    let dscale = word(3)? as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid NUMERIC sign {:#06x}", other).into()),
    }

    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<u16>, _>>()?;
    // Digit group at power-of-10000 position `pos`; zero outside the stored range
    let group = |pos: i64| -> u16 {
        let idx = weight - pos;
        if idx >= 0 && (idx as usize) < digits.len() {
            digits[idx as usize]
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(weight).to_string());
        for pos in (0..weight).rev() {
            out.push_str(&format!("{:04}", group(pos)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let groups = dscale.div_ceil(4) as i64;
        for pos in 1..=groups {
            fraction.push_str(&format!("{:04}", group(-pos)));
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

/// Binary data is rendered as base64.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Render an interval as an ISO 8601 duration, e.g. `P1M2DT3600S`.
pub fn interval_to_string(interval: &PgInterval) -> String {
    let mut out = String::from("P");
    if interval.months != 0 {
        out.push_str(&format!("{}M", interval.months));
    }
    if interval.days != 0 {
        out.push_str(&format!("{}D", interval.days));
    }
    if interval.microseconds != 0 {
        let secs = interval.microseconds / 1_000_000;
        let micros = (interval.microseconds % 1_000_000).abs();
        if micros == 0 {
            out.push_str(&format!("T{}S", secs));
        } else {
            let sign = if interval.microseconds < 0 && secs == 0 { "-" } else { "" };
            let fraction = format!("{:06}", micros);
            out.push_str(&format!("T{}{}.{}S", sign, secs, fraction.trim_end_matches('0')));
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    out
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_pg_type(type_name);
                (
                    col.name().to_string(),
                    postgres::decode_column(self, idx, type_name, category),
                )
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                (
                    col.name().to_string(),
                    sqlite::decode_column(self, idx, col.type_info().name()),
                )
            })
            .collect()
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

mod postgres {
    use super::*;

    /// Decode `T` and render it, logging (not failing) on a decode error.
    fn render<'r, T>(row: &'r PgRow, idx: usize, type_name: &str, f: impl FnOnce(T) -> JsonValue) -> JsonValue
    where
        T: Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        match row.try_get::<Option<T>, _>(idx) {
            Ok(Some(v)) => f(v),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::warn!(column = idx, type_name, error = %e, "Failed to decode column");
                JsonValue::Null
            }
        }
    }

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Integer => match type_name {
                "INT2" => render(row, idx, type_name, |v: i16| JsonValue::Number(v.into())),
                "INT4" => render(row, idx, type_name, |v: i32| JsonValue::Number(v.into())),
                _ => render(row, idx, type_name, |v: i64| JsonValue::Number(v.into())),
            },
            TypeCategory::Float => match type_name {
                "FLOAT4" => render(row, idx, type_name, |v: f32| float_value(v as f64)),
                _ => render(row, idx, type_name, float_value),
            },
            TypeCategory::Decimal => {
                render(row, idx, type_name, |v: RawDecimal| JsonValue::String(v.0))
            }
            TypeCategory::Boolean => render(row, idx, type_name, JsonValue::Bool),
            TypeCategory::Binary => {
                render(row, idx, type_name, |v: Vec<u8>| encode_binary_value(&v))
            }
            TypeCategory::Json => render(row, idx, type_name, |v: JsonValue| v),
            TypeCategory::Uuid => {
                render(row, idx, type_name, |v: Uuid| JsonValue::String(v.to_string()))
            }
            TypeCategory::TimestampTz => render(row, idx, type_name, |v: DateTime<Utc>| {
                JsonValue::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }),
            TypeCategory::Timestamp => render(row, idx, type_name, |v: NaiveDateTime| {
                JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }),
            TypeCategory::Date => {
                render(row, idx, type_name, |v: NaiveDate| JsonValue::String(v.to_string()))
            }
            TypeCategory::Time => {
                render(row, idx, type_name, |v: NaiveTime| JsonValue::String(v.to_string()))
            }
            TypeCategory::Interval => render(row, idx, type_name, |v: PgInterval| {
                JsonValue::String(interval_to_string(&v))
            }),
            TypeCategory::Text | TypeCategory::Other => {
                render(row, idx, type_name, JsonValue::String)
            }
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> JsonValue {
        let storage_class = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_string(),
            Err(e) => {
                tracing::warn!(column = idx, error = %e, "Failed to read column");
                return JsonValue::Null;
            }
        };

        match categorize_sqlite_value(&storage_class, declared) {
            TypeCategory::Boolean => row
                .try_get::<i64, _>(idx)
                .map(|v| JsonValue::Bool(v != 0))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Integer => row
                .try_get::<i64, _>(idx)
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => row
                .try_get::<f64, _>(idx)
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|v| encode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            _ => row
                .try_get::<String, _>(idx)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }
}
