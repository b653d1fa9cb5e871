//! PostgreSQL row to JSON mapping.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category decoders handle the actual value extraction
//!
//! NUMERIC stays a string so no precision is lost, bytea is base64 and
//! timestamps are RFC 3339. A column that cannot be decoded is logged and
//! returned as null; it never disappears silently.

use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney};
use sqlx::postgres::{PgRow, PgTypeInfo, PgTypeKind, PgValueRef, Postgres};
use sqlx::{Column, Decode, Row, Type, TypeInfo};
use tracing::error;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Interval,
    Oid,
    Money,
    Network,
    /// Text-encoded on the wire: character types and enums.
    Text,
    Array,
    Unknown,
}

/// Classify a PostgreSQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();
    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }

    match lower.as_str() {
        "numeric" | "decimal" => TypeCategory::Decimal,
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "serial" | "bigserial" => {
            TypeCategory::Integer
        }
        "bool" | "boolean" => TypeCategory::Boolean,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "interval" => TypeCategory::Interval,
        "oid" => TypeCategory::Oid,
        "money" => TypeCategory::Money,
        "inet" | "cidr" => TypeCategory::Network,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "unknown" => {
            TypeCategory::Text
        }
        _ => TypeCategory::Unknown,
    }
}

/// Classify a column type, recognizing user-defined enums by their kind.
pub fn categorize(type_info: &PgTypeInfo) -> TypeCategory {
    match type_info.kind() {
        PgTypeKind::Enum(_) => TypeCategory::Text,
        PgTypeKind::Array(_) => TypeCategory::Array,
        _ => categorize_type(type_info.name()),
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary data as base64 text.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

// =============================================================================
// Row to JSON
// =============================================================================

/// Trait for converting database rows to JSON maps keyed by column name.
pub trait RowToJson {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_info = col.type_info();
                let value = decode_column(self, idx, type_info).unwrap_or_else(|e| {
                    error!(
                        column = col.name(),
                        column_type = type_info.name(),
                        error = %e,
                        "Failed to decode column; returning null"
                    );
                    JsonValue::Null
                });
                (col.name().to_string(), value)
            })
            .collect()
    }
}

type Decoded = Result<JsonValue, BoxDynError>;

fn decode_column(row: &PgRow, idx: usize, type_info: &PgTypeInfo) -> Decoded {
    let name = type_info.name().to_lowercase();
    match categorize(type_info) {
        TypeCategory::Decimal => decode::<RawDecimal>(row, idx, |v| JsonValue::String(v.0)),
        TypeCategory::Integer => match name.as_str() {
            "int2" | "smallint" => decode::<i16>(row, idx, JsonValue::from),
            "int4" | "integer" | "serial" => decode::<i32>(row, idx, JsonValue::from),
            _ => decode::<i64>(row, idx, JsonValue::from),
        },
        TypeCategory::Float => match name.as_str() {
            "float4" | "real" => decode::<f32>(row, idx, |v| float_json(f64::from(v))),
            _ => decode::<f64>(row, idx, float_json),
        },
        TypeCategory::Boolean => decode::<bool>(row, idx, JsonValue::Bool),
        TypeCategory::Binary => decode::<Vec<u8>>(row, idx, |v| encode_binary_value(&v)),
        TypeCategory::Json => decode::<JsonValue>(row, idx, |v| v),
        TypeCategory::Uuid => decode::<uuid::Uuid>(row, idx, |v| JsonValue::String(v.to_string())),
        TypeCategory::Timestamp => decode::<chrono::NaiveDateTime>(row, idx, |v| {
            JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        TypeCategory::TimestampTz => {
            decode::<chrono::DateTime<chrono::Utc>>(row, idx, |v| JsonValue::String(v.to_rfc3339()))
        }
        TypeCategory::Date => {
            decode::<chrono::NaiveDate>(row, idx, |v| JsonValue::String(v.to_string()))
        }
        TypeCategory::Time => {
            decode::<chrono::NaiveTime>(row, idx, |v| JsonValue::String(v.to_string()))
        }
        TypeCategory::Interval => decode::<PgInterval>(row, idx, interval_json),
        TypeCategory::Oid => decode::<Oid>(row, idx, |v| JsonValue::from(v.0)),
        // Minor currency units; the scale depends on the server's lc_monetary.
        TypeCategory::Money => decode::<PgMoney>(row, idx, |v| JsonValue::from(v.0)),
        TypeCategory::Network => decode::<sqlx::types::ipnetwork::IpNetwork>(row, idx, |v| {
            JsonValue::String(v.to_string())
        }),
        TypeCategory::Text => Ok(row
            .try_get_unchecked::<Option<String>, _>(idx)?
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null)),
        TypeCategory::Array => decode_array(row, idx, &name),
        TypeCategory::Unknown => Err(format!("unsupported column type {}", type_info.name()).into()),
    }
}

fn decode<T>(row: &PgRow, idx: usize, to_json: impl FnOnce(T) -> JsonValue) -> Decoded
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    Ok(row
        .try_get::<Option<T>, _>(idx)?
        .map(to_json)
        .unwrap_or(JsonValue::Null))
}

fn decode_elements<T>(row: &PgRow, idx: usize, to_json: impl Fn(T) -> JsonValue) -> Decoded
where
    Vec<Option<T>>: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    decode::<Vec<Option<T>>>(row, idx, |items| {
        JsonValue::Array(
            items
                .into_iter()
                .map(|item| item.map(&to_json).unwrap_or(JsonValue::Null))
                .collect(),
        )
    })
}

fn decode_array(row: &PgRow, idx: usize, name: &str) -> Decoded {
    match name.trim_end_matches("[]") {
        "text" | "varchar" | "bpchar" | "name" => decode_elements::<String>(row, idx, JsonValue::String),
        "int2" => decode_elements::<i16>(row, idx, JsonValue::from),
        "int4" => decode_elements::<i32>(row, idx, JsonValue::from),
        "int8" => decode_elements::<i64>(row, idx, JsonValue::from),
        "float4" => decode_elements::<f32>(row, idx, |v| float_json(f64::from(v))),
        "float8" => decode_elements::<f64>(row, idx, float_json),
        "bool" => decode_elements::<bool>(row, idx, JsonValue::Bool),
        "uuid" => decode_elements::<uuid::Uuid>(row, idx, |v| JsonValue::String(v.to_string())),
        "json" | "jsonb" => decode_elements::<JsonValue>(row, idx, |v| v),
        "timestamptz" => decode_elements::<chrono::DateTime<chrono::Utc>>(row, idx, |v| {
            JsonValue::String(v.to_rfc3339())
        }),
        "date" => decode_elements::<chrono::NaiveDate>(row, idx, |v| JsonValue::String(v.to_string())),
        other => Err(format!("unsupported array element type {other}").into()),
    }
}

fn float_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn interval_json(v: PgInterval) -> JsonValue {
    serde_json::json!({
        "months": v.months,
        "days": v.days,
        "microseconds": v.microseconds,
    })
}
