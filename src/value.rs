//! Typed PostgreSQL sink values and BSON conversions.
//!
//! Documents are schemaless, so every extracted field goes through a
//! conversion driven by the column's declared SQL type before it can be
//! bound as a query parameter or rendered for the COPY protocol. The
//! declared type tag is kept verbatim for DDL; conversions only look at
//! its [`SqlTypeFamily`].

use base64::Engine as _;
use bson::Bson;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use tokio_postgres::types::ToSql;

/// Coarse classification of a column's declared SQL type tag.
///
/// The tag itself ("TEXT", "TIMESTAMP", "NUMERIC(10,2)", ...) is emitted
/// verbatim into DDL; this family controls value conversion and parameter
/// binding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlTypeFamily {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Other,
}

impl SqlTypeFamily {
    /// Classify a declared type tag, ignoring case, length arguments and
    /// the WITH/WITHOUT TIME ZONE suffixes.
    pub fn classify(tag: &str) -> Self {
        let upper = tag.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim().to_string();
        let collapsed = base.split_whitespace().collect::<Vec<_>>().join(" ");

        match collapsed.as_str() {
            "BOOL" | "BOOLEAN" => SqlTypeFamily::Boolean,
            "SMALLINT" | "INT2" => SqlTypeFamily::SmallInt,
            "INT" | "INTEGER" | "INT4" => SqlTypeFamily::Integer,
            "BIGINT" | "INT8" => SqlTypeFamily::BigInt,
            "REAL" | "FLOAT4" => SqlTypeFamily::Real,
            "DOUBLE PRECISION" | "DOUBLE" | "FLOAT8" => SqlTypeFamily::Double,
            "NUMERIC" | "DECIMAL" => SqlTypeFamily::Numeric,
            "TEXT" | "VARCHAR" | "CHARACTER VARYING" | "CHAR" | "CHARACTER" => SqlTypeFamily::Text,
            "DATE" => SqlTypeFamily::Date,
            "TIME" | "TIME WITHOUT TIME ZONE" => SqlTypeFamily::Time,
            "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => SqlTypeFamily::Timestamp,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => SqlTypeFamily::TimestampTz,
            "JSON" | "JSONB" => SqlTypeFamily::Json,
            _ => SqlTypeFamily::Other,
        }
    }

    /// Whether values destined for this family are points in time.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            SqlTypeFamily::Date
                | SqlTypeFamily::Time
                | SqlTypeFamily::Timestamp
                | SqlTypeFamily::TimestampTz
        )
    }
}

/// PostgreSQL value wrapper for type-safe parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(Decimal),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl PgValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Box the value as a tokio-postgres parameter.
    ///
    /// Null needs the column's family so the bound `None` carries a Rust
    /// type the statement's parameter type accepts.
    pub fn into_param(self, family: SqlTypeFamily) -> Box<dyn ToSql + Sync + Send> {
        match self {
            PgValue::Null => null_param(family),
            PgValue::Bool(b) => Box::new(b),
            PgValue::Int16(i) => Box::new(i),
            PgValue::Int32(i) => Box::new(i),
            PgValue::Int64(i) => Box::new(i),
            PgValue::Float32(f) => Box::new(f),
            PgValue::Float64(f) => Box::new(f),
            PgValue::Numeric(d) => Box::new(d),
            PgValue::Text(s) => Box::new(s),
            PgValue::Date(d) => Box::new(d),
            PgValue::Time(t) => Box::new(t),
            PgValue::Timestamp(ts) => Box::new(ts),
            PgValue::TimestampTz(ts) => Box::new(ts),
            PgValue::Json(j) => Box::new(j),
        }
    }
}

fn null_param(family: SqlTypeFamily) -> Box<dyn ToSql + Sync + Send> {
    match family {
        SqlTypeFamily::Boolean => Box::new(None::<bool>),
        SqlTypeFamily::SmallInt => Box::new(None::<i16>),
        SqlTypeFamily::Integer => Box::new(None::<i32>),
        SqlTypeFamily::BigInt => Box::new(None::<i64>),
        SqlTypeFamily::Real => Box::new(None::<f32>),
        SqlTypeFamily::Double => Box::new(None::<f64>),
        SqlTypeFamily::Numeric => Box::new(None::<Decimal>),
        SqlTypeFamily::Date => Box::new(None::<NaiveDate>),
        SqlTypeFamily::Time => Box::new(None::<NaiveTime>),
        SqlTypeFamily::Timestamp => Box::new(None::<NaiveDateTime>),
        SqlTypeFamily::TimestampTz => Box::new(None::<DateTime<Utc>>),
        SqlTypeFamily::Json => Box::new(None::<serde_json::Value>),
        SqlTypeFamily::Text | SqlTypeFamily::Other => Box::new(None::<String>),
    }
}

/// Convert one resolved BSON value into a sink value for a column of the
/// given family.
///
/// Opaque identifiers get the special treatment inherited from the source
/// data model: an ObjectId or binary blob aimed at a temporal column is
/// read as a creation timestamp (its first 4 bytes are a big-endian
/// 32-bit count of UNIX seconds); aimed anywhere else it is stringified.
/// Every other value kind passes through, sized to the declared family.
pub fn bson_to_pg(value: &Bson, family: SqlTypeFamily) -> PgValue {
    match value {
        Bson::Null | Bson::Undefined => PgValue::Null,
        Bson::Boolean(b) => PgValue::Bool(*b),
        Bson::Int32(i) => int_to_pg(*i as i64, family),
        Bson::Int64(i) => int_to_pg(*i, family),
        Bson::Double(f) => match family {
            SqlTypeFamily::Real => PgValue::Float32(*f as f32),
            SqlTypeFamily::Numeric => Decimal::from_f64_retain(*f)
                .map(PgValue::Numeric)
                .unwrap_or_else(|| PgValue::Text(f.to_string())),
            _ => PgValue::Float64(*f),
        },
        Bson::Decimal128(d) => {
            let text = d.to_string();
            match Decimal::from_str(&text) {
                Ok(d) => PgValue::Numeric(d),
                Err(_) => PgValue::Text(text),
            }
        }
        Bson::String(s) => PgValue::Text(s.clone()),
        Bson::DateTime(dt) => datetime_to_pg(dt.to_chrono(), family),
        Bson::Timestamp(ts) => match DateTime::from_timestamp(ts.time as i64, 0) {
            Some(dt) => datetime_to_pg(dt, family),
            None => PgValue::Null,
        },
        Bson::ObjectId(oid) => {
            if family.is_temporal() {
                opaque_to_temporal(&oid.bytes(), family)
            } else {
                PgValue::Text(oid.to_hex())
            }
        }
        Bson::Binary(bin) => {
            if family.is_temporal() {
                opaque_to_temporal(&bin.bytes, family)
            } else {
                PgValue::Text(base64::engine::general_purpose::STANDARD.encode(&bin.bytes))
            }
        }
        Bson::Array(_) | Bson::Document(_) => {
            let json = value.clone().into_relaxed_extjson();
            match family {
                SqlTypeFamily::Json => PgValue::Json(json),
                _ => PgValue::Text(json.to_string()),
            }
        }
        other => {
            // Regex, JavaScript code and the other exotic kinds have no
            // relational shape; their extended-JSON rendering does.
            PgValue::Text(other.clone().into_relaxed_extjson().to_string())
        }
    }
}

fn int_to_pg(i: i64, family: SqlTypeFamily) -> PgValue {
    match family {
        SqlTypeFamily::SmallInt => PgValue::Int16(i as i16),
        SqlTypeFamily::Integer => PgValue::Int32(i as i32),
        SqlTypeFamily::BigInt => PgValue::Int64(i),
        SqlTypeFamily::Real => PgValue::Float32(i as f32),
        SqlTypeFamily::Double => PgValue::Float64(i as f64),
        SqlTypeFamily::Numeric => PgValue::Numeric(Decimal::from(i)),
        SqlTypeFamily::Text => PgValue::Text(i.to_string()),
        _ => {
            if i32::try_from(i).is_ok() {
                PgValue::Int32(i as i32)
            } else {
                PgValue::Int64(i)
            }
        }
    }
}

fn datetime_to_pg(dt: DateTime<Utc>, family: SqlTypeFamily) -> PgValue {
    match family {
        SqlTypeFamily::TimestampTz => PgValue::TimestampTz(dt),
        SqlTypeFamily::Timestamp => PgValue::Timestamp(dt.naive_utc()),
        SqlTypeFamily::Date => PgValue::Date(dt.date_naive()),
        SqlTypeFamily::Time => PgValue::Time(dt.time()),
        // A datetime aimed at a non-temporal column is rendered as text.
        _ => PgValue::Text(dt.to_rfc3339()),
    }
}

fn opaque_to_temporal(bytes: &[u8], family: SqlTypeFamily) -> PgValue {
    if bytes.len() < 4 {
        return PgValue::Null;
    }
    let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    match DateTime::from_timestamp(secs as i64, 0) {
        Some(dt) => datetime_to_pg(dt, family),
        None => PgValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_families() {
        assert_eq!(SqlTypeFamily::classify("TEXT"), SqlTypeFamily::Text);
        assert_eq!(SqlTypeFamily::classify("varchar(255)"), SqlTypeFamily::Text);
        assert_eq!(SqlTypeFamily::classify("INTEGER"), SqlTypeFamily::Integer);
        assert_eq!(SqlTypeFamily::classify("BIGINT"), SqlTypeFamily::BigInt);
        assert_eq!(
            SqlTypeFamily::classify("DOUBLE PRECISION"),
            SqlTypeFamily::Double
        );
        assert_eq!(
            SqlTypeFamily::classify("NUMERIC(10, 2)"),
            SqlTypeFamily::Numeric
        );
        assert_eq!(
            SqlTypeFamily::classify("TIMESTAMP"),
            SqlTypeFamily::Timestamp
        );
        assert_eq!(
            SqlTypeFamily::classify("timestamp with time zone"),
            SqlTypeFamily::TimestampTz
        );
        assert_eq!(SqlTypeFamily::classify("JSONB"), SqlTypeFamily::Json);
        assert_eq!(SqlTypeFamily::classify("MONEY"), SqlTypeFamily::Other);
    }

    #[test]
    fn test_temporal_families() {
        assert!(SqlTypeFamily::Timestamp.is_temporal());
        assert!(SqlTypeFamily::Date.is_temporal());
        assert!(!SqlTypeFamily::Text.is_temporal());
        assert!(!SqlTypeFamily::BigInt.is_temporal());
    }

    #[test]
    fn test_object_id_stringifies_for_text() {
        let oid = bson::oid::ObjectId::from_bytes([
            0x5f, 0x00, 0x00, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0x01, 0x02, 0x03, 0x04,
        ]);
        let v = bson_to_pg(&Bson::ObjectId(oid), SqlTypeFamily::Text);
        assert_eq!(v, PgValue::Text("5f000000aabbccdd01020304".to_string()));
    }

    #[test]
    fn test_object_id_decodes_for_timestamp() {
        // First 4 bytes big-endian: 0x5f000000 = 1593835520 UNIX seconds.
        let oid = bson::oid::ObjectId::from_bytes([
            0x5f, 0x00, 0x00, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0x01, 0x02, 0x03, 0x04,
        ]);
        let v = bson_to_pg(&Bson::ObjectId(oid), SqlTypeFamily::Timestamp);
        let expected = DateTime::from_timestamp(0x5f000000, 0).unwrap().naive_utc();
        assert_eq!(v, PgValue::Timestamp(expected));
    }

    #[test]
    fn test_binary_decodes_for_timestamp() {
        let bin = bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: vec![0x00, 0x00, 0x00, 0x01, 0xff],
        };
        let v = bson_to_pg(&Bson::Binary(bin), SqlTypeFamily::TimestampTz);
        assert_eq!(
            v,
            PgValue::TimestampTz(DateTime::from_timestamp(1, 0).unwrap())
        );
    }

    #[test]
    fn test_int_sizing_follows_declared_family() {
        assert_eq!(
            bson_to_pg(&Bson::Int64(7), SqlTypeFamily::Integer),
            PgValue::Int32(7)
        );
        assert_eq!(
            bson_to_pg(&Bson::Int32(7), SqlTypeFamily::BigInt),
            PgValue::Int64(7)
        );
        assert_eq!(
            bson_to_pg(&Bson::Int32(7), SqlTypeFamily::Text),
            PgValue::Text("7".to_string())
        );
    }

    #[test]
    fn test_nested_document_renders_as_json_text() {
        let doc = bson::doc! { "a": 1, "b": "x" };
        let v = bson_to_pg(&Bson::Document(doc), SqlTypeFamily::Text);
        match v {
            PgValue::Text(s) => {
                let parsed: serde_json::Value = serde_json::from_str(&s).unwrap();
                assert_eq!(parsed["a"], 1);
                assert_eq!(parsed["b"], "x");
            }
            other => panic!("expected text, got {other:?}"),
        }
    }
}
