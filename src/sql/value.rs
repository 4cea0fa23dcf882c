//! Typed values bound for the destination database.

use bson::Bson;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;

/// One destination-bound value.
///
/// Produced by the schema transform from a BSON value and the declared SQL
/// type of the target column. Values travel to the destination in text form
/// (both for `COPY` payloads and casted statement parameters), so a value
/// which doesn't fit its declared column becomes a destination-side
/// rejection instead of a transform failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL, also used for fields absent from the document.
    Null,
    /// boolean column value.
    Bool(bool),
    /// integer column value.
    Int(i64),
    /// floating point column value.
    Double(f64),
    /// character column value, and the fallback rendering for everything
    /// which doesn't fit the declared column family.
    Text(String),
    /// timestamp column value.
    Timestamp(DateTime<Utc>),
    /// json column value, holds documents, arrays and `_extra_props`.
    Jsonb(serde_json::Value),
    /// bytea column value.
    Bytes(Vec<u8>),
}

/// Families of destination column types with distinct coercion rules.
enum TypeFamily {
    Text,
    Int,
    Float,
    Bool,
    Timestamp,
    Json,
    Bytes,
}

fn family_of(sql_type: &str) -> TypeFamily {
    let ty = sql_type.to_ascii_uppercase();
    if ty.contains("JSON") {
        TypeFamily::Json
    } else if ty.contains("BYTEA") {
        TypeFamily::Bytes
    } else if ty.contains("BOOL") {
        TypeFamily::Bool
    } else if ty.contains("TIMESTAMP") || ty.contains("DATE") {
        TypeFamily::Timestamp
    } else if ty.contains("DOUBLE")
        || ty.contains("REAL")
        || ty.contains("FLOAT")
        || ty.contains("NUMERIC")
        || ty.contains("DECIMAL")
    {
        TypeFamily::Float
    } else if ty.contains("INT") || ty.contains("SERIAL") {
        TypeFamily::Int
    } else {
        TypeFamily::Text
    }
}

impl SqlValue {
    /// Coerce a BSON value into the family of the declared column type.
    ///
    /// `None` (field absent) and `Bson::Null` become [SqlValue::Null].
    /// A value the family can't represent degrades to its text rendering,
    /// leaving the complaint to the destination.
    pub fn from_bson(value: Option<&Bson>, sql_type: &str) -> SqlValue {
        let value = match value {
            None | Some(Bson::Null) | Some(Bson::Undefined) => return SqlValue::Null,
            Some(v) => v,
        };

        match family_of(sql_type) {
            TypeFamily::Json => SqlValue::Jsonb(value.clone().into_relaxed_extjson()),
            TypeFamily::Bytes => match value {
                Bson::Binary(bin) => SqlValue::Bytes(bin.bytes.clone()),
                other => SqlValue::Text(text_of(other)),
            },
            TypeFamily::Bool => match value {
                Bson::Boolean(b) => SqlValue::Bool(*b),
                other => SqlValue::Text(text_of(other)),
            },
            TypeFamily::Timestamp => match value {
                Bson::DateTime(dt) => SqlValue::Timestamp(dt.to_chrono()),
                other => SqlValue::Text(text_of(other)),
            },
            TypeFamily::Float => match value {
                Bson::Double(d) => SqlValue::Double(*d),
                Bson::Int32(i) => SqlValue::Double(f64::from(*i)),
                Bson::Int64(i) => SqlValue::Double(*i as f64),
                other => SqlValue::Text(text_of(other)),
            },
            TypeFamily::Int => match value {
                Bson::Int32(i) => SqlValue::Int(i64::from(*i)),
                Bson::Int64(i) => SqlValue::Int(*i),
                Bson::Timestamp(ts) => SqlValue::Int(packed_timestamp(ts)),
                other => SqlValue::Text(text_of(other)),
            },
            TypeFamily::Text => SqlValue::Text(text_of(value)),
        }
    }

    /// Destination text form of the value, `None` meaning SQL NULL.
    pub fn as_sql_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(if *b { "t" } else { "f" }.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Double(d) => Some(d.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Timestamp(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()),
            SqlValue::Jsonb(v) => Some(v.to_string()),
            SqlValue::Bytes(bytes) => {
                let mut text = String::with_capacity(2 + bytes.len() * 2);
                text.push_str("\\x");
                for byte in bytes {
                    let _ = write!(text, "{:02x}", byte);
                }
                Some(text)
            }
        }
    }
}

/// the i64 the server packs a `Timestamp` into: seconds in the high half,
/// ordinal in the low half.
fn packed_timestamp(ts: &bson::Timestamp) -> i64 {
    ((ts.time as i64) << 32) | ts.increment as i64
}

fn text_of(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Symbol(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(d) => d.to_string(),
        Bson::Decimal128(d) => d.to_string(),
        Bson::DateTime(dt) => dt
            .to_chrono()
            .format("%Y-%m-%d %H:%M:%S%.6f+00")
            .to_string(),
        Bson::Timestamp(ts) => packed_timestamp(ts).to_string(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

/// Encode one row as a text-format `COPY` line, appended to `out`.
///
/// NULL is `\N`; backslash, tab, newline and carriage return are escaped so
/// a value can never break the row framing.
pub(crate) fn encode_copy_row(row: &[SqlValue], out: &mut String) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        match value.as_sql_text() {
            None => out.push_str("\\N"),
            Some(text) => {
                for ch in text.chars() {
                    match ch {
                        '\\' => out.push_str("\\\\"),
                        '\t' => out.push_str("\\t"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        _ => out.push(ch),
                    }
                }
            }
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::oid::ObjectId;
    use bson::{doc, Bson};

    #[test]
    fn test_coerce_by_declared_type() {
        let oid = ObjectId::new();
        assert_eq!(
            SqlValue::from_bson(Some(&Bson::ObjectId(oid)), "TEXT"),
            SqlValue::Text(oid.to_hex())
        );
        assert_eq!(
            SqlValue::from_bson(Some(&Bson::Int32(7)), "BIGINT"),
            SqlValue::Int(7)
        );
        assert_eq!(
            SqlValue::from_bson(Some(&Bson::Int32(7)), "DOUBLE PRECISION"),
            SqlValue::Double(7.0)
        );
        assert_eq!(
            SqlValue::from_bson(Some(&Bson::Boolean(true)), "BOOLEAN"),
            SqlValue::Bool(true)
        );
        assert_eq!(SqlValue::from_bson(None, "TEXT"), SqlValue::Null);
        assert_eq!(SqlValue::from_bson(Some(&Bson::Null), "INTEGER"), SqlValue::Null);

        let nested = doc! {"a": 1};
        match SqlValue::from_bson(Some(&Bson::Document(nested)), "JSONB") {
            SqlValue::Jsonb(v) => assert_eq!(v, serde_json::json!({"a": 1})),
            other => panic!("expected jsonb, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatch_degrades_to_text() {
        // a double with a fraction can't silently become an integer; keep
        // the text and let the destination decide.
        assert_eq!(
            SqlValue::from_bson(Some(&Bson::Double(3.5)), "INTEGER"),
            SqlValue::Text("3.5".to_string())
        );
        assert_eq!(
            SqlValue::from_bson(Some(&Bson::String("yes".into())), "BOOLEAN"),
            SqlValue::Text("yes".to_string())
        );
    }

    #[test]
    fn test_sql_text_rendering() {
        assert_eq!(SqlValue::Null.as_sql_text(), None);
        assert_eq!(SqlValue::Bool(true).as_sql_text(), Some("t".into()));
        assert_eq!(SqlValue::Bool(false).as_sql_text(), Some("f".into()));
        assert_eq!(SqlValue::Int(-4).as_sql_text(), Some("-4".into()));
        assert_eq!(
            SqlValue::Bytes(vec![0xde, 0xad]).as_sql_text(),
            Some("\\xdead".into())
        );
        assert_eq!(
            SqlValue::Jsonb(serde_json::json!({"a": [1, 2]})).as_sql_text(),
            Some("{\"a\":[1,2]}".into())
        );
    }

    #[test]
    fn test_copy_row_escaping() {
        let row = vec![
            SqlValue::Text("a\tb\nc\\d".to_string()),
            SqlValue::Null,
            SqlValue::Int(3),
        ];
        let mut line = String::new();
        encode_copy_row(&row, &mut line);
        assert_eq!(line, "a\\tb\\nc\\\\d\t\\N\t3\n");
    }

    #[test]
    fn test_packed_timestamp() {
        let ts = bson::Timestamp {
            time: 2,
            increment: 5,
        };
        assert_eq!(packed_timestamp(&ts), (2i64 << 32) | 5);
    }
}
