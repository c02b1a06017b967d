//! Row mapping: raw source fields into typed mirror values.
//!
//! Every null/blank convention of the source is resolved here, once, so the
//! upsert engine only ever sees [`MirrorValue`]s that match the column types.

use crate::config::{ColumnSpec, StreamConfig};
use crate::schema::ColumnType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use duckdb::types::{ToSql, ToSqlOutput, Value};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// One source row as returned by the connector: column name to raw value.
pub type SourceRow = HashMap<String, JsonValue>;

/// A normalized value ready to be bound into a mirror statement.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorValue {
    /// SQL NULL
    Null,
    /// Trimmed text
    Text(String),
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Exact decimal, kept as plain numeric text
    Decimal(String),
    /// Calendar date
    Date(NaiveDate),
    /// Timestamp (UTC when the source carried an offset)
    Timestamp(NaiveDateTime),
}

impl MirrorValue {
    /// Whether the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, MirrorValue::Null)
    }

    /// Whether the value can serve as part of a natural key.
    fn identifies(&self) -> bool {
        match self {
            MirrorValue::Null => false,
            MirrorValue::Text(s) => !s.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for MirrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorValue::Null => write!(f, "NULL"),
            MirrorValue::Text(s) => write!(f, "{}", s),
            MirrorValue::Bool(b) => write!(f, "{}", b),
            MirrorValue::Int(i) => write!(f, "{}", i),
            MirrorValue::Float(v) => write!(f, "{}", v),
            MirrorValue::Decimal(d) => write!(f, "{}", d),
            MirrorValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            MirrorValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.6f")),
        }
    }
}

impl ToSql for MirrorValue {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let value = match self {
            MirrorValue::Null => Value::Null,
            MirrorValue::Text(s) => Value::Text(s.clone()),
            MirrorValue::Bool(b) => Value::Boolean(*b),
            MirrorValue::Int(i) => Value::BigInt(*i),
            MirrorValue::Float(v) => Value::Double(*v),
            MirrorValue::Decimal(d) => Value::Text(d.clone()),
            // DuckDB casts the literal to the DATE / TIMESTAMP parameter type
            MirrorValue::Date(_) | MirrorValue::Timestamp(_) => Value::Text(self.to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// One logical record in mirror shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    /// Natural key values, in the stream's natural key order
    pub key: Vec<MirrorValue>,
    /// Mutable column values, in declaration order
    pub values: Vec<MirrorValue>,
}

/// Result of mapping one fetched batch.
#[derive(Debug, Clone, Default)]
pub struct MappedBatch {
    /// Rows ready for upsert, in source-read order
    pub rows: Vec<MirrorRow>,
    /// Rows fetched from the source
    pub fetched: usize,
    /// Rows dropped because the natural key could not be resolved
    pub skipped: usize,
    /// Values coerced to null because they could not be parsed
    pub coerced: usize,
    /// Highest parsed source timestamp in the batch
    pub max_timestamp: Option<NaiveDateTime>,
}

/// Outcome of normalizing one raw value.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A usable value (possibly null)
    Value(MirrorValue),
    /// The raw value could not be parsed as the column type
    Unparsable,
}

/// Map a fetched batch for `stream`.
pub fn map_batch(stream: &StreamConfig, rows: &[SourceRow]) -> MappedBatch {
    let mut batch = MappedBatch {
        fetched: rows.len(),
        ..Default::default()
    };

    if let Some(first) = rows.first() {
        for spec in &stream.columns {
            if lookup(first, spec.source_name()).is_none() {
                warn!(
                    stream = %stream.key,
                    column = spec.source_name(),
                    "source rows do not carry this column; values will be null"
                );
            }
        }
    }

    let key_specs: Vec<&ColumnSpec> = stream
        .natural_key
        .iter()
        .filter_map(|name| stream.column(name))
        .collect();
    let mutable_specs: Vec<&ColumnSpec> = stream.mutable_columns().collect();

    'rows: for (index, raw) in rows.iter().enumerate() {
        let mut key = Vec::with_capacity(key_specs.len());
        for spec in &key_specs {
            let value = map_field(stream, spec, raw, index, &mut batch.coerced);
            if !value.identifies() {
                if let Some(fill) = &spec.key_null_as {
                    key.push(MirrorValue::Text(fill.clone()));
                    continue;
                }
                warn!(
                    stream = %stream.key,
                    row = index,
                    column = %spec.name,
                    "natural key incomplete; row skipped"
                );
                batch.skipped += 1;
                continue 'rows;
            }
            key.push(value);
        }

        let values = mutable_specs
            .iter()
            .map(|spec| map_field(stream, spec, raw, index, &mut batch.coerced))
            .collect();

        batch.rows.push(MirrorRow { key, values });
    }

    // skipped rows still count toward the watermark candidate
    batch.max_timestamp = stream.timestamp_column.as_deref().and_then(|col| {
        rows.iter()
            .filter_map(|raw| lookup(raw, col).and_then(timestamp_of))
            .max()
    });

    debug!(
        stream = %stream.key,
        fetched = batch.fetched,
        mapped = batch.rows.len(),
        skipped = batch.skipped,
        coerced = batch.coerced,
        "mapped batch"
    );
    batch
}

fn map_field(
    stream: &StreamConfig,
    spec: &ColumnSpec,
    raw: &SourceRow,
    index: usize,
    coerced: &mut usize,
) -> MirrorValue {
    let input = lookup(raw, spec.source_name());
    let value = match normalize(input, spec, &stream.null_sentinels) {
        Normalized::Value(v) => v,
        Normalized::Unparsable => {
            *coerced += 1;
            warn!(
                stream = %stream.key,
                row = index,
                column = %spec.name,
                raw = %input.map(|v| v.to_string()).unwrap_or_default(),
                expected = ?spec.column_type,
                "unparsable value coerced to null"
            );
            MirrorValue::Null
        }
    };

    if value.is_null() {
        if let Some(default) = &spec.default {
            let fallback = JsonValue::String(default.clone());
            if let Normalized::Value(v) = normalize(Some(&fallback), spec, &[]) {
                return v;
            }
        }
    }
    value
}

/// Find a column by exact name, falling back to a case-insensitive match.
pub fn lookup<'a>(row: &'a SourceRow, name: &str) -> Option<&'a JsonValue> {
    row.get(name).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// Normalize one raw value for a column.
pub fn normalize(raw: Option<&JsonValue>, spec: &ColumnSpec, sentinels: &[String]) -> Normalized {
    let raw = match raw {
        None | Some(JsonValue::Null) => return Normalized::Value(MirrorValue::Null),
        Some(v) => v,
    };

    if let JsonValue::String(s) = raw {
        let trimmed = s.trim();
        if sentinels.iter().any(|n| n == trimmed) {
            return Normalized::Value(MirrorValue::Null);
        }
        if trimmed.is_empty() && (spec.nullable || spec.column_type != ColumnType::Text) {
            return Normalized::Value(MirrorValue::Null);
        }
    }

    let parsed = match spec.column_type {
        ColumnType::Text => Some(MirrorValue::Text(text_of(raw))),
        ColumnType::Boolean => bool_of(raw).map(MirrorValue::Bool),
        ColumnType::Integer => int_of(raw).map(MirrorValue::Int),
        ColumnType::Double => float_of(raw).map(MirrorValue::Float),
        ColumnType::Decimal => decimal_of(raw).map(MirrorValue::Decimal),
        ColumnType::Date => date_of(raw).map(MirrorValue::Date),
        ColumnType::CompactDate => date_of(raw).map(|d| MirrorValue::Text(compact_date(d))),
        ColumnType::Timestamp => timestamp_of(raw).map(MirrorValue::Timestamp),
    };

    match parsed {
        Some(value) => Normalized::Value(value),
        None => Normalized::Unparsable,
    }
}

/// Format a date the way the source stores business dates.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

fn text_of(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Numeric text with thousands separators removed.
fn numeric_text(raw: &JsonValue) -> Option<String> {
    match raw {
        JsonValue::String(s) => Some(s.trim().replace(',', "")),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_of(raw: &JsonValue) -> Option<i64> {
    if let JsonValue::Number(n) = raw {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    let text = numeric_text(raw)?;
    if let Ok(i) = text.parse::<i64>() {
        return Some(i);
    }
    // integral decimals such as "12.00"
    let f = text.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn float_of(raw: &JsonValue) -> Option<f64> {
    if let JsonValue::Number(n) = raw {
        return n.as_f64();
    }
    numeric_text(raw)?
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
}

/// Plain decimal text (`-12.50`), bound as text so the mirror parses it exactly.
fn decimal_of(raw: &JsonValue) -> Option<String> {
    if let JsonValue::Number(n) = raw {
        return match n.as_i64() {
            Some(i) => Some(i.to_string()),
            // f64 Display never uses exponent notation
            None => n.as_f64().filter(|f| f.is_finite()).map(|f| f.to_string()),
        };
    }
    let text = numeric_text(raw)?;
    let digits = text.strip_prefix(['-', '+']).unwrap_or(&text);
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    let plain = !(whole.is_empty() && fraction.is_empty())
        && whole.chars().all(|c| c.is_ascii_digit())
        && fraction.chars().all(|c| c.is_ascii_digit());
    plain.then_some(text)
}

fn bool_of(raw: &JsonValue) -> Option<bool> {
    match raw {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "y" | "yes" => Some(true),
            "false" | "f" | "0" | "n" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn date_of(raw: &JsonValue) -> Option<NaiveDate> {
    let text = match raw {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };

    let digits: String = text.chars().filter(|c| *c != ',').collect();
    if digits.len() == 8 && digits.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(&digits, "%Y%m%d").ok();
    }
    if let Ok(d) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return Some(d);
    }
    parse_timestamp(&text).map(|ts| ts.date())
}

/// Parse a timestamp from a raw source value.
pub fn timestamp_of(raw: &JsonValue) -> Option<NaiveDateTime> {
    match raw {
        JsonValue::String(s) => parse_timestamp(s.trim()),
        _ => None,
    }
}

/// Parse the timestamp encodings the source is known to produce.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f%#z",
        "%Y%m%d%H%M%S",
    ];
    for format in FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc).naive_utc());
        }
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnSpec, production_plan_stream, production_result_stream};
    use serde_json::json;

    fn row(pairs: &[(&str, JsonValue)]) -> SourceRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn plan_row(item: &str, date: &str, qty: JsonValue) -> SourceRow {
        row(&[
            ("faccd", json!("F1")),
            ("grpcd", json!("  G01 ")),
            ("setsubicd", json!("LINE-A")),
            ("asetsubicd", json!("")),
            ("itemcd", json!(item)),
            ("kanban", json!(null)),
            ("st", json!("45")),
            ("d_ymd", json!(date)),
            ("d_ym", json!("202501")),
            ("d_d", json!("15")),
            ("qty", qty),
        ])
    }

    #[test]
    fn test_strings_trimmed_and_blank_to_null() {
        let stream = production_plan_stream();
        let batch = map_batch(&stream, &[plan_row("ITEM-1", "20250115", json!(120))]);
        let mapped = &batch.rows[0];

        // mutable order: grpcd, asetsubicd, kanban, st, d_ym, d_d, qty
        assert_eq!(mapped.values[0], MirrorValue::Text("G01".into()));
        assert_eq!(mapped.values[1], MirrorValue::Null);
        assert_eq!(mapped.values[2], MirrorValue::Null);
        assert_eq!(mapped.values[3], MirrorValue::Int(45));
        assert_eq!(mapped.values[6], MirrorValue::Int(120));
        assert_eq!(batch.coerced, 0);
    }

    #[test]
    fn test_unparsable_number_coerced_not_fatal() {
        let stream = production_plan_stream();
        let batch = map_batch(&stream, &[plan_row("ITEM-1", "20250115", json!("12x"))]);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].values[6], MirrorValue::Null);
        assert_eq!(batch.coerced, 1);
    }

    #[test]
    fn test_compact_date_separators_removed() {
        let stream = production_plan_stream();
        let batch = map_batch(&stream, &[plan_row("ITEM-1", "20,250,115", json!(1))]);
        assert_eq!(batch.rows[0].key[3], MirrorValue::Text("20250115".into()));
    }

    #[test]
    fn test_incomplete_key_skips_row() {
        let stream = production_plan_stream();
        let rows = vec![
            plan_row("ITEM-1", "20250115", json!(1)),
            plan_row("   ", "20250115", json!(2)),
            plan_row("ITEM-3", "not-a-date", json!(3)),
        ];
        let batch = map_batch(&stream, &rows);
        assert_eq!(batch.fetched, 3);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_default_applies_to_missing_shift() {
        let stream = production_result_stream();
        let raw = row(&[
            ("I_FAC_CD", json!("F1")),
            ("I_ACP_DATE", json!("20250115")),
            ("I_SHIFT", json!(null)),
            ("I_ST_TIME", json!("080000")),
            ("I_ITEM_CD", json!("ITEM-1")),
            ("I_DRW_NO", json!("DRW-9")),
            ("INSDATE", json!("2025-01-15 08:30:00")),
        ]);
        let batch = map_batch(&stream, &[raw]);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].key[2], MirrorValue::Int(1));
        assert_eq!(
            batch.max_timestamp,
            parse_timestamp("2025-01-15 08:30:00")
        );
    }

    #[test]
    fn test_max_timestamp_ignores_absent_values() {
        let stream = production_result_stream();
        let mk = |st: &str, ins: JsonValue| {
            row(&[
                ("i_fac_cd", json!("F1")),
                ("i_acp_date", json!("20250115")),
                ("i_shift", json!(2)),
                ("i_st_time", json!(st)),
                ("i_item_cd", json!("ITEM-1")),
                ("i_drw_no", json!("DRW-9")),
                ("insdate", ins),
            ])
        };
        let batch = map_batch(
            &stream,
            &[
                mk("080000", json!("2025-01-15 08:00:00")),
                mk("090000", json!(null)),
                mk("100000", json!("2025-01-15T10:00:00")),
                mk("110000", json!("garbage")),
            ],
        );
        assert_eq!(batch.rows.len(), 4);
        assert_eq!(batch.max_timestamp, parse_timestamp("2025-01-15 10:00:00"));
    }

    #[test]
    fn test_result_key_accepts_missing_item_and_drawing() {
        let stream = production_result_stream();
        let raw = row(&[
            ("i_fac_cd", json!("F1")),
            ("i_acp_date", json!("20250115")),
            ("i_shift", json!(2)),
            ("i_st_time", json!("080000")),
            ("i_item_cd", json!("   ")),
            ("i_drw_no", json!(null)),
            ("insdate", json!("2025-01-15 08:30:00")),
        ]);
        let batch = map_batch(&stream, &[raw.clone()]);
        assert_eq!(batch.skipped, 0);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].key[4], MirrorValue::Text(String::new()));
        assert_eq!(batch.rows[0].key[5], MirrorValue::Text(String::new()));

        // other key parts stay mandatory
        let mut missing_fac = raw;
        missing_fac.insert("i_fac_cd".into(), json!(null));
        let batch = map_batch(&stream, &[missing_fac]);
        assert_eq!(batch.skipped, 1);
        assert!(batch.rows.is_empty());
    }

    #[test]
    fn test_null_sentinels() {
        let spec = ColumnSpec::new("kanban", ColumnType::Text);
        let sentinels = vec!["-".to_string(), "N/A".to_string()];
        assert_eq!(
            normalize(Some(&json!(" - ")), &spec, &sentinels),
            Normalized::Value(MirrorValue::Null)
        );
        assert_eq!(
            normalize(Some(&json!("K-1")), &spec, &sentinels),
            Normalized::Value(MirrorValue::Text("K-1".into()))
        );
    }

    #[test]
    fn test_required_text_keeps_empty_string() {
        let spec = ColumnSpec::new("note", ColumnType::Text).required();
        assert_eq!(
            normalize(Some(&json!("  ")), &spec, &[]),
            Normalized::Value(MirrorValue::Text(String::new()))
        );
    }

    #[test]
    fn test_numbers() {
        let int = ColumnSpec::new("qty", ColumnType::Integer);
        let dec = ColumnSpec::new("wk_time", ColumnType::Decimal);
        assert_eq!(
            normalize(Some(&json!("1,250")), &int, &[]),
            Normalized::Value(MirrorValue::Int(1250))
        );
        assert_eq!(
            normalize(Some(&json!("12.00")), &int, &[]),
            Normalized::Value(MirrorValue::Int(12))
        );
        assert_eq!(normalize(Some(&json!(12.5)), &int, &[]), Normalized::Unparsable);
        assert_eq!(
            normalize(Some(&json!("3.75")), &dec, &[]),
            Normalized::Value(MirrorValue::Decimal("3.75".into()))
        );
        assert_eq!(normalize(Some(&json!("NaN")), &dec, &[]), Normalized::Unparsable);
        assert_eq!(normalize(Some(&json!("1e3")), &dec, &[]), Normalized::Unparsable);
        assert_eq!(normalize(Some(&json!(".")), &dec, &[]), Normalized::Unparsable);
    }

    #[test]
    fn test_decimals_keep_exact_digits() {
        let dec = ColumnSpec::new("wk_time", ColumnType::Decimal);
        assert_eq!(
            normalize(Some(&json!("12,345,678.9012")), &dec, &[]),
            Normalized::Value(MirrorValue::Decimal("12345678.9012".into()))
        );
        assert_eq!(
            normalize(Some(&json!(-0.1)), &dec, &[]),
            Normalized::Value(MirrorValue::Decimal("-0.1".into()))
        );
        assert_eq!(
            normalize(Some(&json!(42)), &dec, &[]),
            Normalized::Value(MirrorValue::Decimal("42".into()))
        );

        let decimal = MirrorValue::Decimal("0.3".into());
        let bound = decimal.to_sql().unwrap();
        assert!(matches!(bound, ToSqlOutput::Owned(Value::Text(ref t)) if t == "0.3"));
    }

    #[test]
    fn test_timestamp_encodings() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2025-01-15 08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-01-15T08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("20250115083000"), Some(expected));
        assert_eq!(parse_timestamp("2025-01-15T15:30:00+07:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2025-01-15 08:30:00.250").map(|t| t.date()),
            Some(expected.date())
        );
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let raw = row(&[("QTY", json!(5))]);
        assert_eq!(lookup(&raw, "qty"), Some(&json!(5)));
        assert_eq!(lookup(&raw, "missing"), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn text_is_always_trimmed(s in ".{0,40}") {
                let spec = ColumnSpec::new("t", ColumnType::Text);
                match normalize(Some(&JsonValue::String(s.clone())), &spec, &[]) {
                    Normalized::Value(MirrorValue::Text(t)) => {
                        prop_assert_eq!(t.as_str(), s.trim());
                        prop_assert!(!t.is_empty());
                    }
                    Normalized::Value(MirrorValue::Null) => prop_assert!(s.trim().is_empty()),
                    other => prop_assert!(false, "unexpected {:?}", other),
                }
            }

            #[test]
            fn integers_round_trip_through_text(n in any::<i64>()) {
                let spec = ColumnSpec::new("n", ColumnType::Integer);
                prop_assert_eq!(
                    normalize(Some(&JsonValue::String(n.to_string())), &spec, &[]),
                    Normalized::Value(MirrorValue::Int(n))
                );
            }

            #[test]
            fn arbitrary_text_never_panics(s in "\\PC{0,30}") {
                for t in [ColumnType::Integer, ColumnType::Decimal, ColumnType::Date,
                          ColumnType::CompactDate, ColumnType::Timestamp, ColumnType::Boolean] {
                    let spec = ColumnSpec::new("c", t);
                    let _ = normalize(Some(&JsonValue::String(s.clone())), &spec, &[]);
                }
            }
        }
    }
}
