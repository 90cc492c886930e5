//! Value normalization shared by the adapters.
//!
//! Backends without native boolean/timestamp types (or schemas that
//! store booleans in integer columns) normalize fetched values by
//! column-name heuristics so application code sees the same shapes on
//! every backend:
//!
//! - names starting `is_`/`use_`/`has_` or equal to `active`/
//!   `enabled`/`ssl`/`tls`: integer 0/1 coerces to a boolean;
//! - names ending `_at`/`_date`/`_time` or equal to `created`/
//!   `updated`/`timestamp`/`expires`: ISO-8601 strings coerce to
//!   canonical RFC 3339.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use gproxy_core::Record;
use serde_json::Value;

const BOOL_PREFIXES: [&str; 3] = ["is_", "use_", "has_"];
const BOOL_NAMES: [&str; 4] = ["active", "enabled", "ssl", "tls"];
const TIMESTAMP_SUFFIXES: [&str; 3] = ["_at", "_date", "_time"];
const TIMESTAMP_NAMES: [&str; 4] = ["created", "updated", "timestamp", "expires"];

/// True when a column name looks boolean.
pub(crate) fn is_bool_column(name: &str) -> bool {
    BOOL_PREFIXES.iter().any(|p| name.starts_with(p)) || BOOL_NAMES.contains(&name)
}

/// True when a column name looks like a timestamp.
pub(crate) fn is_timestamp_column(name: &str) -> bool {
    TIMESTAMP_SUFFIXES.iter().any(|s| name.ends_with(s)) || TIMESTAMP_NAMES.contains(&name)
}

/// Parse the timestamp shapes the backends produce into RFC 3339.
pub(crate) fn canonicalize_timestamp(text: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    // CURRENT_TIMESTAMP renders as "YYYY-MM-DD HH:MM:SS" in UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    None
}

/// Apply boolean and timestamp normalization to a fetched row.
pub(crate) fn normalize_row(mut row: Record) -> Record {
    for (name, value) in row.iter_mut() {
        match value {
            Value::Number(n) if is_bool_column(name) => {
                if let Some(i) = n.as_i64() {
                    if i == 0 || i == 1 {
                        *value = Value::Bool(i == 1);
                    }
                }
            }
            Value::String(s) if is_timestamp_column(name) => {
                if let Some(canonical) = canonicalize_timestamp(s) {
                    *value = Value::String(canonical);
                }
            }
            _ => {}
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_boolean_normalization_by_name() {
        let row = record(&[
            ("active", json!(1)),
            ("is_admin", json!(0)),
            ("use_tls", json!(1)),
            ("count", json!(1)),
            ("active_label", json!(1)),
        ]);
        let normalized = normalize_row(row);
        assert_eq!(normalized.get("active").unwrap(), &json!(true));
        assert_eq!(normalized.get("is_admin").unwrap(), &json!(false));
        assert_eq!(normalized.get("use_tls").unwrap(), &json!(true));
        // Non-boolean names keep their integers.
        assert_eq!(normalized.get("count").unwrap(), &json!(1));
        assert_eq!(normalized.get("active_label").unwrap(), &json!(1));
    }

    #[test]
    fn test_out_of_range_integers_untouched() {
        let row = record(&[("active", json!(2))]);
        let normalized = normalize_row(row);
        assert_eq!(normalized.get("active").unwrap(), &json!(2));
    }

    #[test]
    fn test_timestamp_normalization_by_name() {
        let row = record(&[
            ("created_at", json!("2024-06-01 08:30:00")),
            ("updated", json!("2024-06-01T08:30:00+02:00")),
            ("name", json!("2024-06-01 08:30:00")),
            ("expires_at", json!("not a date")),
        ]);
        let normalized = normalize_row(row);
        assert_eq!(
            normalized.get("created_at").unwrap(),
            &json!("2024-06-01T08:30:00Z")
        );
        assert_eq!(
            normalized.get("updated").unwrap(),
            &json!("2024-06-01T06:30:00Z")
        );
        // Non-timestamp names and unparseable values are untouched.
        assert_eq!(
            normalized.get("name").unwrap(),
            &json!("2024-06-01 08:30:00")
        );
        assert_eq!(normalized.get("expires_at").unwrap(), &json!("not a date"));
    }

    #[test]
    fn test_date_only_values() {
        let row = record(&[("start_date", json!("2024-06-01"))]);
        let normalized = normalize_row(row);
        assert_eq!(
            normalized.get("start_date").unwrap(),
            &json!("2024-06-01T00:00:00Z")
        );
    }
}
