//! Terminal rendering of invocation results.
//!
//! A list of records renders as a table, a single record as key/value
//! pairs, anything else as-is.

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde_json::Value;

/// Render a value the way an operator wants to read it.
pub fn render(value: &Value) -> String {
    match value {
        Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => {
            render_table(items)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| format!("  • {}", scalar(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => map
            .iter()
            .map(|(key, val)| format!("{key}: {}", scalar(val)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => scalar(other),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_table(rows: &[Value]) -> String {
    let keys: Vec<&str> = rows[0]
        .as_object()
        .map(|map| map.keys().map(String::as_str).collect())
        .unwrap_or_default();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(keys.clone());
    for row in rows {
        let cells: Vec<String> = keys
            .iter()
            .map(|key| row.get(*key).map(scalar).unwrap_or_default())
            .collect();
        table.add_row(cells);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_record_key_value() {
        let rendered = render(&json!({"id": "acme", "active": true}));
        assert!(rendered.contains("id: acme"));
        assert!(rendered.contains("active: true"));
    }

    #[test]
    fn test_record_list_as_table() {
        let rendered = render(&json!([
            {"id": "a", "name": "One"},
            {"id": "b", "name": "Two"},
        ]));
        assert!(rendered.contains("id"));
        assert!(rendered.contains("One"));
        assert!(rendered.contains("Two"));
    }

    #[test]
    fn test_scalar_list_bullets() {
        let rendered = render(&json!(["x", "y"]));
        assert!(rendered.contains("• x"));
        assert!(rendered.contains("• y"));
    }

    #[test]
    fn test_plain_scalar() {
        assert_eq!(render(&json!(true)), "true");
        assert_eq!(render(&json!("done")), "done");
        assert_eq!(render(&Value::Null), "");
    }
}
