//! Column metadata and schema rendering.
//!
//! Tables declare their schema by populating a [`Columns`] set inside
//! their `configure` hook. Each [`Column`] carries a semantic type, a
//! nullable flag, an optional default, an optional foreign-key
//! relation, and the two transport flags (`json_encoded`, `encrypted`)
//! the table layer acts on.

use serde_json::Value;

/// Semantic column types mapped to SQL by the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Integer,
    String,
    Boolean,
    Timestamp,
}

impl ColType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColType::Integer => "INTEGER",
            ColType::String => "TEXT",
            ColType::Boolean => "BOOLEAN",
            ColType::Timestamp => "TIMESTAMP",
        }
    }
}

/// Column default: a literal or a server-side marker.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    Value(Value),
    CurrentTimestamp,
}

/// Foreign-key reference to another table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub table: String,
    pub column: String,
    /// Whether a FOREIGN KEY constraint is emitted in CREATE TABLE.
    pub enforced: bool,
}

/// Metadata for a single column.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ctype: ColType,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
    pub relation: Option<Relation>,
    /// In-memory value is a structured map/list; storage serializes it.
    pub json_encoded: bool,
    /// Storage bytes are wrapped with authenticated encryption.
    pub encrypted: bool,
}

impl Column {
    fn new(name: &str, ctype: ColType) -> Self {
        Self {
            name: name.to_string(),
            ctype,
            nullable: true,
            default: None,
            relation: None,
            json_encoded: false,
            encrypted: false,
        }
    }

    pub fn not_null(&mut self) -> &mut Self {
        self.nullable = false;
        self
    }

    pub fn default_value(&mut self, value: Value) -> &mut Self {
        self.default = Some(ColumnDefault::Value(value));
        self
    }

    pub fn default_current_timestamp(&mut self) -> &mut Self {
        self.default = Some(ColumnDefault::CurrentTimestamp);
        self
    }

    /// Declare a foreign key to `table(column)` with an emitted constraint.
    pub fn relation(&mut self, table: &str, column: &str) -> &mut Self {
        self.relation = Some(Relation {
            table: table.to_string(),
            column: column.to_string(),
            enforced: true,
        });
        self
    }

    /// Declare a logical relation without a SQL constraint.
    pub fn soft_relation(&mut self, table: &str, column: &str) -> &mut Self {
        self.relation = Some(Relation {
            table: table.to_string(),
            column: column.to_string(),
            enforced: false,
        });
        self
    }

    pub fn json_encoded(&mut self) -> &mut Self {
        self.json_encoded = true;
        self
    }

    pub fn encrypted(&mut self) -> &mut Self {
        self.encrypted = true;
        self
    }

    /// Render the column definition for CREATE TABLE / ADD COLUMN.
    pub fn to_sql(&self, primary_key: bool) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.ctype.sql());
        if primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        match &self.default {
            Some(ColumnDefault::CurrentTimestamp) => sql.push_str(" DEFAULT CURRENT_TIMESTAMP"),
            Some(ColumnDefault::Value(value)) => {
                sql.push_str(" DEFAULT ");
                sql.push_str(&render_default(value));
            }
            None => {}
        }
        sql
    }
}

/// Render a default literal. Only used for programmer-declared schema
/// defaults, never for request values.
fn render_default(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Ordered column set for one table.
#[derive(Debug, Clone, Default)]
pub struct Columns {
    cols: Vec<Column>,
}

impl Columns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a column, returning it for fluent configuration.
    pub fn column(&mut self, name: &str, ctype: ColType) -> &mut Column {
        self.cols.push(Column::new(name, ctype));
        self.cols.last_mut().expect("column just pushed")
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.cols.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.cols.iter()
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// Names of columns flagged `json_encoded`.
    pub fn json_columns(&self) -> Vec<&str> {
        self.cols
            .iter()
            .filter(|c| c.json_encoded)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Names of columns flagged `encrypted`.
    pub fn encrypted_columns(&self) -> Vec<&str> {
        self.cols
            .iter()
            .filter(|c| c.encrypted)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Tables this table references through enforced relations.
    pub fn relation_targets(&self) -> Vec<&str> {
        self.cols
            .iter()
            .filter_map(|c| c.relation.as_ref())
            .filter(|r| r.enforced)
            .map(|r| r.table.as_str())
            .collect()
    }
}
