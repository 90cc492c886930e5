//! Fluent query builder with named predicates.
//!
//! A [`Query`] accepts either a simple equality map (implicit AND) or a
//! free-form boolean expression over named predicates: `$name` tokens
//! in the expression are replaced in place by the SQL rendering of the
//! corresponding [`Condition`], with freshly generated parameter names.
//! Values of the form `":param"` bind to external parameters supplied
//! alongside the expression.
//!
//! Compound `update`/`delete` have a raw form (single statement, no
//! triggers) and a default form (select the matching rows, then
//! per-row operations with the full trigger and encoding chain).

use gproxy_core::{ProxyError, Record, Result};
use serde_json::Value;
use std::collections::HashMap;

use crate::table::Table;

/// The closed operator set for named predicates.
const OPERATORS: [&str; 16] = [
    "=", "!=", "<>", "<", ">", "<=", ">=", "LIKE", "ILIKE", "NOT LIKE", "NOT ILIKE", "IN",
    "NOT IN", "IS NULL", "IS NOT NULL", "BETWEEN",
];

/// A named predicate: column, operator, optional value.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: String,
    pub value: Option<Value>,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            column: column.into(),
            op: op.into(),
            value,
        }
    }

    /// Parse a `{column, op, value}` map. Returns `None` without a
    /// `column` key.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let column = map.get("column")?.as_str()?.to_string();
        let op = map
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("=")
            .to_string();
        Some(Self {
            column,
            op,
            value: map.get("value").cloned(),
        })
    }
}

/// Parse predicate kwargs into named conditions.
///
/// Two equivalent styles are accepted:
/// - map style: `a` → `{column, op, value}` object
/// - flattened: `a_column`, `a_op`, `a_value`
///
/// Flattened entries without a `column` part are ignored.
pub fn parse_where_kwargs(kwargs: &Record) -> HashMap<String, Condition> {
    let mut conditions: HashMap<String, Condition> = HashMap::new();
    let mut flat: HashMap<String, Record> = HashMap::new();

    for (key, value) in kwargs {
        if value
            .as_object()
            .is_some_and(|map| map.contains_key("column"))
        {
            if let Some(cond) = Condition::from_value(value) {
                conditions.insert(key.clone(), cond);
            }
        } else if let Some((cond_name, field)) = key.split_once('_') {
            flat.entry(cond_name.to_string())
                .or_default()
                .insert(field.to_string(), value.clone());
        }
    }

    for (name, fields) in flat {
        if let Some(column) = fields.get("column").and_then(Value::as_str) {
            conditions.insert(
                name,
                Condition {
                    column: column.to_string(),
                    op: fields
                        .get("op")
                        .and_then(Value::as_str)
                        .unwrap_or("=")
                        .to_string(),
                    value: fields.get("value").cloned(),
                },
            );
        }
    }

    conditions
}

/// WHERE clause specification.
#[derive(Debug, Clone)]
pub enum WhereSpec {
    /// Simple equality map, joined with AND.
    Map(Record),
    /// Expression over named predicates, e.g. `"$a AND NOT $b"`.
    Expr(String),
}

/// Renders WHERE clauses from specs and named conditions.
pub(crate) struct WhereBuilder<'a> {
    table: &'a Table,
}

impl<'a> WhereBuilder<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        Self { table }
    }

    fn placeholder(&self, name: &str) -> String {
        self.table.db().adapter().placeholder(name)
    }

    /// Build the WHERE SQL and its bind parameters.
    pub(crate) fn build(
        &self,
        where_: Option<&WhereSpec>,
        conditions: &HashMap<String, Condition>,
        params: &Record,
    ) -> Result<(String, Record)> {
        match where_ {
            None => Ok((String::new(), Record::new())),
            Some(WhereSpec::Map(map)) => Ok(self.build_simple(map)),
            Some(WhereSpec::Expr(expr)) => self.build_expression(expr, conditions, params),
        }
    }

    fn build_simple(&self, where_: &Record) -> (String, Record) {
        if where_.is_empty() {
            return (String::new(), Record::new());
        }
        let mut parts = Vec::with_capacity(where_.len());
        let mut params = Record::new();
        for (col, value) in where_ {
            let param = format!("w_{col}");
            parts.push(format!("{col} = {}", self.placeholder(&param)));
            params.insert(param, value.clone());
        }
        (parts.join(" AND "), params)
    }

    fn build_expression(
        &self,
        expr: &str,
        conditions: &HashMap<String, Condition>,
        external: &Record,
    ) -> Result<(String, Record)> {
        let mut params = external.clone();
        let mut sql = String::with_capacity(expr.len());
        let chars: Vec<char> = expr.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] == '$' {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().collect();
                let cond = conditions.get(&name).ok_or_else(|| {
                    ProxyError::configuration(format!("condition '{name}' not found"))
                })?;
                sql.push('(');
                sql.push_str(&self.condition_to_sql(cond, &name, &mut params)?);
                sql.push(')');
                i = j;
            } else {
                sql.push(chars[i]);
                i += 1;
            }
        }

        Ok((sql, params))
    }

    fn condition_to_sql(
        &self,
        cond: &Condition,
        name: &str,
        params: &mut Record,
    ) -> Result<String> {
        let column = &cond.column;
        let op = cond.op.to_uppercase();

        if !OPERATORS.contains(&op.as_str()) {
            return Err(ProxyError::configuration(format!(
                "operator '{op}' not supported"
            )));
        }

        if op == "IS NULL" || op == "IS NOT NULL" {
            return Ok(format!("{column} {op}"));
        }

        if op == "IN" || op == "NOT IN" {
            let Some(Value::Array(values)) = &cond.value else {
                return Err(ProxyError::configuration(format!(
                    "{op} requires a list value"
                )));
            };
            if values.is_empty() {
                // IN () is always false, NOT IN () always true.
                return Ok(if op == "IN" { "1=0" } else { "1=1" }.to_string());
            }
            let placeholders: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let param = format!("c_{name}_{i}");
                    let rendered = self.placeholder(&param);
                    params.insert(param, v.clone());
                    rendered
                })
                .collect();
            return Ok(format!("{column} {op} ({})", placeholders.join(", ")));
        }

        if op == "BETWEEN" {
            let bounds = match &cond.value {
                Some(Value::Array(values)) if values.len() == 2 => values,
                _ => {
                    return Err(ProxyError::configuration(
                        "BETWEEN requires a list of 2 elements [low, high]",
                    ))
                }
            };
            let low = format!("c_{name}_low");
            let high = format!("c_{name}_high");
            params.insert(low.clone(), bounds[0].clone());
            params.insert(high.clone(), bounds[1].clone());
            return Ok(format!(
                "{column} BETWEEN {} AND {}",
                self.placeholder(&low),
                self.placeholder(&high)
            ));
        }

        // ":param" references an external parameter.
        if let Some(Value::String(text)) = &cond.value {
            if let Some(param) = text.strip_prefix(':') {
                return Ok(format!("{column} {op} {}", self.placeholder(param)));
            }
        }

        let param = format!("c_{name}");
        let rendered = self.placeholder(&param);
        params.insert(param, cond.value.clone().unwrap_or(Value::Null));
        Ok(format!("{column} {op} {rendered}"))
    }
}

/// Fluent query over one table.
pub struct Query<'a> {
    table: &'a Table,
    columns: Option<Vec<String>>,
    where_: Option<WhereSpec>,
    conditions: HashMap<String, Condition>,
    params: Record,
    order_by: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    for_update: bool,
}

impl<'a> Query<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        Self {
            table,
            columns: None,
            where_: None,
            conditions: HashMap::new(),
            params: Record::new(),
            order_by: None,
            limit: None,
            offset: None,
            for_update: false,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(ToString::to_string).collect());
        self
    }

    /// Simple equality map (implicit AND).
    pub fn where_map(mut self, where_: Record) -> Self {
        self.where_ = Some(WhereSpec::Map(where_));
        self
    }

    /// Free-form boolean expression over named predicates.
    pub fn where_expr(mut self, expr: impl Into<String>) -> Self {
        self.where_ = Some(WhereSpec::Expr(expr.into()));
        self
    }

    /// Register a named predicate for `$name` references.
    pub fn condition(mut self, name: impl Into<String>, cond: Condition) -> Self {
        self.conditions.insert(name.into(), cond);
        self
    }

    /// Register predicates from `where_<name>` kwargs, both map style
    /// and flattened (`where_a_column`, `where_a_op`, `where_a_value`).
    pub fn where_kwargs(mut self, kwargs: &Record) -> Self {
        let stripped: Record = kwargs
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("where_")
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        self.conditions.extend(parse_where_kwargs(&stripped));
        self
    }

    /// Bind an external `:name` parameter.
    pub fn param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    fn build_where(&self) -> Result<(String, Record)> {
        WhereBuilder::new(self.table).build(self.where_.as_ref(), &self.conditions, &self.params)
    }

    fn select_sql(&self, where_sql: &str, limit: Option<u64>) -> String {
        let cols = match &self.columns {
            Some(cols) => cols.join(", "),
            None => "*".to_string(),
        };
        let mut sql = format!("SELECT {cols} FROM {}", self.table.name());
        if !where_sql.is_empty() {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if let Some(order) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(n) = limit.or(self.limit) {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        if let Some(n) = self.offset {
            sql.push_str(&format!(" OFFSET {n}"));
        }
        if self.for_update {
            sql.push_str(self.table.db().adapter().for_update_clause());
        }
        sql
    }

    /// Execute and return all matching rows.
    pub async fn fetch(&self) -> Result<Vec<Record>> {
        let (where_sql, params) = self.build_where()?;
        let sql = self.select_sql(&where_sql, None);
        self.table.fetch_all(&sql, &params).await
    }

    /// Execute and return the first matching row.
    pub async fn fetch_one(&self) -> Result<Option<Record>> {
        let (where_sql, params) = self.build_where()?;
        let sql = self.select_sql(&where_sql, Some(1));
        self.table.fetch_one(&sql, &params).await
    }

    /// Count matching rows.
    pub async fn count(&self) -> Result<u64> {
        let (where_sql, params) = self.build_where()?;
        let mut sql = format!("SELECT COUNT(*) as cnt FROM {}", self.table.name());
        if !where_sql.is_empty() {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        let row = self.table.db().fetch_one(&sql, &params).await?;
        Ok(row
            .and_then(|r| r.get("cnt").and_then(Value::as_i64))
            .unwrap_or(0) as u64)
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.count().await? > 0)
    }

    /// Update matching rows.
    ///
    /// Raw mode issues a single UPDATE without triggers or encoding;
    /// the default selects matching rows and updates each by primary
    /// key with the full trigger chain.
    pub async fn update(&self, values: &Record, raw: bool) -> Result<u64> {
        let (where_sql, params) = self.build_where()?;
        if raw {
            return self.update_raw(&where_sql, params, values).await;
        }

        let rows = self
            .table
            .fetch_all(&self.select_sql(&where_sql, None), &params)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let pkey = self.compound_pkey()?;

        let mut updated = 0;
        for old_record in rows {
            let Some(pk_value) = old_record.get(pkey) else {
                continue;
            };
            let mut record = old_record.clone();
            for (k, v) in values {
                record.insert(k.clone(), v.clone());
            }
            self.table
                .schema()
                .on_updating(self.table, &mut record, &old_record)
                .await?;
            let encoded = self.table.encode_for_storage(&record)?;

            let mut where_ = Record::new();
            where_.insert(pkey.to_string(), pk_value.clone());
            let affected = self.table.db().update(self.table.name(), &encoded, &where_).await?;
            if affected > 0 {
                self.table
                    .schema()
                    .on_updated(self.table, &record, &old_record)
                    .await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn update_raw(
        &self,
        where_sql: &str,
        mut params: Record,
        values: &Record,
    ) -> Result<u64> {
        let db = self.table.db();
        let set_parts: Vec<String> = values
            .keys()
            .map(|col| {
                format!(
                    "{col} = {}",
                    db.adapter().placeholder(&format!("upd_{col}"))
                )
            })
            .collect();
        for (col, value) in values {
            params.insert(format!("upd_{col}"), value.clone());
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.table.name(),
            set_parts.join(", ")
        );
        if !where_sql.is_empty() {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        db.execute(&sql, &params).await
    }

    /// Delete matching rows.
    ///
    /// Raw mode issues a single DELETE without triggers; the default
    /// selects matching rows and deletes each by primary key with the
    /// trigger chain.
    pub async fn delete(&self, raw: bool) -> Result<u64> {
        let (where_sql, params) = self.build_where()?;
        if raw {
            let mut sql = format!("DELETE FROM {}", self.table.name());
            if !where_sql.is_empty() {
                sql.push_str(&format!(" WHERE {where_sql}"));
            }
            return self.table.db().execute(&sql, &params).await;
        }

        let rows = self
            .table
            .fetch_all(&self.select_sql(&where_sql, None), &params)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let pkey = self.compound_pkey()?;

        let mut deleted = 0;
        for record in rows {
            let Some(pk_value) = record.get(pkey) else {
                continue;
            };
            self.table.schema().on_deleting(self.table, &record).await?;
            let mut where_ = Record::new();
            where_.insert(pkey.to_string(), pk_value.clone());
            let affected = self.table.db().delete(self.table.name(), &where_).await?;
            if affected > 0 {
                self.table.schema().on_deleted(self.table, &record).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn compound_pkey(&self) -> Result<&'static str> {
        self.table.pkey().ok_or_else(|| {
            ProxyError::configuration(format!(
                "compound update/delete on '{}' requires a primary key",
                self.table.name()
            ))
        })
    }
}
