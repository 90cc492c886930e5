//! SQLite adapter with per-request connections.
//!
//! Uses `:name` placeholders natively. Each `acquire()` opens a new
//! connection with foreign keys enabled and an explicit `BEGIN`;
//! releasing drops the connection. This keeps requests isolated and
//! needs no pool.
//!
//! SQLite has no native boolean or timestamp types, so fetched rows are
//! normalized by column-name heuristics: `is_`/`use_`/`has_` prefixes
//! and a few well-known names coerce 0/1 integers to booleans, and
//! `_at`/`_date`/`_time` suffixes coerce ISO-8601 strings to canonical
//! RFC 3339. Application code sees the same shapes on every backend.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use gproxy_core::{ProxyError, Record, Result};
use serde_json::Value;

use crate::adapter::{Connection, DbAdapter};
use crate::normalize::normalize_row;

/// SQLite adapter (embedded file store or `:memory:`).
pub struct SqliteAdapter {
    db_path: String,
}

impl SqliteAdapter {
    pub fn new(db_path: &str) -> Self {
        Self {
            db_path: if db_path.is_empty() {
                ":memory:".to_string()
            } else {
                db_path.to_string()
            },
        }
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }
}

/// Convert a JSON value to a SQLite bind value.
fn to_sqlite_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Structured values are stored as JSON text; tables normally
        // encode json columns before reaching the adapter.
        other => Sql::Text(other.to_string()),
    }
}

/// Convert a fetched SQLite value to JSON.
fn from_sqlite_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
    }
}

fn db_err(e: rusqlite::Error) -> ProxyError {
    ProxyError::Database(e.to_string())
}

/// Bind every statement parameter present in `params` by name.
///
/// Parameters the statement does not reference are ignored; statement
/// parameters absent from the map bind as NULL.
fn bind_named(stmt: &mut rusqlite::Statement<'_>, params: &Record) -> Result<()> {
    for index in 1..=stmt.parameter_count() {
        let Some(name) = stmt.parameter_name(index) else {
            continue;
        };
        let key = name.trim_start_matches(':');
        if let Some(value) = params.get(key) {
            stmt.raw_bind_parameter(index, to_sqlite_value(value))
                .map_err(db_err)?;
        }
    }
    Ok(())
}

fn run_fetch(
    conn: &rusqlite::Connection,
    query: &str,
    params: &Record,
    limit_one: bool,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(query).map_err(db_err)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    bind_named(&mut stmt, params)?;

    let mut rows = stmt.raw_query();
    let mut result = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        let mut record = Record::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = row.get_ref(i).map_err(db_err)?;
            record.insert(name.clone(), from_sqlite_value(value));
        }
        result.push(normalize_row(record));
        if limit_one {
            break;
        }
    }
    Ok(result)
}

#[async_trait]
impl DbAdapter for SqliteAdapter {
    async fn acquire(&self) -> Result<Connection> {
        let conn = rusqlite::Connection::open(&self.db_path)
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        // busy_timeout serializes concurrent writers instead of
        // failing immediately with SQLITE_BUSY.
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000; BEGIN;")
            .map_err(db_err)?;
        Ok(Connection::Sqlite(tokio::sync::Mutex::new(conn)))
    }

    async fn commit(&self, conn: &Connection) -> Result<()> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        m.lock().await.execute_batch("COMMIT").map_err(db_err)
    }

    async fn rollback(&self, conn: &Connection) -> Result<()> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        m.lock().await.execute_batch("ROLLBACK").map_err(db_err)
    }

    async fn execute(&self, conn: &Connection, query: &str, params: &Record) -> Result<u64> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let guard = m.lock().await;
        let mut stmt = guard.prepare(query).map_err(db_err)?;
        bind_named(&mut stmt, params)?;
        let count = stmt.raw_execute().map_err(db_err)?;
        Ok(count as u64)
    }

    async fn execute_many(
        &self,
        conn: &Connection,
        query: &str,
        params_list: &[Record],
    ) -> Result<u64> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let guard = m.lock().await;
        let mut stmt = guard.prepare(query).map_err(db_err)?;
        for params in params_list {
            bind_named(&mut stmt, params)?;
            stmt.raw_execute().map_err(db_err)?;
        }
        Ok(params_list.len() as u64)
    }

    async fn fetch_one(
        &self,
        conn: &Connection,
        query: &str,
        params: &Record,
    ) -> Result<Option<Record>> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let guard = m.lock().await;
        Ok(run_fetch(&guard, query, params, true)?.into_iter().next())
    }

    async fn fetch_all(
        &self,
        conn: &Connection,
        query: &str,
        params: &Record,
    ) -> Result<Vec<Record>> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let guard = m.lock().await;
        run_fetch(&guard, query, params, false)
    }

    async fn execute_script(&self, conn: &Connection, script: &str) -> Result<()> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        m.lock().await.execute_batch(script).map_err(db_err)
    }

    async fn insert_returning_id(
        &self,
        conn: &Connection,
        table: &str,
        values: &Record,
        _pk_col: &str,
    ) -> Result<Value> {
        let Connection::Sqlite(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let guard = m.lock().await;

        let cols: Vec<&String> = values.keys().collect();
        let col_list = cols
            .iter()
            .map(|c| self.sql_name(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = cols
            .iter()
            .map(|c| self.placeholder(c))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("INSERT INTO {table} ({col_list}) VALUES ({placeholders})");

        let mut stmt = guard.prepare(&query).map_err(db_err)?;
        bind_named(&mut stmt, values)?;
        stmt.raw_execute().map_err(db_err)?;
        drop(stmt);
        Ok(Value::from(guard.last_insert_rowid()))
    }
}
