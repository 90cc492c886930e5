//! PostgreSQL adapter with connection pooling.
//!
//! Connections come from a lazily-opened deadpool pool; `acquire()`
//! checks one out and opens a transaction, releasing returns it. The
//! portable `:name` placeholders are rewritten to positional `$n`
//! parameters (repeated names reuse the same index, `::type` casts are
//! left alone), and JSON values are bound according to the parameter
//! type the server reports.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use gproxy_core::{ProxyError, Record, Result};
use serde_json::Value;
use std::sync::OnceLock;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;

use crate::adapter::{Connection, DbAdapter};
use crate::normalize::normalize_row;

/// PostgreSQL adapter (networked relational store).
pub struct PostgresAdapter {
    dsn: String,
    pool_size: usize,
    pool: OnceLock<Pool>,
}

impl PostgresAdapter {
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            pool_size: 10,
            pool: OnceLock::new(),
        }
    }

    pub fn with_pool_size(dsn: &str, pool_size: usize) -> Self {
        Self {
            dsn: dsn.to_string(),
            pool_size,
            pool: OnceLock::new(),
        }
    }

    fn pool(&self) -> Result<&Pool> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        let mut cfg = Config::new();
        cfg.url = Some(self.dsn.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.pool_size));
        cfg.manager = Some(ManagerConfig {
            // Clean recycling rolls back any transaction a cancelled
            // task left open before the connection is reused.
            recycling_method: RecyclingMethod::Clean,
        });
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ProxyError::BackendUnavailable(format!("pool creation failed: {e}")))?;
        Ok(self.pool.get_or_init(|| pool))
    }
}

/// Rewrite `:name` placeholders to `$n`, returning the ordered
/// parameter names. Repeated names reuse their first index; `::` casts
/// pass through untouched.
pub(crate) fn rewrite_placeholders(sql: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == ':' {
            if i + 1 < chars.len() && chars[i + 1] == ':' {
                out.push_str("::");
                i += 2;
                continue;
            }
            if i + 1 < chars.len() && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_') {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().collect();
                let index = match names.iter().position(|n| n == &name) {
                    Some(pos) => pos + 1,
                    None => {
                        names.push(name);
                        names.len()
                    }
                };
                out.push('$');
                out.push_str(&index.to_string());
                i = j;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    (out, names)
}

/// Wire-type families this adapter understands. `Type` constants are
/// not usable in match patterns, so they map to this enum first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    Other,
}

fn kind(ty: &Type) -> PgKind {
    if *ty == Type::BOOL {
        PgKind::Bool
    } else if *ty == Type::INT2 {
        PgKind::Int2
    } else if *ty == Type::INT4 {
        PgKind::Int4
    } else if *ty == Type::INT8 {
        PgKind::Int8
    } else if *ty == Type::FLOAT4 {
        PgKind::Float4
    } else if *ty == Type::FLOAT8 {
        PgKind::Float8
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::NAME || *ty == Type::BPCHAR
    {
        PgKind::Text
    } else if *ty == Type::TIMESTAMP {
        PgKind::Timestamp
    } else if *ty == Type::TIMESTAMPTZ {
        PgKind::TimestampTz
    } else if *ty == Type::DATE {
        PgKind::Date
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        PgKind::Json
    } else {
        PgKind::Other
    }
}

/// JSON value bound according to the server-reported parameter type.
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

type ToSqlError = Box<dyn std::error::Error + Sync + Send>;

fn bind_error(value: &Value, ty: &Type) -> ToSqlError {
    format!("cannot bind {value} as {ty}").into()
}

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, ToSqlError> {
        let target = kind(ty);
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match target {
                PgKind::Bool => b.to_sql(ty, out),
                PgKind::Int2 => i16::from(*b).to_sql(ty, out),
                PgKind::Int4 => i32::from(*b).to_sql(ty, out),
                PgKind::Int8 => i64::from(*b).to_sql(ty, out),
                PgKind::Text => b.to_string().to_sql(ty, out),
                PgKind::Json => self.0.to_sql(ty, out),
                _ => Err(bind_error(self.0, ty)),
            },
            Value::Number(n) => match target {
                PgKind::Int2 => {
                    let i = n.as_i64().ok_or_else(|| bind_error(self.0, ty))?;
                    i16::try_from(i)?.to_sql(ty, out)
                }
                PgKind::Int4 => {
                    let i = n.as_i64().ok_or_else(|| bind_error(self.0, ty))?;
                    i32::try_from(i)?.to_sql(ty, out)
                }
                PgKind::Int8 => n
                    .as_i64()
                    .ok_or_else(|| bind_error(self.0, ty))?
                    .to_sql(ty, out),
                PgKind::Float4 => (n.as_f64().unwrap_or_default() as f32).to_sql(ty, out),
                PgKind::Float8 => n.as_f64().unwrap_or_default().to_sql(ty, out),
                PgKind::Bool => (n.as_i64() == Some(1)).to_sql(ty, out),
                PgKind::Text => n.to_string().to_sql(ty, out),
                PgKind::Json => self.0.to_sql(ty, out),
                _ => Err(bind_error(self.0, ty)),
            },
            Value::String(s) => match target {
                PgKind::Text => s.to_sql(ty, out),
                PgKind::Bool => {
                    matches!(s.to_lowercase().as_str(), "1" | "true" | "yes").to_sql(ty, out)
                }
                PgKind::Int2 => s.parse::<i16>()?.to_sql(ty, out),
                PgKind::Int4 => s.parse::<i32>()?.to_sql(ty, out),
                PgKind::Int8 => s.parse::<i64>()?.to_sql(ty, out),
                PgKind::Float4 => s.parse::<f32>()?.to_sql(ty, out),
                PgKind::Float8 => s.parse::<f64>()?.to_sql(ty, out),
                PgKind::TimestampTz => parse_timestamp(s)
                    .ok_or_else(|| bind_error(self.0, ty))?
                    .to_sql(ty, out),
                PgKind::Timestamp => parse_timestamp(s)
                    .ok_or_else(|| bind_error(self.0, ty))?
                    .naive_utc()
                    .to_sql(ty, out),
                PgKind::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")?.to_sql(ty, out),
                PgKind::Json => self.0.to_sql(ty, out),
                _ => s.to_sql(ty, out),
            },
            // Structured values land in json columns or text fallbacks.
            other => match target {
                PgKind::Json => other.to_sql(ty, out),
                PgKind::Text => other.to_string().to_sql(ty, out),
                _ => Err(bind_error(self.0, ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    None
}

fn rfc3339(naive: NaiveDateTime) -> String {
    naive.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Convert one fetched row into a JSON record.
///
/// Booleans and timestamps keep the same shapes the SQLite adapter
/// normalizes to, so application code is backend-agnostic.
fn row_to_record(row: &tokio_postgres::Row) -> Result<Record> {
    let mut record = Record::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = match kind(col.type_()) {
            PgKind::Bool => row
                .try_get::<_, Option<bool>>(i)
                .map(|v| v.map(Value::Bool)),
            PgKind::Int2 => row
                .try_get::<_, Option<i16>>(i)
                .map(|v| v.map(|n| Value::from(i64::from(n)))),
            PgKind::Int4 => row
                .try_get::<_, Option<i32>>(i)
                .map(|v| v.map(|n| Value::from(i64::from(n)))),
            PgKind::Int8 => row.try_get::<_, Option<i64>>(i).map(|v| v.map(Value::from)),
            PgKind::Float4 => row.try_get::<_, Option<f32>>(i).map(|v| {
                v.and_then(|f| serde_json::Number::from_f64(f64::from(f)).map(Value::Number))
            }),
            PgKind::Float8 => row
                .try_get::<_, Option<f64>>(i)
                .map(|v| v.and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))),
            PgKind::Timestamp => row
                .try_get::<_, Option<NaiveDateTime>>(i)
                .map(|v| v.map(|ts| Value::String(rfc3339(ts)))),
            PgKind::TimestampTz => row.try_get::<_, Option<DateTime<Utc>>>(i).map(|v| {
                v.map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)))
            }),
            PgKind::Date => row
                .try_get::<_, Option<NaiveDate>>(i)
                .map(|v| v.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))),
            PgKind::Json => row.try_get::<_, Option<Value>>(i),
            PgKind::Text | PgKind::Other => row
                .try_get::<_, Option<String>>(i)
                .map(|v| v.map(Value::String)),
        };
        let value = value.map_err(|e| ProxyError::Database(e.to_string()))?;
        record.insert(col.name().to_string(), value.unwrap_or(Value::Null));
    }
    // Same name-heuristic normalization as the SQLite adapter, so
    // integer-backed boolean columns read identically on both backends.
    Ok(normalize_row(record))
}

fn db_err(e: tokio_postgres::Error) -> ProxyError {
    ProxyError::Database(e.to_string())
}

fn ordered_params<'a>(names: &'a [String], params: &'a Record) -> Vec<PgParam<'a>> {
    static NULL: Value = Value::Null;
    names
        .iter()
        .map(|name| PgParam(params.get(name).unwrap_or(&NULL)))
        .collect()
}

fn as_dyn<'a>(params: &'a [PgParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl DbAdapter for PostgresAdapter {
    fn pk_column(&self, name: &str) -> String {
        format!("\"{name}\" SERIAL PRIMARY KEY")
    }

    fn for_update_clause(&self) -> &'static str {
        " FOR UPDATE"
    }

    async fn acquire(&self) -> Result<Connection> {
        let client = self
            .pool()?
            .get()
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        client.simple_query("BEGIN").await.map_err(db_err)?;
        Ok(Connection::Postgres(tokio::sync::Mutex::new(client)))
    }

    async fn shutdown(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close();
        }
    }

    async fn commit(&self, conn: &Connection) -> Result<()> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        m.lock()
            .await
            .simple_query("COMMIT")
            .await
            .map(|_| ())
            .map_err(db_err)
    }

    async fn rollback(&self, conn: &Connection) -> Result<()> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        m.lock()
            .await
            .simple_query("ROLLBACK")
            .await
            .map(|_| ())
            .map_err(db_err)
    }

    async fn execute(&self, conn: &Connection, query: &str, params: &Record) -> Result<u64> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let client = m.lock().await;
        let (sql, names) = rewrite_placeholders(query);
        let owned = ordered_params(&names, params);
        client
            .execute(sql.as_str(), &as_dyn(&owned))
            .await
            .map_err(db_err)
    }

    async fn execute_many(
        &self,
        conn: &Connection,
        query: &str,
        params_list: &[Record],
    ) -> Result<u64> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let client = m.lock().await;
        let (sql, names) = rewrite_placeholders(query);
        let statement = client.prepare(sql.as_str()).await.map_err(db_err)?;
        for params in params_list {
            let owned = ordered_params(&names, params);
            client
                .execute(&statement, &as_dyn(&owned))
                .await
                .map_err(db_err)?;
        }
        Ok(params_list.len() as u64)
    }

    async fn fetch_one(
        &self,
        conn: &Connection,
        query: &str,
        params: &Record,
    ) -> Result<Option<Record>> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let client = m.lock().await;
        let (sql, names) = rewrite_placeholders(query);
        let owned = ordered_params(&names, params);
        let row = client
            .query_opt(sql.as_str(), &as_dyn(&owned))
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn fetch_all(
        &self,
        conn: &Connection,
        query: &str,
        params: &Record,
    ) -> Result<Vec<Record>> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let client = m.lock().await;
        let (sql, names) = rewrite_placeholders(query);
        let owned = ordered_params(&names, params);
        let rows = client
            .query(sql.as_str(), &as_dyn(&owned))
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn execute_script(&self, conn: &Connection, script: &str) -> Result<()> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        m.lock()
            .await
            .batch_execute(script)
            .await
            .map_err(db_err)
    }

    async fn insert_returning_id(
        &self,
        conn: &Connection,
        table: &str,
        values: &Record,
        pk_col: &str,
    ) -> Result<Value> {
        let Connection::Postgres(m) = conn else {
            return Err(ProxyError::internal("connection backend mismatch"));
        };
        let client = m.lock().await;

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
        let query = format!(
            "INSERT INTO {table} ({col_list}) VALUES ({placeholders}) RETURNING \"{pk_col}\""
        );

        let (sql, names) = rewrite_placeholders(&query);
        let owned = ordered_params(&names, values);
        let row = client
            .query_one(sql.as_str(), &as_dyn(&owned))
            .await
            .map_err(db_err)?;
        let record = row_to_record(&row)?;
        Ok(record.get(pk_col).cloned().unwrap_or(Value::Null))
    }
}
