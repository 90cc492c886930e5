//! Database manager with per-request connection isolation.
//!
//! `SqlDb` owns one adapter and the table registry. The active
//! connection for the current task lives in a task-local slot:
//! [`SqlDb::connection`] acquires one, runs the given future inside the
//! scope, commits on success, rolls back on error, and releases on all
//! exit paths — including cancellation, where dropping the connection
//! abandons the open transaction.
//!
//! Every query method requires an active scope and fails fast with a
//! configuration error when called outside one.

use gproxy_core::{EncryptionManager, ProxyError, Record, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::adapter::{get_adapter, Connection, DbAdapter};
use crate::table::{Table, TableSchema};

tokio::task_local! {
    static CURRENT_CONN: Arc<Connection>;
}

/// Fetch the task's active connection, or fail fast.
pub(crate) fn current_conn() -> Result<Arc<Connection>> {
    CURRENT_CONN.try_with(Arc::clone).map_err(|_| {
        ProxyError::configuration(
            "no active connection; wrap the call in db.connection(...)",
        )
    })
}

pub(crate) struct DbCore {
    connection_string: String,
    pub(crate) adapter: Arc<dyn DbAdapter>,
    pub(crate) encryption: EncryptionManager,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

/// Async database manager with adapter pattern and table registry.
///
/// ```no_run
/// # async fn example() -> gproxy_core::Result<()> {
/// use gproxy_core::EncryptionManager;
/// use gproxy_sql::SqlDb;
///
/// let db = SqlDb::new("/data/service.db", EncryptionManager::disabled())?;
/// db.connection(async {
///     db.execute("UPDATE tenants SET active = :active", &Default::default())
///         .await?;
///     Ok(())
/// })
/// .await?;
/// // COMMIT on success, ROLLBACK on error
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct SqlDb {
    core: Arc<DbCore>,
}

impl SqlDb {
    /// Create a manager for the given connection string.
    pub fn new(connection_string: &str, encryption: EncryptionManager) -> Result<Self> {
        let adapter = get_adapter(connection_string)?;
        Ok(Self {
            core: Arc::new(DbCore {
                connection_string: connection_string.to_string(),
                adapter,
                encryption,
                tables: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub(crate) fn from_core(core: Arc<DbCore>) -> Self {
        Self { core }
    }

    pub fn connection_string(&self) -> &str {
        &self.core.connection_string
    }

    pub fn adapter(&self) -> &Arc<dyn DbAdapter> {
        &self.core.adapter
    }

    pub fn encryption(&self) -> &EncryptionManager {
        &self.core.encryption
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    /// Run `fut` with a dedicated connection bound to this task.
    ///
    /// Commits when the future returns `Ok`, rolls back when it returns
    /// `Err`, and releases the connection either way. Concurrent tasks
    /// never observe each other's connection.
    pub async fn connection<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let conn = Arc::new(self.core.adapter.acquire().await?);
        let result = CURRENT_CONN.scope(conn.clone(), fut).await;

        let finish = match &result {
            Ok(_) => self.core.adapter.commit(&conn).await,
            Err(_) => self.core.adapter.rollback(&conn).await,
        };

        if let Ok(conn) = Arc::try_unwrap(conn) {
            self.core.adapter.release(conn).await;
        }

        match (result, finish) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(commit_err)) => Err(commit_err),
            (Err(e), _) => Err(e),
        }
    }

    /// True when the current task holds an active connection.
    pub fn has_connection(&self) -> bool {
        CURRENT_CONN.try_with(|_| ()).is_ok()
    }

    /// Close the adapter pool. Application shutdown only.
    pub async fn shutdown(&self) {
        self.core.adapter.shutdown().await;
    }

    // -------------------------------------------------------------------
    // Table management
    // -------------------------------------------------------------------

    /// Register a table schema, replacing any previous registration
    /// with the same name. Returns the instantiated table.
    pub fn add_table(&self, schema: Arc<dyn TableSchema>) -> Result<Arc<Table>> {
        if schema.name().is_empty() {
            return Err(ProxyError::configuration(
                "table schema must define a non-empty name",
            ));
        }
        let table = Arc::new(Table::new(schema, self.core.clone()));
        self.core
            .tables
            .write()
            .expect("tables lock poisoned")
            .insert(table.name().to_string(), table.clone());
        Ok(table)
    }

    /// Get a registered table by name.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.core
            .tables
            .read()
            .expect("tables lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                ProxyError::configuration(format!(
                    "table '{name}' not registered; use add_table() first"
                ))
            })
    }

    /// All registered tables, name-sorted.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<Arc<Table>> = self
            .core
            .tables
            .read()
            .expect("tables lock poisoned")
            .values()
            .cloned()
            .collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    /// Create every registered table in foreign-key dependency order.
    pub async fn check_structure(&self) -> Result<()> {
        for table in self.tables_in_dependency_order() {
            table.create_schema().await?;
        }
        Ok(())
    }

    /// Add missing columns (and per-table extras) for every table.
    pub async fn sync_structure(&self) -> Result<()> {
        for table in self.tables_in_dependency_order() {
            table.sync_schema().await?;
        }
        Ok(())
    }

    /// Referenced tables first; cycles fall back to name order.
    fn tables_in_dependency_order(&self) -> Vec<Arc<Table>> {
        let all = self.tables();
        let registered: Vec<&str> = all.iter().map(|t| t.name()).collect();
        let mut ordered: Vec<Arc<Table>> = Vec::with_capacity(all.len());
        let mut remaining: Vec<Arc<Table>> = all.clone();

        while !remaining.is_empty() {
            let placed: Vec<&str> = ordered.iter().map(|t| t.name()).collect();
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|t| {
                t.columns()
                    .relation_targets()
                    .iter()
                    .all(|target| {
                        *target == t.name()
                            || placed.contains(target)
                            || !registered.contains(target)
                    })
            });
            if ready.is_empty() {
                // Relation cycle: create in name order and let the
                // backend validate.
                ordered.extend(blocked);
                break;
            }
            ordered.extend(ready);
            remaining = blocked;
        }
        ordered
    }

    // -------------------------------------------------------------------
    // Direct query access (current connection)
    // -------------------------------------------------------------------

    pub async fn execute(&self, query: &str, params: &Record) -> Result<u64> {
        let conn = current_conn()?;
        self.core.adapter.execute(&conn, query, params).await
    }

    pub async fn execute_many(&self, query: &str, params_list: &[Record]) -> Result<u64> {
        let conn = current_conn()?;
        self.core
            .adapter
            .execute_many(&conn, query, params_list)
            .await
    }

    pub async fn fetch_one(&self, query: &str, params: &Record) -> Result<Option<Record>> {
        let conn = current_conn()?;
        self.core.adapter.fetch_one(&conn, query, params).await
    }

    pub async fn fetch_all(&self, query: &str, params: &Record) -> Result<Vec<Record>> {
        let conn = current_conn()?;
        self.core.adapter.fetch_all(&conn, query, params).await
    }

    pub async fn execute_script(&self, script: &str) -> Result<()> {
        let conn = current_conn()?;
        self.core.adapter.execute_script(&conn, script).await
    }

    pub async fn commit(&self) -> Result<()> {
        let conn = current_conn()?;
        self.core.adapter.commit(&conn).await
    }

    pub async fn rollback(&self) -> Result<()> {
        let conn = current_conn()?;
        self.core.adapter.rollback(&conn).await
    }

    // -------------------------------------------------------------------
    // CRUD helpers (simple equality where-maps only)
    // -------------------------------------------------------------------

    pub(crate) fn sql_name(&self, name: &str) -> String {
        self.core.adapter.sql_name(name)
    }

    pub(crate) fn placeholder(&self, name: &str) -> String {
        self.core.adapter.placeholder(name)
    }

    pub async fn insert(&self, table: &str, values: &Record) -> Result<u64> {
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
        self.execute(&query, values).await
    }

    pub async fn insert_returning_id(
        &self,
        table: &str,
        values: &Record,
        pk_col: &str,
    ) -> Result<Value> {
        let conn = current_conn()?;
        self.core
            .adapter
            .insert_returning_id(&conn, table, values, pk_col)
            .await
    }

    pub async fn select(
        &self,
        table: &str,
        columns: Option<&[&str]>,
        where_: Option<&Record>,
        order_by: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        let cols_sql = match columns {
            Some(cols) => cols
                .iter()
                .map(|c| self.sql_name(c))
                .collect::<Vec<_>>()
                .join(", "),
            None => "*".to_string(),
        };
        let mut query = format!("SELECT {cols_sql} FROM {table}");
        let mut params = Record::new();

        if let Some(where_map) = where_ {
            if !where_map.is_empty() {
                let conditions: Vec<String> = where_map
                    .keys()
                    .map(|k| format!("{} = {}", self.sql_name(k), self.placeholder(k)))
                    .collect();
                query.push_str(" WHERE ");
                query.push_str(&conditions.join(" AND "));
                params = where_map.clone();
            }
        }
        if let Some(order) = order_by {
            query.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(n) = limit {
            query.push_str(&format!(" LIMIT {n}"));
        }

        self.fetch_all(&query, &params).await
    }

    pub async fn select_one(
        &self,
        table: &str,
        columns: Option<&[&str]>,
        where_: Option<&Record>,
    ) -> Result<Option<Record>> {
        let rows = self.select(table, columns, where_, None, Some(1)).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn update(&self, table: &str, values: &Record, where_: &Record) -> Result<u64> {
        let set_parts: Vec<String> = values
            .keys()
            .map(|k| format!("{} = {}", self.sql_name(k), self.placeholder(&format!("val_{k}"))))
            .collect();
        let where_parts: Vec<String> = where_
            .keys()
            .map(|k| format!("{} = {}", self.sql_name(k), self.placeholder(&format!("whr_{k}"))))
            .collect();
        let query = format!(
            "UPDATE {table} SET {} WHERE {}",
            set_parts.join(", "),
            where_parts.join(" AND ")
        );

        let mut params = Record::new();
        for (k, v) in values {
            params.insert(format!("val_{k}"), v.clone());
        }
        for (k, v) in where_ {
            params.insert(format!("whr_{k}"), v.clone());
        }
        self.execute(&query, &params).await
    }

    pub async fn delete(&self, table: &str, where_: &Record) -> Result<u64> {
        let where_parts: Vec<String> = where_
            .keys()
            .map(|k| format!("{} = {}", self.sql_name(k), self.placeholder(k)))
            .collect();
        let query = format!("DELETE FROM {table} WHERE {}", where_parts.join(" AND "));
        self.execute(&query, where_).await
    }

    pub async fn exists(&self, table: &str, where_: &Record) -> Result<bool> {
        let where_parts: Vec<String> = where_
            .keys()
            .map(|k| format!("{} = {}", self.sql_name(k), self.placeholder(k)))
            .collect();
        let query = format!(
            "SELECT 1 FROM {table} WHERE {} LIMIT 1",
            where_parts.join(" AND ")
        );
        Ok(self.fetch_one(&query, where_).await?.is_some())
    }

    pub async fn count(&self, table: &str, where_: Option<&Record>) -> Result<u64> {
        let mut query = format!("SELECT COUNT(*) as cnt FROM {table}");
        let mut params = Record::new();
        if let Some(where_map) = where_ {
            if !where_map.is_empty() {
                let conditions: Vec<String> = where_map
                    .keys()
                    .map(|k| format!("{} = {}", self.sql_name(k), self.placeholder(k)))
                    .collect();
                query.push_str(" WHERE ");
                query.push_str(&conditions.join(" AND "));
                params = where_map.clone();
            }
        }
        let row = self.fetch_one(&query, &params).await?;
        Ok(row
            .and_then(|r| r.get("cnt").and_then(Value::as_i64))
            .unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> (tempfile::TempDir, SqlDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqlDb::new(path.to_str().unwrap(), EncryptionManager::disabled()).unwrap();
        (dir, db)
    }

    fn rec(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_query_outside_connection_fails_fast() {
        let (_dir, db) = test_db();
        let err = db.execute("SELECT 1", &Record::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_crud_helpers_round_trip() {
        let (_dir, db) = test_db();
        db.connection(async {
            db.execute_script("CREATE TABLE items (id TEXT, label TEXT, rank INTEGER)")
                .await?;
            db.insert(
                "items",
                &rec(&[("id", json!("a")), ("label", json!("one")), ("rank", json!(2))]),
            )
            .await?;
            db.insert(
                "items",
                &rec(&[("id", json!("b")), ("label", json!("two")), ("rank", json!(1))]),
            )
            .await?;

            let rows = db
                .select("items", None, None, Some("rank"), None)
                .await?;
            assert_eq!(rows[0].get("id").unwrap(), "b");

            let updated = db
                .update(
                    "items",
                    &rec(&[("label", json!("uno"))]),
                    &rec(&[("id", json!("a"))]),
                )
                .await?;
            assert_eq!(updated, 1);

            assert!(db.exists("items", &rec(&[("label", json!("uno"))])).await?);
            assert_eq!(db.count("items", None).await?, 2);

            let deleted = db.delete("items", &rec(&[("id", json!("b"))])).await?;
            assert_eq!(deleted, 1);
            assert_eq!(db.count("items", None).await?, 1);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connection_rolls_back_on_error() {
        let (_dir, db) = test_db();
        db.connection(async {
            db.execute_script("CREATE TABLE t (id TEXT)").await?;
            Ok(())
        })
        .await
        .unwrap();

        let result: Result<()> = db
            .connection(async {
                db.insert("t", &rec(&[("id", json!("doomed"))])).await?;
                Err(ProxyError::internal("boom"))
            })
            .await;
        assert!(result.is_err());

        db.connection(async {
            assert_eq!(db.count("t", None).await?, 0);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_tasks_get_independent_connections() {
        let (_dir, db) = test_db();
        db.connection(async {
            db.execute_script("CREATE TABLE t (id TEXT)").await?;
            Ok(())
        })
        .await
        .unwrap();

        let db1 = db.clone();
        let db2 = db.clone();
        let t1 = tokio::spawn(async move {
            db1.connection(async {
                db1.insert("t", &rec(&[("id", json!("t1"))])).await?;
                Ok(())
            })
            .await
        });
        let t2 = tokio::spawn(async move {
            db2.connection(async {
                db2.insert("t", &rec(&[("id", json!("t2"))])).await?;
                Ok(())
            })
            .await
        });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        db.connection(async {
            assert_eq!(db.count("t", None).await?, 2);
            Ok(())
        })
        .await
        .unwrap();
    }
}
