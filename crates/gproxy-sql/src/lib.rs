//! gproxy SQL layer
//!
//! A lightweight relational layer over SQLite and PostgreSQL with a
//! connection-per-transaction model: [`SqlDb::connection`] binds one
//! connection to the current task, commits on success, rolls back on
//! error, and releases on every exit path. Tables are declared with a
//! [`TableSchema`] and registered on the manager; the [`Query`] builder
//! covers predicates beyond simple equality maps.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use async_trait::async_trait;
//! use gproxy_core::EncryptionManager;
//! use gproxy_sql::{ColType, Columns, SqlDb, TableSchema};
//!
//! struct UsersTable;
//!
//! #[async_trait]
//! impl TableSchema for UsersTable {
//!     fn name(&self) -> &'static str {
//!         "users"
//!     }
//!     fn pkey(&self) -> Option<&'static str> {
//!         Some("id")
//!     }
//!     fn configure(&self, c: &mut Columns) {
//!         c.column("id", ColType::String);
//!         c.column("name", ColType::String);
//!         c.column("active", ColType::Integer).default_value(1.into());
//!     }
//! }
//!
//! # async fn example() -> gproxy_core::Result<()> {
//! let db = SqlDb::new("/data/app.db", EncryptionManager::from_env())?;
//! db.add_table(Arc::new(UsersTable))?;
//! db.connection(async {
//!     db.check_structure().await
//! })
//! .await?;
//! # Ok(()) }
//! ```

pub mod adapter;
pub mod column;
pub mod db;
mod normalize;
pub mod postgres;
pub mod query;
pub mod sqlite;
pub mod table;

pub use adapter::{get_adapter, Connection, DbAdapter};
pub use column::{ColType, Column, ColumnDefault, Columns, Relation};
pub use db::SqlDb;
pub use postgres::PostgresAdapter;
pub use query::{parse_where_kwargs, Condition, Query, WhereSpec};
pub use sqlite::SqliteAdapter;
pub use table::{RecordKey, RecordOptions, Table, TableSchema, UpdateOptions};
