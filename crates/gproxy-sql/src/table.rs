//! Table base: schema binding, typed CRUD, triggers, record updater.
//!
//! A [`TableSchema`] declares a table (name, primary key, columns,
//! trigger hooks); the database manager instantiates it as a [`Table`]
//! that layers JSON encoding, field encryption, and the trigger chain
//! over the adapter-level CRUD helpers.
//!
//! Trigger order is fixed: `on_inserting` / `on_updating` /
//! `on_deleting` run before the storage call with mutations visible to
//! it, `on_inserted` / `on_updated` / `on_deleted` after. A trigger
//! error aborts the operation and the enclosing connection scope rolls
//! back.

use async_trait::async_trait;
use gproxy_core::{ProxyError, Record, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::column::Columns;
use crate::db::{DbCore, SqlDb};
use crate::query::Query;

/// Declarative description of one table plus its trigger hooks.
///
/// The default primary-key policy generates a UUID before insert;
/// override [`TableSchema::new_pkey_value`] to return `None` for
/// backend autoincrement keys.
#[async_trait]
pub trait TableSchema: Send + Sync + 'static {
    /// Stable table name.
    fn name(&self) -> &'static str;

    /// Primary-key column, if any.
    fn pkey(&self) -> Option<&'static str> {
        None
    }

    /// Populate the column set. Called once at registration.
    fn configure(&self, columns: &mut Columns);

    /// Generate a primary key before insert; `None` means the backend
    /// autoincrements and the generated key is captured after insert.
    fn new_pkey_value(&self) -> Option<Value> {
        Some(Value::String(uuid::Uuid::new_v4().to_string()))
    }

    /// Post-edit the generated CREATE TABLE statement, e.g. to append
    /// a composite UNIQUE constraint before the closing paren.
    fn amend_create_table_sql(&self, sql: String) -> String {
        sql
    }

    async fn on_inserting(&self, _table: &Table, _record: &mut Record) -> Result<()> {
        Ok(())
    }

    async fn on_inserted(&self, _table: &Table, _record: &Record) -> Result<()> {
        Ok(())
    }

    async fn on_updating(
        &self,
        _table: &Table,
        _record: &mut Record,
        _old_record: &Record,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_updated(
        &self,
        _table: &Table,
        _record: &Record,
        _old_record: &Record,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_deleting(&self, _table: &Table, _record: &Record) -> Result<()> {
        Ok(())
    }

    async fn on_deleted(&self, _table: &Table, _record: &Record) -> Result<()> {
        Ok(())
    }

    /// Extra statements after column sync (indexes and the like).
    async fn after_sync_schema(&self, _table: &Table) -> Result<()> {
        Ok(())
    }
}

/// Key addressing a single record: scalar primary key or composite map.
#[derive(Debug, Clone)]
pub enum RecordKey {
    Pkey(Value),
    Where(Record),
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Pkey(Value::String(value.to_string()))
    }
}

impl From<Value> for RecordKey {
    fn from(value: Value) -> Self {
        RecordKey::Pkey(value)
    }
}

impl From<Record> for RecordKey {
    fn from(where_: Record) -> Self {
        RecordKey::Where(where_)
    }
}

/// Options for [`Table::record`].
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Return an empty record instead of raising not-found.
    pub ignore_missing: bool,
    /// Return the first row instead of raising on duplicates.
    pub ignore_duplicate: bool,
    /// Lock the row when the backend supports it.
    pub for_update: bool,
    /// Restrict the selected columns.
    pub columns: Option<Vec<String>>,
    /// Skip JSON decoding and decryption.
    pub raw: bool,
}

/// Options for [`Table::record_to_update`].
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Insert a new record seeded with the key fields when absent.
    pub insert_missing: bool,
    /// Yield an empty record when absent instead of raising.
    pub ignore_missing: bool,
    /// Lock the row for the duration of the edit.
    pub for_update: bool,
    /// Bypass triggers and encoding.
    pub raw: bool,
    /// Initial values applied before the mutation closure (nulls skipped).
    pub initial: Record,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            insert_missing: false,
            ignore_missing: false,
            for_update: true,
            raw: false,
            initial: Record::new(),
        }
    }
}

impl UpdateOptions {
    pub fn insert_missing() -> Self {
        Self {
            insert_missing: true,
            ..Self::default()
        }
    }
}

/// A registered table bound to its database manager.
pub struct Table {
    schema: Arc<dyn TableSchema>,
    columns: Columns,
    core: Arc<DbCore>,
}

impl Table {
    pub(crate) fn new(schema: Arc<dyn TableSchema>, core: Arc<DbCore>) -> Self {
        let mut columns = Columns::new();
        schema.configure(&mut columns);
        Self {
            schema,
            columns,
            core,
        }
    }

    pub fn name(&self) -> &'static str {
        self.schema.name()
    }

    pub fn pkey(&self) -> Option<&'static str> {
        self.schema.pkey()
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn schema(&self) -> &Arc<dyn TableSchema> {
        &self.schema
    }

    /// The owning database manager.
    pub fn db(&self) -> SqlDb {
        SqlDb::from_core(self.core.clone())
    }

    // -------------------------------------------------------------------
    // Schema
    // -------------------------------------------------------------------

    /// Generate the CREATE TABLE IF NOT EXISTS statement.
    pub fn create_table_sql(&self) -> String {
        let autoincrement = self.pkey().is_some() && self.schema.new_pkey_value().is_none();

        let mut col_defs: Vec<String> = Vec::with_capacity(self.columns.len());
        for col in self.columns.iter() {
            if Some(col.name.as_str()) == self.pkey() {
                if autoincrement && col.ctype == crate::column::ColType::Integer {
                    col_defs.push(self.core.adapter.pk_column(&col.name));
                } else {
                    col_defs.push(col.to_sql(true));
                }
            } else {
                col_defs.push(col.to_sql(false));
            }
        }

        for col in self.columns.iter() {
            if let Some(rel) = &col.relation {
                if rel.enforced {
                    col_defs.push(format!(
                        "FOREIGN KEY (\"{}\") REFERENCES {}(\"{}\")",
                        col.name, rel.table, rel.column
                    ));
                }
            }
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name(),
            col_defs.join(",\n    ")
        );
        self.schema.amend_create_table_sql(sql)
    }

    /// Create the table if it does not exist.
    pub async fn create_schema(&self) -> Result<()> {
        self.db().execute(&self.create_table_sql(), &Record::new()).await?;
        Ok(())
    }

    /// Add every declared non-pk column that is missing.
    ///
    /// Failures are swallowed: SQLite before 3.35 has no idempotent
    /// ADD COLUMN, and existing columns are not an error condition.
    pub async fn sync_schema(&self) -> Result<()> {
        let db = self.db();
        for col in self.columns.iter() {
            if Some(col.name.as_str()) == self.pkey() {
                continue;
            }
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                self.name(),
                col.to_sql(false)
            );
            if let Err(e) = db.execute(&sql, &Record::new()).await {
                tracing::debug!(table = self.name(), column = %col.name, error = %e, "sync_schema add column skipped");
            }
        }
        self.schema.after_sync_schema(self).await
    }

    // -------------------------------------------------------------------
    // Encoding and encryption
    // -------------------------------------------------------------------

    /// Serialize json_encoded columns for storage.
    pub(crate) fn encode_json_fields(&self, data: &Record) -> Record {
        let mut result = data.clone();
        for name in self.columns.json_columns() {
            if let Some(value) = result.get(name) {
                if !value.is_null() && !value.is_string() {
                    let encoded = value.to_string();
                    result.insert(name.to_string(), Value::String(encoded));
                }
            }
        }
        result
    }

    /// Parse json_encoded columns after read; unparseable text is kept
    /// as-is (it may be ciphertext read without a key).
    pub(crate) fn decode_json_fields(&self, row: &Record) -> Record {
        let mut result = row.clone();
        for name in self.columns.json_columns() {
            if let Some(Value::String(text)) = result.get(name) {
                if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                    result.insert(name.to_string(), parsed);
                }
            }
        }
        result
    }

    /// Encrypt marked columns before storage. Fatal on failure.
    pub(crate) fn encrypt_fields(&self, data: &Record) -> Result<Record> {
        let encrypted_cols = self.columns.encrypted_columns();
        if encrypted_cols.is_empty() || !self.core.encryption.is_configured() {
            return Ok(data.clone());
        }
        let mut result = data.clone();
        for name in encrypted_cols {
            if let Some(Value::String(plain)) = result.get(name) {
                let sealed = self.core.encryption.encrypt(plain)?;
                result.insert(name.to_string(), Value::String(sealed));
            }
        }
        Ok(result)
    }

    /// Decrypt marked columns after read. Failures keep the stored
    /// value so a proxy without the right key does not destroy data.
    pub(crate) fn decrypt_fields(&self, row: &Record) -> Record {
        let encrypted_cols = self.columns.encrypted_columns();
        if encrypted_cols.is_empty() || !self.core.encryption.is_configured() {
            return row.clone();
        }
        let mut result = row.clone();
        for name in encrypted_cols {
            if let Some(Value::String(stored)) = result.get(name) {
                if let Ok(plain) = self.core.encryption.decrypt(stored) {
                    result.insert(name.to_string(), Value::String(plain));
                }
            }
        }
        result
    }

    pub(crate) fn decode_row(&self, row: Record) -> Record {
        self.decode_json_fields(&self.decrypt_fields(&row))
    }

    /// Storage encoding for one outgoing record: JSON-encode, encrypt,
    /// and strip transient `_`-prefixed fields (returned to the caller
    /// once, never persisted).
    pub(crate) fn encode_for_storage(&self, record: &Record) -> Result<Record> {
        let mut encoded = self.encrypt_fields(&self.encode_json_fields(record))?;
        encoded.retain(|k, _| !k.starts_with('_'));
        Ok(encoded)
    }

    // -------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------

    /// Insert a row, running triggers and encoding.
    ///
    /// The record is mutated: a generated primary key (UUID or
    /// backend autoincrement) is written back into it.
    pub async fn insert(&self, record: &mut Record, raw: bool) -> Result<()> {
        if raw {
            self.db().insert(self.name(), record).await?;
            return Ok(());
        }

        if let Some(pkey) = self.pkey() {
            if !record.contains_key(pkey) {
                if let Some(value) = self.schema.new_pkey_value() {
                    record.insert(pkey.to_string(), value);
                }
            }
        }
        self.schema.on_inserting(self, record).await?;

        let encoded = self.encode_for_storage(record)?;
        match self.pkey() {
            Some(pkey) if !record.contains_key(pkey) => {
                let generated = self
                    .db()
                    .insert_returning_id(self.name(), &encoded, pkey)
                    .await?;
                if !generated.is_null() {
                    record.insert(pkey.to_string(), generated);
                }
            }
            _ => {
                self.db().insert(self.name(), &encoded).await?;
            }
        }

        self.schema.on_inserted(self, record).await?;
        Ok(())
    }

    /// Select rows with decode/decrypt layered over the db helper.
    pub async fn select(
        &self,
        columns: Option<&[&str]>,
        where_: Option<&Record>,
        order_by: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        let rows = self
            .db()
            .select(self.name(), columns, where_, order_by, limit)
            .await?;
        Ok(rows.into_iter().map(|r| self.decode_row(r)).collect())
    }

    /// Fetch exactly one record by key or predicate.
    ///
    /// Not found raises unless `ignore_missing` (then an empty record
    /// is returned); multiple rows raise unless `ignore_duplicate`
    /// (then the first row is returned).
    pub async fn record(&self, key: impl Into<RecordKey>, opts: RecordOptions) -> Result<Record> {
        let (where_, key_desc) = self.key_to_where(key.into())?;

        let rows = if opts.for_update {
            match self
                .select_for_update(&where_, opts.columns.as_deref())
                .await?
            {
                Some(row) => vec![row],
                None => Vec::new(),
            }
        } else {
            let columns_refs: Option<Vec<&str>> = opts
                .columns
                .as_ref()
                .map(|cols| cols.iter().map(String::as_str).collect());
            let rows = self
                .db()
                .select(
                    self.name(),
                    columns_refs.as_deref(),
                    Some(&where_),
                    None,
                    Some(2),
                )
                .await?;
            if opts.raw {
                rows
            } else {
                rows.into_iter().map(|r| self.decode_row(r)).collect()
            }
        };

        match rows.len() {
            0 => {
                if opts.ignore_missing {
                    Ok(Record::new())
                } else {
                    Err(ProxyError::not_found(format!(
                        "record not found in '{}' with {key_desc}",
                        self.name()
                    )))
                }
            }
            1 => Ok(rows.into_iter().next().expect("one row")),
            _ => {
                if opts.ignore_duplicate {
                    Ok(rows.into_iter().next().expect("first row"))
                } else {
                    let count = self.db().count(self.name(), Some(&where_)).await?;
                    Err(ProxyError::DuplicateRecord(format!(
                        "expected 1 record in '{}' with {key_desc}, found {count}",
                        self.name()
                    )))
                }
            }
        }
    }

    fn key_to_where(&self, key: RecordKey) -> Result<(Record, String)> {
        match key {
            RecordKey::Pkey(value) => {
                let Some(pkey) = self.pkey() else {
                    return Err(ProxyError::configuration(format!(
                        "table '{}' has no primary key defined",
                        self.name()
                    )));
                };
                let desc = format!("pkey={value}");
                let mut where_ = Record::new();
                where_.insert(pkey.to_string(), value);
                Ok((where_, desc))
            }
            RecordKey::Where(where_) => {
                if where_.is_empty() {
                    return Err(ProxyError::configuration(
                        "record() requires a non-empty key",
                    ));
                }
                let desc = format!("where={}", Value::Object(where_.clone()));
                Ok((where_, desc))
            }
        }
    }

    /// Select a single row under the strongest lock the backend offers.
    pub async fn select_for_update(
        &self,
        where_: &Record,
        columns: Option<&[String]>,
    ) -> Result<Option<Record>> {
        let db = self.db();
        let cols_sql = match columns {
            Some(cols) if !cols.is_empty() => cols
                .iter()
                .map(|c| db.sql_name(c))
                .collect::<Vec<_>>()
                .join(", "),
            _ => "*".to_string(),
        };
        let conditions: Vec<String> = where_
            .keys()
            .map(|k| format!("{} = {}", db.sql_name(k), db.placeholder(k)))
            .collect();
        let query = format!(
            "SELECT {cols_sql} FROM {} WHERE {}{}",
            self.name(),
            conditions.join(" AND "),
            self.core.adapter.for_update_clause()
        );
        let row = db.fetch_one(&query, where_).await?;
        Ok(row.map(|r| self.decode_row(r)))
    }

    /// Load-lock-mutate-persist in one scope.
    ///
    /// Reads the record identified by `key` (row-locked where
    /// supported), applies `opts.initial` and the `mutate` closure,
    /// then inserts or updates. No write happens when the closure
    /// errors; an absent record without `insert_missing` or
    /// `ignore_missing` raises not-found at exit.
    pub async fn record_to_update<F>(
        &self,
        key: impl Into<RecordKey>,
        opts: UpdateOptions,
        mutate: F,
    ) -> Result<Record>
    where
        F: FnOnce(&mut Record) -> Result<()>,
    {
        let (where_, key_desc) = self.key_to_where(key.into())?;

        let old = self
            .record(
                RecordKey::Where(where_.clone()),
                RecordOptions {
                    ignore_missing: true,
                    for_update: opts.for_update,
                    ..Default::default()
                },
            )
            .await?;
        let exists = !old.is_empty();

        let mut record = if exists {
            old
        } else if opts.insert_missing {
            where_.clone()
        } else {
            Record::new()
        };

        for (k, v) in &opts.initial {
            if !v.is_null() {
                record.insert(k.clone(), v.clone());
            }
        }

        mutate(&mut record)?;

        if !exists && !opts.insert_missing {
            if opts.ignore_missing {
                return Ok(record);
            }
            return Err(ProxyError::not_found(format!(
                "record not found in '{}' with {key_desc}",
                self.name()
            )));
        }

        if record.is_empty() {
            return Ok(record);
        }

        if exists {
            self.update(record.clone(), &where_, opts.raw).await?;
        } else {
            self.insert(&mut record, opts.raw).await?;
        }
        Ok(record)
    }

    /// Update rows, running triggers and encoding.
    pub async fn update(&self, values: Record, where_: &Record, raw: bool) -> Result<u64> {
        if raw {
            return self.db().update(self.name(), &values, where_).await;
        }

        let old = self.select_for_update(where_, None).await?;
        let empty = Record::new();
        let mut record = values;
        self.schema
            .on_updating(self, &mut record, old.as_ref().unwrap_or(&empty))
            .await?;
        let encoded = self.encode_for_storage(&record)?;
        let affected = self.db().update(self.name(), &encoded, where_).await?;
        if affected > 0 {
            if let Some(old_record) = old {
                self.schema.on_updated(self, &record, &old_record).await?;
            }
        }
        Ok(affected)
    }

    /// Update many records by primary key, one trigger chain per row.
    ///
    /// The closure mutates each record in place and may return `false`
    /// to skip that row. Returns the number of updated rows.
    pub async fn batch_update<F>(&self, pkeys: &[Value], mut updater: F) -> Result<u64>
    where
        F: FnMut(&mut Record) -> bool,
    {
        if pkeys.is_empty() {
            return Ok(0);
        }
        let pkey = self.require_pkey()?;
        let db = self.db();

        let (in_clause, params) = self.pk_in_clause(pkeys);
        let query = format!("SELECT * FROM {} WHERE {pkey} IN ({in_clause})", self.name());
        let rows = db.fetch_all(&query, &params).await?;

        let mut updated = 0;
        for row in rows {
            let old_record = self.decode_row(row);
            let mut record = old_record.clone();
            if !updater(&mut record) {
                continue;
            }

            self.schema
                .on_updating(self, &mut record, &old_record)
                .await?;
            let encoded = self.encode_for_storage(&record)?;
            let Some(pk_value) = old_record.get(pkey) else {
                continue;
            };
            let mut where_ = Record::new();
            where_.insert(pkey.to_string(), pk_value.clone());
            let affected = db.update(self.name(), &encoded, &where_).await?;
            if affected > 0 {
                self.schema.on_updated(self, &record, &old_record).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Apply the same values to many records, with triggers.
    pub async fn batch_update_values(&self, pkeys: &[Value], values: &Record) -> Result<u64> {
        self.batch_update(pkeys, |record| {
            for (k, v) in values {
                record.insert(k.clone(), v.clone());
            }
            true
        })
        .await
    }

    /// Single `UPDATE … WHERE pk IN (…)` without triggers or encoding.
    pub async fn batch_update_raw(&self, pkeys: &[Value], values: &Record) -> Result<u64> {
        if pkeys.is_empty() {
            return Ok(0);
        }
        let pkey = self.require_pkey()?;
        let db = self.db();

        let set_parts: Vec<String> = values
            .keys()
            .map(|k| format!("{} = {}", db.sql_name(k), db.placeholder(k)))
            .collect();
        let (in_clause, mut params) = self.pk_in_clause(pkeys);
        for (k, v) in values {
            params.insert(k.clone(), v.clone());
        }
        let query = format!(
            "UPDATE {} SET {} WHERE {pkey} IN ({in_clause})",
            self.name(),
            set_parts.join(", ")
        );
        db.execute(&query, &params).await
    }

    fn pk_in_clause(&self, pkeys: &[Value]) -> (String, Record) {
        let db = self.db();
        let mut params = Record::new();
        let placeholders: Vec<String> = pkeys
            .iter()
            .enumerate()
            .map(|(i, pk)| {
                let name = format!("pk_{i}");
                params.insert(name.clone(), pk.clone());
                db.placeholder(&name)
            })
            .collect();
        (placeholders.join(", "), params)
    }

    fn require_pkey(&self) -> Result<&'static str> {
        self.pkey().ok_or_else(|| {
            ProxyError::configuration(format!(
                "table '{}' has no primary key defined",
                self.name()
            ))
        })
    }

    /// Delete rows, running triggers for the matched record.
    pub async fn delete(&self, where_: &Record, raw: bool) -> Result<u64> {
        if raw {
            return self.db().delete(self.name(), where_).await;
        }

        let record = self
            .record(
                RecordKey::Where(where_.clone()),
                RecordOptions {
                    ignore_missing: true,
                    ignore_duplicate: true,
                    ..Default::default()
                },
            )
            .await?;
        if !record.is_empty() {
            self.schema.on_deleting(self, &record).await?;
        }
        let affected = self.db().delete(self.name(), where_).await?;
        if affected > 0 && !record.is_empty() {
            self.schema.on_deleted(self, &record).await?;
        }
        Ok(affected)
    }

    pub async fn exists(&self, where_: &Record) -> Result<bool> {
        self.db().exists(self.name(), where_).await
    }

    pub async fn count(&self, where_: Option<&Record>) -> Result<u64> {
        self.db().count(self.name(), where_).await
    }

    /// Start a fluent query over this table.
    pub fn query(&self) -> Query<'_> {
        Query::new(self)
    }

    // -------------------------------------------------------------------
    // Raw access with decode layered on top
    // -------------------------------------------------------------------

    pub async fn fetch_one(&self, query: &str, params: &Record) -> Result<Option<Record>> {
        let row = self.db().fetch_one(query, params).await?;
        Ok(row.map(|r| self.decode_row(r)))
    }

    pub async fn fetch_all(&self, query: &str, params: &Record) -> Result<Vec<Record>> {
        let rows = self.db().fetch_all(query, params).await?;
        Ok(rows.into_iter().map(|r| self.decode_row(r)).collect())
    }

    pub async fn execute(&self, query: &str, params: &Record) -> Result<u64> {
        self.db().execute(query, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_core::EncryptionManager;
    use crate::column::ColType;
    use serde_json::json;

    struct ItemsTable;

    #[async_trait]
    impl TableSchema for ItemsTable {
        fn name(&self) -> &'static str {
            "items"
        }

        fn pkey(&self) -> Option<&'static str> {
            Some("pk")
        }

        fn configure(&self, c: &mut Columns) {
            c.column("pk", ColType::String);
            c.column("id", ColType::String).not_null();
            c.column("name", ColType::String);
            c.column("config", ColType::String).json_encoded().encrypted();
            c.column("active", ColType::Integer).default_value(json!(1));
        }
    }

    struct EventsTable;

    #[async_trait]
    impl TableSchema for EventsTable {
        fn name(&self) -> &'static str {
            "events"
        }

        fn pkey(&self) -> Option<&'static str> {
            Some("id")
        }

        fn new_pkey_value(&self) -> Option<Value> {
            None
        }

        fn configure(&self, c: &mut Columns) {
            c.column("id", ColType::Integer);
            c.column("label", ColType::String).not_null();
        }
    }

    async fn setup(encryption: EncryptionManager) -> (tempfile::TempDir, SqlDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqlDb::new(path.to_str().unwrap(), encryption).unwrap();
        db.add_table(Arc::new(ItemsTable)).unwrap();
        db.add_table(Arc::new(EventsTable)).unwrap();
        db.connection(async { db.check_structure().await }).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_insert_generates_uuid_pkey() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            let mut rec = gproxy_core::record([("id", json!("a")), ("name", json!("First"))]);
            table.insert(&mut rec, false).await?;
            let pk = rec.get("pk").unwrap().as_str().unwrap().to_string();
            assert_eq!(pk.len(), 36);

            let fetched = table.record(json!(pk.clone()), RecordOptions::default()).await?;
            assert_eq!(fetched.get("id").unwrap(), "a");
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_autoincrement_pkey_captured() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("events")?;
            let mut first = gproxy_core::record([("label", json!("one"))]);
            table.insert(&mut first, false).await?;
            let mut second = gproxy_core::record([("label", json!("two"))]);
            table.insert(&mut second, false).await?;
            assert_eq!(first.get("id").unwrap(), &json!(1));
            assert_eq!(second.get("id").unwrap(), &json!(2));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_not_found_and_ignore_missing() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            let err = table
                .record(json!("missing"), RecordOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ProxyError::NotFound(_)));

            let empty = table
                .record(
                    json!("missing"),
                    RecordOptions {
                        ignore_missing: true,
                        ..Default::default()
                    },
                )
                .await?;
            assert!(empty.is_empty());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_duplicate_detection() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            for pk in ["p1", "p2"] {
                let mut rec = gproxy_core::record([("id", json!("same"))]);
                rec.insert("pk".to_string(), json!(pk));
                table.insert(&mut rec, false).await?;
            }

            let where_ = gproxy_core::record([("id", json!("same"))]);
            let err = table
                .record(RecordKey::Where(where_.clone()), RecordOptions::default())
                .await
                .unwrap_err();
            match err {
                ProxyError::DuplicateRecord(msg) => assert!(msg.contains("found 2")),
                other => panic!("unexpected: {other:?}"),
            }

            let first = table
                .record(
                    RecordKey::Where(where_),
                    RecordOptions {
                        ignore_duplicate: true,
                        ..Default::default()
                    },
                )
                .await?;
            assert!(!first.is_empty());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_json_and_encrypted_round_trip() {
        let key = [5u8; 32];
        let (_dir, db) = setup(EncryptionManager::with_key(key)).await;
        db.connection(async {
            let table = db.table("items")?;
            let mut rec = gproxy_core::record([
                ("pk", json!("p1")),
                ("id", json!("acc")),
                ("config", json!({"user": "u", "password": "s3cret"})),
            ]);
            table.insert(&mut rec, false).await?;

            // Stored bytes are encrypted JSON text.
            let raw = table
                .record(
                    json!("p1"),
                    RecordOptions {
                        raw: true,
                        for_update: false,
                        ..Default::default()
                    },
                )
                .await?;
            let stored = raw.get("config").unwrap().as_str().unwrap();
            assert!(stored.starts_with("ENC:"));

            // Normal read decrypts and decodes.
            let fetched = table.record(json!("p1"), RecordOptions::default()).await?;
            assert_eq!(
                fetched.get("config").unwrap(),
                &json!({"user": "u", "password": "s3cret"})
            );
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_no_key_round_trips_plaintext() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            let mut rec = gproxy_core::record([
                ("pk", json!("p1")),
                ("id", json!("acc")),
                ("config", json!({"k": "v"})),
            ]);
            table.insert(&mut rec, false).await?;
            let fetched = table.record(json!("p1"), RecordOptions::default()).await?;
            assert_eq!(fetched.get("config").unwrap(), &json!({"k": "v"}));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_to_update_upsert_and_update() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;

            // Insert via upsert.
            let rec = table
                .record_to_update(
                    json!("p1"),
                    UpdateOptions::insert_missing(),
                    |rec| {
                        rec.insert("id".to_string(), json!("a"));
                        rec.insert("name".to_string(), json!("First"));
                        Ok(())
                    },
                )
                .await?;
            assert_eq!(rec.get("pk").unwrap(), "p1");

            // Mutate the existing row.
            table
                .record_to_update(json!("p1"), UpdateOptions::default(), |rec| {
                    rec.insert("name".to_string(), json!("Renamed"));
                    Ok(())
                })
                .await?;

            let fetched = table.record(json!("p1"), RecordOptions::default()).await?;
            assert_eq!(fetched.get("name").unwrap(), "Renamed");
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_to_update_missing_raises_at_exit() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            let err = table
                .record_to_update(json!("absent"), UpdateOptions::default(), |_rec| Ok(()))
                .await
                .unwrap_err();
            assert!(matches!(err, ProxyError::NotFound(_)));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_to_update_no_write_on_closure_error() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            let mut rec = gproxy_core::record([("pk", json!("p1")), ("id", json!("a")), ("name", json!("keep"))]);
            table.insert(&mut rec, false).await?;

            let result = table
                .record_to_update(json!("p1"), UpdateOptions::default(), |rec| {
                    rec.insert("name".to_string(), json!("clobbered"));
                    Err(ProxyError::internal("abort"))
                })
                .await;
            assert!(result.is_err());

            let fetched = table.record(json!("p1"), RecordOptions::default()).await?;
            assert_eq!(fetched.get("name").unwrap(), "keep");
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_batch_update_with_skip() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            for pk in ["p1", "p2", "p3"] {
                let mut rec =
                    gproxy_core::record([("pk", json!(pk)), ("id", json!(pk)), ("name", json!("old"))]);
                table.insert(&mut rec, false).await?;
            }

            let pkeys = vec![json!("p1"), json!("p2"), json!("p3"), json!("ghost")];
            let updated = table
                .batch_update(&pkeys, |rec| {
                    if rec.get("pk").unwrap() == "p2" {
                        return false;
                    }
                    rec.insert("name".to_string(), json!("new"));
                    true
                })
                .await?;
            assert_eq!(updated, 2);

            let p2 = table.record(json!("p2"), RecordOptions::default()).await?;
            assert_eq!(p2.get("name").unwrap(), "old");
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_batch_update_raw_single_statement() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            for pk in ["p1", "p2"] {
                let mut rec = gproxy_core::record([("pk", json!(pk)), ("id", json!(pk))]);
                table.insert(&mut rec, false).await?;
            }
            let updated = table
                .batch_update_raw(
                    &[json!("p1"), json!("p2")],
                    &gproxy_core::record([("name", json!("bulk"))]),
                )
                .await?;
            assert_eq!(updated, 2);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_transient_fields_not_persisted() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            let mut rec = gproxy_core::record([
                ("pk", json!("p1")),
                ("id", json!("a")),
                ("_secret", json!("returned-once")),
            ]);
            table.insert(&mut rec, false).await?;
            // Caller still sees the transient field...
            assert_eq!(rec.get("_secret").unwrap(), "returned-once");
            // ...but storage never does.
            let fetched = table.record(json!("p1"), RecordOptions::default()).await?;
            assert!(!fetched.contains_key("_secret"));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_sync_schema_idempotent() {
        let (_dir, db) = setup(EncryptionManager::disabled()).await;
        db.connection(async {
            let table = db.table("items")?;
            table.sync_schema().await?;
            table.sync_schema().await?;
            let mut rec = gproxy_core::record([("pk", json!("p1")), ("id", json!("a"))]);
            table.insert(&mut rec, false).await?;
            assert_eq!(table.count(None).await?, 1);
            Ok(())
        })
        .await
        .unwrap();
    }
}
