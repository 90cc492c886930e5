//! Default CRUD surface for entity endpoints.
//!
//! The minimum useful operations over a table — `list`, `get`, `add`,
//! `delete` — expressed once so endpoints can delegate to them and
//! override only what their domain needs. The bundled entities
//! override most of these (composite keys, upserts, scoping); a
//! minimal entity can expose a table with nothing but these defaults.

use gproxy_core::{ProxyError, Record, Result};
use gproxy_sql::{RecordKey, RecordOptions, Table};
use serde_json::{json, Value};

use crate::endpoint::{MethodSpec, ParamSpec, ParamType};

/// Descriptors for the default CRUD methods.
pub fn default_methods() -> Vec<MethodSpec> {
    vec![
        MethodSpec::new("list"),
        MethodSpec::new("get").param(ParamSpec::required("id", ParamType::Str)),
        MethodSpec::new("add")
            .post()
            .param(ParamSpec::required("id", ParamType::Str))
            .param(ParamSpec::optional("data", ParamType::Map, Value::Null)),
        MethodSpec::new("delete")
            .post()
            .param(ParamSpec::required("id", ParamType::Str)),
    ]
}

/// List all records.
pub async fn list(table: &Table) -> Result<Value> {
    let rows = table.select(None, None, None, None).await?;
    Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
}

/// Get a single record by primary key.
pub async fn get(table: &Table, entity: &str, id: &str) -> Result<Value> {
    let record = table
        .record(RecordKey::Pkey(json!(id)), RecordOptions::default())
        .await
        .map_err(|e| match e {
            ProxyError::NotFound(_) => ProxyError::not_found(format!("{entity} '{id}' not found")),
            other => other,
        })?;
    Ok(Value::Object(record))
}

/// Add a record: the primary key plus any extra fields.
pub async fn add(table: &Table, params: &Record) -> Result<Value> {
    let pkey = table.pkey().unwrap_or("id");
    let id = params
        .get("id")
        .cloned()
        .ok_or_else(|| ProxyError::validation("id", "field required"))?;

    let mut record = Record::new();
    record.insert(pkey.to_string(), id);
    if let Some(Value::Object(data)) = params.get("data") {
        for (k, v) in data {
            record.insert(k.clone(), v.clone());
        }
    }
    table.insert(&mut record, false).await?;
    Ok(Value::Object(record))
}

/// Delete a record by primary key.
pub async fn delete(table: &Table, id: &str) -> Result<Value> {
    let pkey = table.pkey().unwrap_or("id");
    let mut where_ = Record::new();
    where_.insert(pkey.to_string(), json!(id));
    table.delete(&where_, false).await?;
    Ok(Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{invoke, CallerIdentity, Endpoint};
    use async_trait::async_trait;
    use gproxy_core::EncryptionManager;
    use gproxy_sql::{ColType, Columns, SqlDb, TableSchema};
    use std::sync::Arc;

    struct NotesTable;

    #[async_trait]
    impl TableSchema for NotesTable {
        fn name(&self) -> &'static str {
            "notes"
        }

        fn pkey(&self) -> Option<&'static str> {
            Some("id")
        }

        fn new_pkey_value(&self) -> Option<Value> {
            None
        }

        fn configure(&self, c: &mut Columns) {
            c.column("id", ColType::String);
            c.column("text", ColType::String);
        }
    }

    /// An endpoint that only uses the defaults.
    struct NotesEndpoint {
        table: Arc<Table>,
    }

    #[async_trait]
    impl Endpoint for NotesEndpoint {
        fn name(&self) -> &'static str {
            "notes"
        }

        fn methods(&self) -> Vec<MethodSpec> {
            default_methods()
        }

        fn table(&self) -> Option<Arc<Table>> {
            Some(self.table.clone())
        }

        async fn call(&self, method: &str, params: Record) -> Result<Value> {
            match method {
                "list" => list(&self.table).await,
                "get" => {
                    let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
                    get(&self.table, self.name(), id).await
                }
                "add" => add(&self.table, &params).await,
                "delete" => {
                    let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
                    delete(&self.table, id).await
                }
                other => Err(ProxyError::not_found(format!("method '{other}'"))),
            }
        }
    }

    async fn setup() -> (tempfile::TempDir, NotesEndpoint) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqlDb::new(path.to_str().unwrap(), EncryptionManager::disabled()).unwrap();
        db.add_table(Arc::new(NotesTable)).unwrap();
        db.connection(async { db.check_structure().await }).await.unwrap();
        let endpoint = NotesEndpoint {
            table: db.table("notes").unwrap(),
        };
        (dir, endpoint)
    }

    #[tokio::test]
    async fn test_default_crud_cycle() {
        let (_dir, endpoint) = setup().await;
        let caller = CallerIdentity::admin();

        let added = invoke(
            &endpoint,
            "add",
            gproxy_core::record([("id", json!("n1")), ("data", json!({"text": "hello"}))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(added.get("text").unwrap(), "hello");

        let got = invoke(
            &endpoint,
            "get",
            gproxy_core::record([("id", json!("n1"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(got.get("id").unwrap(), "n1");

        let listed = invoke(&endpoint, "list", Record::new(), &caller).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        invoke(
            &endpoint,
            "delete",
            gproxy_core::record([("id", json!("n1"))]),
            &caller,
        )
        .await
        .unwrap();
        let listed = invoke(&endpoint, "list", Record::new(), &caller).await.unwrap();
        assert!(listed.as_array().unwrap().is_empty());

        let err = invoke(
            &endpoint,
            "get",
            gproxy_core::record([("id", json!("n1"))]),
            &caller,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }
}
