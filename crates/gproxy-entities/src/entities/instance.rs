//! Instance entity: singleton configuration row.
//!
//! Instance-wide settings live in a single row (id = 1) with typed
//! columns for the common settings (name, api_token, edition) and a
//! free-form JSON `config` column for everything else.

use async_trait::async_trait;
use gproxy_core::{ProxyError, Record, Result};
use gproxy_sql::{ColType, Columns, RecordKey, RecordOptions, Table, TableSchema, UpdateOptions};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::endpoint::{Endpoint, MethodSpec, ParamSpec, ParamType};
use crate::entities::tenant::require_str;
use crate::registry::{EndpointSeed, EntityDef};

/// Settings stored in typed columns rather than the JSON config.
const TYPED_CONFIG_KEYS: [&str; 3] = ["name", "api_token", "edition"];

/// Singleton table for instance-level configuration.
pub struct InstanceTable;

#[async_trait]
impl TableSchema for InstanceTable {
    fn name(&self) -> &'static str {
        "instance"
    }

    fn pkey(&self) -> Option<&'static str> {
        Some("id")
    }

    fn new_pkey_value(&self) -> Option<Value> {
        // The singleton row is always inserted with id = 1.
        None
    }

    fn configure(&self, c: &mut Columns) {
        c.column("id", ColType::Integer);
        c.column("name", ColType::String).default_value(json!("proxy"));
        c.column("api_token", ColType::String);
        c.column("edition", ColType::String).default_value(json!("ce"));
        c.column("config", ColType::String).json_encoded();
        c.column("created_at", ColType::Timestamp)
            .default_current_timestamp();
        c.column("updated_at", ColType::Timestamp)
            .default_current_timestamp();
    }
}

/// Get or create the singleton row.
pub async fn ensure_instance(table: &Table) -> Result<Record> {
    let existing = table
        .record(
            RecordKey::Pkey(json!(1)),
            RecordOptions {
                ignore_missing: true,
                ..Default::default()
            },
        )
        .await?;
    if !existing.is_empty() {
        return Ok(existing);
    }
    let mut record = gproxy_core::record([("id", json!(1))]);
    table.insert(&mut record, false).await?;
    table
        .record(RecordKey::Pkey(json!(1)), RecordOptions::default())
        .await
}

/// Apply updates to the singleton row.
pub async fn update_instance(table: &Table, updates: Record) -> Result<Record> {
    ensure_instance(table).await?;
    table
        .record_to_update(RecordKey::Pkey(json!(1)), UpdateOptions::default(), |rec| {
            for (key, value) in updates {
                rec.insert(key, value);
            }
            Ok(())
        })
        .await
}

/// REST/CLI endpoint for the instance singleton. Admin-only surface.
pub struct InstanceEndpoint {
    table: Arc<Table>,
}

impl InstanceEndpoint {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Endpoint for InstanceEndpoint {
    fn name(&self) -> &'static str {
        "instance"
    }

    fn admin_only(&self) -> bool {
        true
    }

    fn table(&self) -> Option<Arc<Table>> {
        Some(self.table.clone())
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("status"),
            MethodSpec::new("get"),
            MethodSpec::new("update")
                .post()
                .param(ParamSpec::optional("name", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("api_token", ParamType::Str, Value::Null))
                .param(ParamSpec::optional(
                    "edition",
                    ParamType::Choice(&["ce", "ee"]),
                    Value::Null,
                )),
            MethodSpec::new("get_config").param(ParamSpec::required("key", ParamType::Str)),
            MethodSpec::new("set_config")
                .post()
                .param(ParamSpec::required("key", ParamType::Str))
                .param(ParamSpec::required("value", ParamType::Str)),
        ]
    }

    async fn call(&self, method: &str, params: Record) -> Result<Value> {
        match method {
            "status" => {
                let row = ensure_instance(&self.table).await?;
                Ok(json!({
                    "ok": true,
                    "name": row.get("name"),
                    "edition": row.get("edition"),
                }))
            }
            "get" => {
                let mut row = ensure_instance(&self.table).await?;
                // The admin token is configuration, never echoed back.
                row.remove("api_token");
                let mut result = gproxy_core::record([("ok", json!(true))]);
                result.extend(row);
                Ok(Value::Object(result))
            }
            "update" => {
                let updates: Record = ["name", "api_token", "edition"]
                    .iter()
                    .filter_map(|f| {
                        params
                            .get(*f)
                            .filter(|v| !v.is_null())
                            .map(|v| (f.to_string(), v.clone()))
                    })
                    .collect();
                if !updates.is_empty() {
                    update_instance(&self.table, updates).await?;
                }
                Ok(json!({"ok": true}))
            }
            "get_config" => {
                let key = require_str(&params, "key")?;
                let row = ensure_instance(&self.table).await?;
                let value = if TYPED_CONFIG_KEYS.contains(&key.as_str()) {
                    row.get(&key).cloned()
                } else {
                    row.get("config")
                        .and_then(Value::as_object)
                        .and_then(|config| config.get(&key))
                        .cloned()
                };
                Ok(json!({"key": key, "value": value}))
            }
            "set_config" => {
                let key = require_str(&params, "key")?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                if TYPED_CONFIG_KEYS.contains(&key.as_str()) {
                    let mut updates = Record::new();
                    updates.insert(key.clone(), value);
                    update_instance(&self.table, updates).await?;
                } else {
                    let row = ensure_instance(&self.table).await?;
                    let mut config = row
                        .get("config")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    config.insert(key.clone(), value);
                    let mut updates = Record::new();
                    updates.insert("config".to_string(), Value::Object(config));
                    update_instance(&self.table, updates).await?;
                }
                Ok(json!({"ok": true}))
            }
            other => Err(ProxyError::not_found(format!(
                "method '{other}' not found on instance"
            ))),
        }
    }
}

/// Entity definition for the registry.
pub fn entity() -> EntityDef {
    EntityDef {
        name: "instance",
        lineage: &["InstanceEndpoint"],
        table: Some(|| Arc::new(InstanceTable)),
        endpoint: |seed: &EndpointSeed| {
            Arc::new(InstanceEndpoint::new(
                seed.table.clone().expect("instance table registered"),
            ))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{invoke, CallerIdentity};
    use gproxy_core::EncryptionManager;
    use gproxy_sql::SqlDb;

    async fn setup() -> (tempfile::TempDir, SqlDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqlDb::new(path.to_str().unwrap(), EncryptionManager::disabled()).unwrap();
        db.add_table(Arc::new(InstanceTable)).unwrap();
        db.connection(async { db.check_structure().await }).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_singleton_created_on_first_access() {
        let (_dir, db) = setup().await;
        let endpoint = InstanceEndpoint::new(db.table("instance").unwrap());
        let caller = CallerIdentity::admin();

        let got = invoke(&endpoint, "get", Record::new(), &caller).await.unwrap();
        assert_eq!(got.get("id").unwrap(), &json!(1));
        assert_eq!(got.get("name").unwrap(), "proxy");
        assert_eq!(got.get("edition").unwrap(), "ce");

        db.connection(async {
            assert_eq!(db.table("instance")?.count(None).await?, 1);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_update_and_edition_choice() {
        let (_dir, db) = setup().await;
        let endpoint = InstanceEndpoint::new(db.table("instance").unwrap());
        let caller = CallerIdentity::admin();

        invoke(
            &endpoint,
            "update",
            gproxy_core::record([("name", json!("production")), ("edition", json!("ee"))]),
            &caller,
        )
        .await
        .unwrap();

        let got = invoke(&endpoint, "get", Record::new(), &caller).await.unwrap();
        assert_eq!(got.get("name").unwrap(), "production");
        assert_eq!(got.get("edition").unwrap(), "ee");

        let err = invoke(
            &endpoint,
            "update",
            gproxy_core::record([("edition", json!("pro"))]),
            &caller,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_config_dual_routing() {
        let (_dir, db) = setup().await;
        let endpoint = InstanceEndpoint::new(db.table("instance").unwrap());
        let caller = CallerIdentity::admin();

        // Typed key routes to the column.
        invoke(
            &endpoint,
            "set_config",
            gproxy_core::record([("key", json!("name")), ("value", json!("renamed"))]),
            &caller,
        )
        .await
        .unwrap();

        // Free-form key routes to the JSON config.
        invoke(
            &endpoint,
            "set_config",
            gproxy_core::record([("key", json!("sync_interval")), ("value", json!("30"))]),
            &caller,
        )
        .await
        .unwrap();

        let name = invoke(
            &endpoint,
            "get_config",
            gproxy_core::record([("key", json!("name"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(name.get("value").unwrap(), "renamed");

        let interval = invoke(
            &endpoint,
            "get_config",
            gproxy_core::record([("key", json!("sync_interval"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(interval.get("value").unwrap(), "30");
    }

    #[tokio::test]
    async fn test_get_never_returns_api_token() {
        let (_dir, db) = setup().await;
        let endpoint = InstanceEndpoint::new(db.table("instance").unwrap());
        let caller = CallerIdentity::admin();

        invoke(
            &endpoint,
            "update",
            gproxy_core::record([("api_token", json!("super-secret"))]),
            &caller,
        )
        .await
        .unwrap();

        let got = invoke(&endpoint, "get", Record::new(), &caller).await.unwrap();
        assert!(got.get("api_token").is_none());
    }
}
