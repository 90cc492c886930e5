//! Storage entity: per-tenant named storage mounts.
//!
//! Each tenant can declare multiple named mounts (HOME, SALES, …) with
//! a protocol and an encrypted JSON config. Only the relational CRUD
//! surface lives here; the object-storage backends themselves are
//! external collaborators.

use async_trait::async_trait;
use gproxy_core::{ProxyError, Record, Result};
use gproxy_sql::{ColType, Columns, RecordKey, RecordOptions, Table, TableSchema, UpdateOptions};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::endpoint::{Endpoint, MethodSpec, ParamSpec, ParamType};
use crate::entities::tenant::require_str;
use crate::registry::{EndpointSeed, EntityDef};

/// Named storage backends per tenant.
pub struct StoragesTable;

#[async_trait]
impl TableSchema for StoragesTable {
    fn name(&self) -> &'static str {
        "storages"
    }

    fn pkey(&self) -> Option<&'static str> {
        Some("pk")
    }

    fn configure(&self, c: &mut Columns) {
        c.column("pk", ColType::String);
        c.column("tenant_id", ColType::String)
            .not_null()
            .relation("tenants", "id");
        c.column("name", ColType::String).not_null();
        c.column("protocol", ColType::String).not_null();
        c.column("config", ColType::String).json_encoded().encrypted();
        c.column("created_at", ColType::Timestamp)
            .default_current_timestamp();
        c.column("updated_at", ColType::Timestamp)
            .default_current_timestamp();
    }

    fn amend_create_table_sql(&self, sql: String) -> String {
        match sql.rfind(')') {
            Some(pos) => format!("{},\n    UNIQUE (\"tenant_id\", \"name\")\n)", &sql[..pos]),
            None => sql,
        }
    }
}

fn mount_key(tenant_id: &str, name: &str) -> Record {
    let mut key = Record::new();
    key.insert("tenant_id".to_string(), json!(tenant_id));
    key.insert("name".to_string(), json!(name));
    key
}

/// REST/CLI endpoint for storage mount management, tenant-scoped.
pub struct StorageEndpoint {
    table: Arc<Table>,
}

impl StorageEndpoint {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    async fn fetch(&self, tenant_id: &str, name: &str) -> Result<Record> {
        self.table
            .record(
                RecordKey::Where(mount_key(tenant_id, name)),
                RecordOptions::default(),
            )
            .await
            .map_err(|e| match e {
                ProxyError::NotFound(_) => ProxyError::not_found(format!(
                    "storage '{name}' not found for tenant '{tenant_id}'"
                )),
                other => other,
            })
    }
}

#[async_trait]
impl Endpoint for StorageEndpoint {
    fn name(&self) -> &'static str {
        "storages"
    }

    fn table(&self) -> Option<Arc<Table>> {
        Some(self.table.clone())
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("list").param(ParamSpec::required("tenant_id", ParamType::Str)),
            MethodSpec::new("get")
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::required("name", ParamType::Str)),
            MethodSpec::new("add")
                .post()
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::required("name", ParamType::Str))
                .param(ParamSpec::required("protocol", ParamType::Str))
                .param(ParamSpec::optional("config", ParamType::Map, Value::Null)),
            MethodSpec::new("delete")
                .post()
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::required("name", ParamType::Str)),
        ]
    }

    async fn call(&self, method: &str, params: Record) -> Result<Value> {
        match method {
            "list" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let mut where_ = Record::new();
                where_.insert("tenant_id".to_string(), json!(tenant_id));
                let mounts = self
                    .table
                    .select(None, Some(&where_), Some("name"), None)
                    .await?;
                Ok(Value::Array(mounts.into_iter().map(Value::Object).collect()))
            }
            "get" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let name = require_str(&params, "name")?;
                Ok(Value::Object(self.fetch(&tenant_id, &name).await?))
            }
            "add" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let name = require_str(&params, "name")?;
                let protocol = require_str(&params, "protocol")?;
                let config = params.get("config").cloned().unwrap_or(Value::Null);

                self.table
                    .record_to_update(
                        RecordKey::Where(mount_key(&tenant_id, &name)),
                        UpdateOptions::insert_missing(),
                        move |rec| {
                            rec.insert("protocol".to_string(), json!(protocol));
                            rec.insert("config".to_string(), config);
                            Ok(())
                        },
                    )
                    .await?;
                Ok(Value::Object(self.fetch(&tenant_id, &name).await?))
            }
            "delete" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let name = require_str(&params, "name")?;
                let deleted = self
                    .table
                    .delete(&mount_key(&tenant_id, &name), false)
                    .await?;
                Ok(json!(deleted))
            }
            other => Err(ProxyError::not_found(format!(
                "method '{other}' not found on storages"
            ))),
        }
    }
}

/// Entity definition for the registry.
pub fn entity() -> EntityDef {
    EntityDef {
        name: "storages",
        lineage: &["StorageEndpoint"],
        table: Some(|| Arc::new(StoragesTable)),
        endpoint: |seed: &EndpointSeed| {
            Arc::new(StorageEndpoint::new(
                seed.table.clone().expect("storages table registered"),
            ))
        },
    }
}
