//! Tenant entity: table and endpoint.
//!
//! Tenants are the unit of scoping for every other entity. Each row
//! carries a hashed API key (the cleartext is returned exactly once,
//! via the transient `_api_key` field), an optional key expiry, and
//! per-tenant client configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gproxy_core::{ProxyError, Record, Result};
use gproxy_sql::{
    ColType, Columns, RecordKey, RecordOptions, SqlDb, Table, TableSchema, UpdateOptions,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::endpoint::{Endpoint, MethodSpec, ParamSpec, ParamType};
use crate::registry::{EndpointSeed, EntityDef};

/// Generate a fresh tenant API key.
pub fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}

/// Fixed digest used for token storage and lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Tenant configuration storage table.
///
/// Schema: id (PK), name, client_auth (JSON), client_base_url,
/// config (JSON), active, api_key_hash, api_key_expires_at, timestamps.
pub struct TenantsTable;

#[async_trait]
impl TableSchema for TenantsTable {
    fn name(&self) -> &'static str {
        "tenants"
    }

    fn pkey(&self) -> Option<&'static str> {
        Some("id")
    }

    fn configure(&self, c: &mut Columns) {
        c.column("id", ColType::String);
        c.column("name", ColType::String);
        c.column("client_auth", ColType::String).json_encoded();
        c.column("client_base_url", ColType::String);
        c.column("config", ColType::String).json_encoded();
        c.column("active", ColType::Integer).default_value(json!(1));
        c.column("api_key_hash", ColType::String);
        c.column("api_key_expires_at", ColType::Timestamp);
        c.column("created_at", ColType::Timestamp)
            .default_current_timestamp();
        c.column("updated_at", ColType::Timestamp)
            .default_current_timestamp();
    }

    fn new_pkey_value(&self) -> Option<Value> {
        // Tenant ids are caller-assigned.
        None
    }

    async fn on_inserting(&self, _table: &Table, record: &mut Record) -> Result<()> {
        // Every new tenant gets an API key; the cleartext is surfaced
        // once through the transient field and never persisted.
        if !record.contains_key("api_key_hash") {
            let api_key = generate_api_key();
            record.insert("api_key_hash".to_string(), json!(hash_token(&api_key)));
            record.insert("_api_key".to_string(), json!(api_key));
        }
        Ok(())
    }
}

/// Seed the `default` tenant for single-tenant deployments.
pub async fn ensure_default(table: &Table) -> Result<()> {
    table
        .record_to_update("default", UpdateOptions::insert_missing(), |rec| {
            if rec.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
                rec.insert("name".to_string(), json!("Default Tenant"));
                rec.insert("active".to_string(), json!(1));
            }
            Ok(())
        })
        .await?;
    Ok(())
}

/// Generate and store a new API key for a tenant, returning the
/// cleartext (only returned once, store securely).
pub async fn create_api_key(
    table: &Table,
    tenant_id: &str,
    expires_at: Option<&str>,
) -> Result<String> {
    let api_key = generate_api_key();
    let key_hash = hash_token(&api_key);
    let expires = expires_at.map(|e| json!(e)).unwrap_or(Value::Null);

    table
        .record_to_update(tenant_id, UpdateOptions::default(), move |rec| {
            rec.insert("api_key_hash".to_string(), json!(key_hash));
            rec.insert("api_key_expires_at".to_string(), expires);
            Ok(())
        })
        .await
        .map_err(|e| match e {
            ProxyError::NotFound(_) => {
                ProxyError::not_found(format!("tenant '{tenant_id}' not found"))
            }
            other => other,
        })?;

    Ok(api_key)
}

fn expiry_passed(value: &Value) -> bool {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc) < Utc::now())
            .unwrap_or(false),
        Value::Number(n) => n
            .as_i64()
            .map(|ts| ts < Utc::now().timestamp())
            .unwrap_or(false),
        _ => false,
    }
}

/// Resolve a tenant by presented token.
///
/// Hashes the token, matches `api_key_hash`, and treats keys past
/// their expiry as invalid. Requires an active connection scope.
pub async fn lookup_tenant_by_token(db: &SqlDb, token: &str) -> Result<Option<Record>> {
    let table = db.table("tenants")?;
    let mut where_ = Record::new();
    where_.insert("api_key_hash".to_string(), json!(hash_token(token)));

    let tenant = table
        .record(
            RecordKey::Where(where_),
            RecordOptions {
                ignore_missing: true,
                ignore_duplicate: true,
                ..Default::default()
            },
        )
        .await?;
    if tenant.is_empty() {
        return Ok(None);
    }
    if let Some(expiry) = tenant.get("api_key_expires_at") {
        if !expiry.is_null() && expiry_passed(expiry) {
            return Ok(None);
        }
    }
    Ok(Some(tenant))
}

/// REST/CLI endpoint for tenant management. Admin-only surface.
pub struct TenantEndpoint {
    table: Arc<Table>,
}

impl TenantEndpoint {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    async fn fetch(&self, tenant_id: &str) -> Result<Record> {
        self.table
            .record(
                RecordKey::Pkey(json!(tenant_id)),
                RecordOptions::default(),
            )
            .await
            .map_err(|e| match e {
                ProxyError::NotFound(_) => {
                    ProxyError::not_found(format!("tenant '{tenant_id}' not found"))
                }
                other => other,
            })
    }

    async fn upsert(&self, params: &Record) -> Result<Value> {
        let id = require_str(params, "id")?;
        let mut initial = Record::new();
        for field in ["name", "client_auth", "client_base_url", "config"] {
            if let Some(value) = params.get(field) {
                if !value.is_null() {
                    initial.insert(field.to_string(), value.clone());
                }
            }
        }
        let active = params
            .get("active")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let updated = self
            .table
            .record_to_update(
                id.as_str(),
                UpdateOptions {
                    insert_missing: true,
                    initial,
                    ..UpdateOptions::insert_missing()
                },
                |rec| {
                    rec.insert("active".to_string(), json!(if active { 1 } else { 0 }));
                    Ok(())
                },
            )
            .await?;

        let mut tenant = self.fetch(&id).await?;
        if let Some(api_key) = updated.get("_api_key") {
            tenant.insert("_api_key".to_string(), api_key.clone());
        }
        Ok(Value::Object(tenant))
    }

    async fn update(&self, params: &Record) -> Result<Value> {
        let tenant_id = require_str(params, "tenant_id")?;
        let fields: Vec<(&str, Value)> = [
            "name",
            "client_auth",
            "client_base_url",
            "config",
            "active",
        ]
        .iter()
        .filter_map(|f| {
            params
                .get(*f)
                .filter(|v| !v.is_null())
                .map(|v| (*f, v.clone()))
        })
        .collect();

        self.table
            .record_to_update(tenant_id.as_str(), UpdateOptions::default(), move |rec| {
                for (field, value) in fields {
                    let value = if field == "active" {
                        json!(if value.as_bool().unwrap_or(true) { 1 } else { 0 })
                    } else {
                        value
                    };
                    rec.insert(field.to_string(), value);
                }
                Ok(())
            })
            .await
            .map_err(|e| match e {
                ProxyError::NotFound(_) => {
                    ProxyError::not_found(format!("tenant '{tenant_id}' not found"))
                }
                other => other,
            })?;

        Ok(Value::Object(self.fetch(&tenant_id).await?))
    }
}

pub(crate) fn require_str(params: &Record, name: &str) -> Result<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ProxyError::validation(name, "field required"))
}

#[async_trait]
impl Endpoint for TenantEndpoint {
    fn name(&self) -> &'static str {
        "tenants"
    }

    fn admin_only(&self) -> bool {
        true
    }

    fn table(&self) -> Option<Arc<Table>> {
        Some(self.table.clone())
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("list")
                .param(ParamSpec::optional("active_only", ParamType::Bool, json!(false))),
            MethodSpec::new("get").param(ParamSpec::required("tenant_id", ParamType::Str)),
            MethodSpec::new("add")
                .post()
                .param(ParamSpec::required("id", ParamType::Str))
                .param(ParamSpec::optional("name", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("client_auth", ParamType::Map, Value::Null))
                .param(ParamSpec::optional("client_base_url", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("config", ParamType::Map, Value::Null))
                .param(ParamSpec::optional("active", ParamType::Bool, json!(true))),
            MethodSpec::new("update")
                .post()
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::optional("name", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("client_auth", ParamType::Map, Value::Null))
                .param(ParamSpec::optional("client_base_url", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("config", ParamType::Map, Value::Null))
                .param(ParamSpec::optional("active", ParamType::Bool, Value::Null)),
            MethodSpec::new("delete")
                .post()
                .param(ParamSpec::required("tenant_id", ParamType::Str)),
            MethodSpec::new("create_api_key")
                .post()
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::optional("expires_at", ParamType::Str, Value::Null)),
        ]
    }

    async fn call(&self, method: &str, params: Record) -> Result<Value> {
        match method {
            "list" => {
                let active_only = params
                    .get("active_only")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let where_ = active_only.then(|| {
                    let mut w = Record::new();
                    w.insert("active".to_string(), json!(1));
                    w
                });
                let tenants = self
                    .table
                    .select(None, where_.as_ref(), Some("id"), None)
                    .await?;
                Ok(Value::Array(tenants.into_iter().map(Value::Object).collect()))
            }
            "get" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                Ok(Value::Object(self.fetch(&tenant_id).await?))
            }
            "add" => self.upsert(&params).await,
            "update" => self.update(&params).await,
            "delete" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let mut where_ = Record::new();
                where_.insert("id".to_string(), json!(tenant_id));
                let deleted = self.table.delete(&where_, false).await?;
                Ok(json!(deleted))
            }
            "create_api_key" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let expires_at = params
                    .get("expires_at")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                let api_key =
                    create_api_key(&self.table, &tenant_id, expires_at.as_deref()).await?;
                Ok(json!({
                    "ok": true,
                    "tenant_id": tenant_id,
                    "api_key": api_key,
                }))
            }
            other => Err(ProxyError::not_found(format!(
                "method '{other}' not found on tenants"
            ))),
        }
    }
}

/// Entity definition for the registry.
pub fn entity() -> EntityDef {
    EntityDef {
        name: "tenants",
        lineage: &["TenantEndpoint"],
        table: Some(|| Arc::new(TenantsTable)),
        endpoint: |seed: &EndpointSeed| {
            Arc::new(TenantEndpoint::new(
                seed.table.clone().expect("tenants table registered"),
            ))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_core::EncryptionManager;

    async fn setup() -> (tempfile::TempDir, SqlDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqlDb::new(path.to_str().unwrap(), EncryptionManager::disabled()).unwrap();
        db.add_table(Arc::new(TenantsTable)).unwrap();
        db.connection(async { db.check_structure().await }).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_insert_generates_hashed_key() {
        let (_dir, db) = setup().await;
        db.connection(async {
            let table = db.table("tenants")?;
            let mut rec = gproxy_core::record([("id", json!("acme")), ("name", json!("Acme"))]);
            table.insert(&mut rec, false).await?;

            let api_key = rec.get("_api_key").unwrap().as_str().unwrap().to_string();
            let stored = table
                .record(RecordKey::Pkey(json!("acme")), RecordOptions::default())
                .await?;
            assert!(!stored.contains_key("_api_key"));
            assert_eq!(
                stored.get("api_key_hash").unwrap().as_str().unwrap(),
                hash_token(&api_key)
            );
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lookup_by_token() {
        let (_dir, db) = setup().await;
        db.connection(async {
            let table = db.table("tenants")?;
            let mut rec = gproxy_core::record([("id", json!("acme"))]);
            table.insert(&mut rec, false).await?;
            let api_key = rec.get("_api_key").unwrap().as_str().unwrap().to_string();

            let found = lookup_tenant_by_token(&db, &api_key).await?.unwrap();
            assert_eq!(found.get("id").unwrap(), "acme");

            assert!(lookup_tenant_by_token(&db, "wrong-token").await?.is_none());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_expired_key_is_invalid() {
        let (_dir, db) = setup().await;
        db.connection(async {
            let table = db.table("tenants")?;
            let mut rec = gproxy_core::record([("id", json!("acme"))]);
            table.insert(&mut rec, false).await?;

            let api_key = create_api_key(&table, "acme", Some("2000-01-01T00:00:00Z")).await?;
            assert!(lookup_tenant_by_token(&db, &api_key).await?.is_none());

            let api_key = create_api_key(&table, "acme", Some("2999-01-01T00:00:00Z")).await?;
            assert!(lookup_tenant_by_token(&db, &api_key).await?.is_some());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_add_list_get_delete() {
        let (_dir, db) = setup().await;
        let endpoint = TenantEndpoint::new(db.table("tenants").unwrap());

        let caller = crate::endpoint::CallerIdentity::admin();
        let added = crate::endpoint::invoke(
            &endpoint,
            "add",
            gproxy_core::record([("id", json!("acme")), ("name", json!("Acme Corp"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(added.get("id").unwrap(), "acme");
        assert!(added.get("_api_key").is_some());

        let listed = crate::endpoint::invoke(&endpoint, "list", Record::new(), &caller)
            .await
            .unwrap();
        let rows = listed.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").unwrap(), "Acme Corp");
        assert_eq!(rows[0].get("active").unwrap(), &json!(true));

        let fetched = crate::endpoint::invoke(
            &endpoint,
            "get",
            gproxy_core::record([("tenant_id", json!("acme"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(fetched.get("id").unwrap(), "acme");

        let err = crate::endpoint::invoke(
            &endpoint,
            "get",
            gproxy_core::record([("tenant_id", json!("ghost"))]),
            &caller,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));

        crate::endpoint::invoke(
            &endpoint,
            "delete",
            gproxy_core::record([("tenant_id", json!("acme"))]),
            &caller,
        )
        .await
        .unwrap();
        let listed = crate::endpoint::invoke(&endpoint, "list", Record::new(), &caller)
            .await
            .unwrap();
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_update_partial_fields() {
        let (_dir, db) = setup().await;
        let endpoint = TenantEndpoint::new(db.table("tenants").unwrap());
        let caller = crate::endpoint::CallerIdentity::admin();

        crate::endpoint::invoke(
            &endpoint,
            "add",
            gproxy_core::record([("id", json!("acme")), ("name", json!("Before"))]),
            &caller,
        )
        .await
        .unwrap();

        let updated = crate::endpoint::invoke(
            &endpoint,
            "update",
            gproxy_core::record([
                ("tenant_id", json!("acme")),
                ("name", json!("After")),
                ("active", json!(false)),
            ]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(updated.get("name").unwrap(), "After");
        assert_eq!(updated.get("active").unwrap(), &json!(false));
    }

    #[tokio::test]
    async fn test_ensure_default_idempotent() {
        let (_dir, db) = setup().await;
        db.connection(async {
            let table = db.table("tenants")?;
            ensure_default(&table).await?;
            ensure_default(&table).await?;
            let rec = table
                .record(RecordKey::Pkey(json!("default")), RecordOptions::default())
                .await?;
            assert_eq!(rec.get("name").unwrap(), "Default Tenant");
            assert_eq!(table.count(None).await?, 1);
            Ok(())
        })
        .await
        .unwrap();
    }
}
