//! Account entity: per-tenant account configurations.
//!
//! Generic accounts keyed by UUID with a UNIQUE (tenant_id, id)
//! constraint; the `config` column is JSON-encoded and encrypted.
//! Domain proxies subclass the endpoint with their own fields.

use async_trait::async_trait;
use gproxy_core::{ProxyError, Record, Result};
use gproxy_sql::{ColType, Columns, RecordKey, RecordOptions, Table, TableSchema, UpdateOptions};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::endpoint::{Endpoint, MethodSpec, ParamSpec, ParamType};
use crate::entities::tenant::require_str;
use crate::registry::{EndpointSeed, EntityDef};

/// Generic account configurations for multi-tenant resources.
pub struct AccountsTable;

#[async_trait]
impl TableSchema for AccountsTable {
    fn name(&self) -> &'static str {
        "accounts"
    }

    fn pkey(&self) -> Option<&'static str> {
        Some("pk")
    }

    fn configure(&self, c: &mut Columns) {
        c.column("pk", ColType::String);
        c.column("id", ColType::String).not_null();
        c.column("tenant_id", ColType::String)
            .not_null()
            .relation("tenants", "id");
        c.column("name", ColType::String);
        c.column("config", ColType::String).json_encoded().encrypted();
        c.column("created_at", ColType::Timestamp)
            .default_current_timestamp();
        c.column("updated_at", ColType::Timestamp)
            .default_current_timestamp();
    }

    fn amend_create_table_sql(&self, sql: String) -> String {
        match sql.rfind(')') {
            Some(pos) => format!("{},\n    UNIQUE (\"tenant_id\", \"id\")\n)", &sql[..pos]),
            None => sql,
        }
    }

    async fn after_sync_schema(&self, table: &Table) -> Result<()> {
        let sql = "CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_tenant_id \
                   ON accounts (\"tenant_id\", \"id\")";
        if let Err(e) = table.execute(sql, &Record::new()).await {
            tracing::debug!(error = %e, "accounts unique index skipped");
        }
        Ok(())
    }
}

/// Upsert an account by (tenant_id, id), returning its UUID.
pub async fn add_account(table: &Table, acc: &Record) -> Result<String> {
    let tenant_id = require_str(acc, "tenant_id")?;
    let account_id = require_str(acc, "id")?;

    let mut key = Record::new();
    key.insert("tenant_id".to_string(), json!(tenant_id));
    key.insert("id".to_string(), json!(account_id));

    let name = acc
        .get("name")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| account_id.clone());
    let config = acc.get("config").cloned().unwrap_or(Value::Null);

    let record = table
        .record_to_update(
            RecordKey::Where(key),
            UpdateOptions::insert_missing(),
            move |rec| {
                rec.insert("name".to_string(), json!(name));
                rec.insert("config".to_string(), config);
                Ok(())
            },
        )
        .await?;

    record
        .get("pk")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ProxyError::internal("account upsert produced no pk"))
}

/// Fetch one account scoped to a tenant.
pub async fn get_account(table: &Table, tenant_id: &str, account_id: &str) -> Result<Record> {
    let mut where_ = Record::new();
    where_.insert("tenant_id".to_string(), json!(tenant_id));
    where_.insert("id".to_string(), json!(account_id));
    table
        .record(RecordKey::Where(where_), RecordOptions::default())
        .await
        .map_err(|e| match e {
            ProxyError::NotFound(_) => ProxyError::not_found(format!(
                "account '{account_id}' not found for tenant '{tenant_id}'"
            )),
            other => other,
        })
}

/// REST/CLI endpoint for account management, tenant-scoped.
pub struct AccountEndpoint {
    table: Arc<Table>,
}

impl AccountEndpoint {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Endpoint for AccountEndpoint {
    fn name(&self) -> &'static str {
        "accounts"
    }

    fn table(&self) -> Option<Arc<Table>> {
        Some(self.table.clone())
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("list").param(ParamSpec::required("tenant_id", ParamType::Str)),
            MethodSpec::new("get")
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::required("account_id", ParamType::Str)),
            MethodSpec::new("add")
                .post()
                .param(ParamSpec::required("id", ParamType::Str))
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::optional("name", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("config", ParamType::Map, Value::Null)),
            MethodSpec::new("delete")
                .post()
                .param(ParamSpec::required("tenant_id", ParamType::Str))
                .param(ParamSpec::required("account_id", ParamType::Str)),
        ]
    }

    async fn call(&self, method: &str, params: Record) -> Result<Value> {
        match method {
            "list" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let mut where_ = Record::new();
                where_.insert("tenant_id".to_string(), json!(tenant_id));
                let accounts = self
                    .table
                    .select(None, Some(&where_), Some("id"), None)
                    .await?;
                Ok(Value::Array(
                    accounts.into_iter().map(Value::Object).collect(),
                ))
            }
            "get" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let account_id = require_str(&params, "account_id")?;
                Ok(Value::Object(
                    get_account(&self.table, &tenant_id, &account_id).await?,
                ))
            }
            "add" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let account_id = require_str(&params, "id")?;
                add_account(&self.table, &params).await?;
                Ok(Value::Object(
                    get_account(&self.table, &tenant_id, &account_id).await?,
                ))
            }
            "delete" => {
                let tenant_id = require_str(&params, "tenant_id")?;
                let account_id = require_str(&params, "account_id")?;
                let mut where_ = Record::new();
                where_.insert("tenant_id".to_string(), json!(tenant_id));
                where_.insert("id".to_string(), json!(account_id));
                let deleted = self.table.delete(&where_, false).await?;
                Ok(json!(deleted))
            }
            other => Err(ProxyError::not_found(format!(
                "method '{other}' not found on accounts"
            ))),
        }
    }
}

/// Entity definition for the registry.
pub fn entity() -> EntityDef {
    EntityDef {
        name: "accounts",
        lineage: &["AccountEndpoint"],
        table: Some(|| Arc::new(AccountsTable)),
        endpoint: |seed: &EndpointSeed| {
            Arc::new(AccountEndpoint::new(
                seed.table.clone().expect("accounts table registered"),
            ))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{invoke, CallerIdentity};
    use crate::entities::tenant::TenantsTable;
    use gproxy_core::EncryptionManager;
    use gproxy_sql::SqlDb;

    async fn setup() -> (tempfile::TempDir, SqlDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqlDb::new(
            path.to_str().unwrap(),
            EncryptionManager::with_key([1u8; 32]),
        )
        .unwrap();
        db.add_table(Arc::new(TenantsTable)).unwrap();
        db.add_table(Arc::new(AccountsTable)).unwrap();
        db.connection(async {
            db.check_structure().await?;
            let tenants = db.table("tenants")?;
            let mut rec = gproxy_core::record([("id", json!("t1"))]);
            tenants.insert(&mut rec, false).await?;
            Ok(())
        })
        .await
        .unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_add_is_upsert_on_composite_key() {
        let (_dir, db) = setup().await;
        let endpoint = AccountEndpoint::new(db.table("accounts").unwrap());
        let caller = CallerIdentity::admin();

        let first = invoke(
            &endpoint,
            "add",
            gproxy_core::record([
                ("id", json!("main")),
                ("tenant_id", json!("t1")),
                ("config", json!({"host": "smtp.example.com"})),
            ]),
            &caller,
        )
        .await
        .unwrap();
        let pk = first.get("pk").unwrap().as_str().unwrap().to_string();

        let second = invoke(
            &endpoint,
            "add",
            gproxy_core::record([
                ("id", json!("main")),
                ("tenant_id", json!("t1")),
                ("name", json!("Main Account")),
            ]),
            &caller,
        )
        .await
        .unwrap();
        // Same row, same pk.
        assert_eq!(second.get("pk").unwrap().as_str().unwrap(), pk);
        assert_eq!(second.get("name").unwrap(), "Main Account");

        db.connection(async {
            assert_eq!(db.table("accounts")?.count(None).await?, 1);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_scoped_to_tenant() {
        let (_dir, db) = setup().await;
        let endpoint = AccountEndpoint::new(db.table("accounts").unwrap());
        let caller = CallerIdentity::admin();

        invoke(
            &endpoint,
            "add",
            gproxy_core::record([("id", json!("main")), ("tenant_id", json!("t1"))]),
            &caller,
        )
        .await
        .unwrap();

        // Another tenant does not see it.
        let err = invoke(
            &endpoint,
            "get",
            gproxy_core::record([("tenant_id", json!("t2")), ("account_id", json!("main"))]),
            &caller,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_config_encrypted_at_rest() {
        let (_dir, db) = setup().await;
        let endpoint = AccountEndpoint::new(db.table("accounts").unwrap());
        let caller = CallerIdentity::admin();

        invoke(
            &endpoint,
            "add",
            gproxy_core::record([
                ("id", json!("main")),
                ("tenant_id", json!("t1")),
                ("config", json!({"password": "hunter2"})),
            ]),
            &caller,
        )
        .await
        .unwrap();

        db.connection(async {
            let raw = db
                .fetch_one(
                    "SELECT config FROM accounts WHERE id = :id",
                    &gproxy_core::record([("id", json!("main"))]),
                )
                .await?
                .unwrap();
            let stored = raw.get("config").unwrap().as_str().unwrap();
            assert!(stored.starts_with("ENC:"));
            assert!(!stored.contains("hunter2"));
            Ok(())
        })
        .await
        .unwrap();

        let fetched = invoke(
            &endpoint,
            "get",
            gproxy_core::record([("tenant_id", json!("t1")), ("account_id", json!("main"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(fetched.get("config").unwrap(), &json!({"password": "hunter2"}));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let (_dir, db) = setup().await;
        let endpoint = AccountEndpoint::new(db.table("accounts").unwrap());
        let caller = CallerIdentity::admin();

        for id in ["a", "b"] {
            invoke(
                &endpoint,
                "add",
                gproxy_core::record([("id", json!(id)), ("tenant_id", json!("t1"))]),
                &caller,
            )
            .await
            .unwrap();
        }

        let listed = invoke(
            &endpoint,
            "list",
            gproxy_core::record([("tenant_id", json!("t1"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);

        invoke(
            &endpoint,
            "delete",
            gproxy_core::record([("tenant_id", json!("t1")), ("account_id", json!("a"))]),
            &caller,
        )
        .await
        .unwrap();

        let listed = invoke(
            &endpoint,
            "list",
            gproxy_core::record([("tenant_id", json!("t1"))]),
            &caller,
        )
        .await
        .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }
}
