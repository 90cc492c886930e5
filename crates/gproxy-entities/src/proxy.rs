//! Proxy composition: config, encryption, database, entities.
//!
//! A [`Proxy`] wires every manager together: it loads configuration
//! and the encryption key, opens the database manager, instantiates
//! the registered tables and endpoints, and drives the lifecycle
//! (init → run → shutdown). Channel crates (HTTP, CLI) consume a
//! shared `Arc<Proxy>`.

use gproxy_core::{EncryptionManager, ProxyConfig, ProxyError, Record, Result};
use gproxy_sql::SqlDb;
use gproxy_supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::entities::{builtin_entities, tenant};
use crate::registry::{EndpointSeed, EntityRegistry};

/// Composed proxy instance.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    db: SqlDb,
    supervisor: Arc<Supervisor>,
    endpoints: HashMap<String, Arc<dyn Endpoint>>,
    endpoint_order: Vec<String>,
}

impl Proxy {
    /// Build a proxy from configuration and an entity registry.
    ///
    /// The encryption key is loaded from the environment/secrets file;
    /// the supervisor uses the default base directory and the current
    /// executable as respawn command.
    pub fn new(config: ProxyConfig, registry: EntityRegistry) -> Result<Self> {
        let encryption = EncryptionManager::from_env();
        let supervisor = Supervisor::new(
            Supervisor::default_base_dir(None),
            std::env::current_exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "gproxy".to_string()),
        );
        Self::assemble(config, registry, encryption, supervisor)
    }

    /// Build with explicit collaborators (tests, embedded setups).
    pub fn assemble(
        config: ProxyConfig,
        registry: EntityRegistry,
        encryption: EncryptionManager,
        supervisor: Supervisor,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let supervisor = Arc::new(supervisor);
        let db = SqlDb::new(&config.db, encryption)?;

        // Tables first: endpoints receive their table through the seed.
        for def in registry.defs() {
            if let Some(schema) = registry.build_table_schema(def) {
                db.add_table(schema)?;
            }
        }

        let mut endpoints: HashMap<String, Arc<dyn Endpoint>> = HashMap::new();
        let mut endpoint_order: Vec<String> = Vec::new();
        for def in registry.defs() {
            let seed = EndpointSeed {
                table: def.table.map(|_| db.table(def.name)).transpose()?,
                supervisor: supervisor.clone(),
                config: config.clone(),
            };
            let endpoint = registry.build_endpoint(def, &seed);
            endpoint_order.push(def.name.to_string());
            endpoints.insert(def.name.to_string(), endpoint);
        }

        Ok(Self {
            config,
            db,
            supervisor,
            endpoints,
            endpoint_order,
        })
    }

    /// The bundled entity registry.
    pub fn builtin_registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register_all(builtin_entities());
        registry
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<ProxyConfig> {
        self.config.clone()
    }

    pub fn db(&self) -> &SqlDb {
        &self.db
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn endpoint(&self, name: &str) -> Result<Arc<dyn Endpoint>> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::not_found(format!("endpoint '{name}' not found")))
    }

    /// Endpoints in registration order.
    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.endpoint_order
            .iter()
            .filter_map(|name| self.endpoints.get(name).cloned())
            .collect()
    }

    /// Initialize the database: create missing tables, sync columns,
    /// and seed the default tenant on an empty tenants table.
    pub async fn init(&self) -> Result<()> {
        self.db
            .connection(async {
                self.db.check_structure().await?;
                self.db.sync_structure().await?;

                if let Ok(tenants) = self.db.table("tenants") {
                    if tenants.count(None).await? == 0 {
                        tenant::ensure_default(&tenants).await?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Record one state-changing invocation in the audit log.
    ///
    /// Best-effort: failures are logged and swallowed so auditing
    /// never breaks the request that triggered it.
    pub async fn audit(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        tenant_id: Option<&str>,
        response_status: Option<i64>,
        response_body: Option<&serde_json::Value>,
    ) {
        let Ok(table) = self.db.table("command_log") else {
            return;
        };
        let result = self
            .db
            .connection(async {
                crate::entities::command_log::log_command(
                    &table,
                    endpoint,
                    payload,
                    tenant_id,
                    response_status,
                    response_body,
                )
                .await
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(endpoint, error = %e, "audit log write failed");
        }
    }

    /// Close the database pool. Application shutdown only.
    pub async fn shutdown(&self) {
        self.db.shutdown().await;
    }
}

/// Look up a tenant by token outside a connection scope.
///
/// Used by the admin gate, which must distinguish live tenant tokens
/// (403) from garbage (401) before any endpoint runs.
pub async fn resolve_tenant_token(proxy: &Proxy, token: &str) -> Result<Option<Record>> {
    let db = proxy.db().clone();
    let token = token.to_string();
    db.connection(async { tenant::lookup_tenant_by_token(&db, &token).await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{invoke, CallerIdentity};
    use serde_json::json;

    pub(crate) async fn test_proxy(dir: &tempfile::TempDir) -> Proxy {
        let config = ProxyConfig {
            db: dir.path().join("test.db").to_string_lossy().into_owned(),
            ..ProxyConfig::default()
        };
        let supervisor = Supervisor::new(dir.path().join("instances"), "gproxy");
        let proxy = Proxy::assemble(
            config,
            Proxy::builtin_registry(),
            EncryptionManager::disabled(),
            supervisor,
        )
        .unwrap();
        proxy.init().await.unwrap();
        proxy
    }

    #[tokio::test]
    async fn test_builtin_entities_registered() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = test_proxy(&dir).await;

        for name in ["tenants", "accounts", "storages", "command_log", "instance", "proxy"] {
            assert!(proxy.endpoint(name).is_ok(), "missing endpoint {name}");
        }
        // Every entity except the process endpoint has a table.
        assert!(proxy.db().table("tenants").is_ok());
        assert!(proxy.endpoint("proxy").unwrap().table().is_none());
    }

    #[tokio::test]
    async fn test_init_is_idempotent_and_seeds_default_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = test_proxy(&dir).await;
        proxy.init().await.unwrap();

        let caller = CallerIdentity::admin();
        let tenants = invoke(
            &*proxy.endpoint("tenants").unwrap(),
            "list",
            Record::new(),
            &caller,
        )
        .await
        .unwrap();
        let rows = tenants.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id").unwrap(), "default");
    }

    #[tokio::test]
    async fn test_tenant_scoping_through_invoke() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = test_proxy(&dir).await;
        let caller = CallerIdentity::admin();

        // Create a tenant and capture its one-time API key.
        let tenant = invoke(
            &*proxy.endpoint("tenants").unwrap(),
            "add",
            gproxy_core::record([("id", json!("t1")), ("name", json!("Tenant One"))]),
            &caller,
        )
        .await
        .unwrap();
        let token = tenant.get("_api_key").unwrap().as_str().unwrap().to_string();

        // A tenant-token caller gets tenant_id injected.
        let accounts = proxy.endpoint("accounts").unwrap();
        let added = invoke(
            &*accounts,
            "add",
            gproxy_core::record([("id", json!("main")), ("name", json!("Main"))]),
            &CallerIdentity::with_token(&token),
        )
        .await
        .unwrap();
        assert_eq!(added.get("tenant_id").unwrap(), "t1");

        // A bogus token is rejected.
        let err = invoke(
            &*accounts,
            "list",
            Record::new(),
            &CallerIdentity::with_token("bogus"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidToken));
    }

    #[tokio::test]
    async fn test_audit_records_commands() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = test_proxy(&dir).await;

        proxy
            .audit(
                "POST /api/tenants/add",
                &json!({"id": "t1"}),
                None,
                Some(200),
                Some(&json!({"ok": true})),
            )
            .await;

        let caller = CallerIdentity::admin();
        let listed = invoke(
            &*proxy.endpoint("command_log").unwrap(),
            "list",
            Record::new(),
            &caller,
        )
        .await
        .unwrap();
        let rows = listed.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("endpoint").unwrap(), "POST /api/tenants/add");
    }

    #[tokio::test]
    async fn test_resolve_tenant_token_outside_scope() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = test_proxy(&dir).await;
        let caller = CallerIdentity::admin();

        let tenant = invoke(
            &*proxy.endpoint("tenants").unwrap(),
            "add",
            gproxy_core::record([("id", json!("t1"))]),
            &caller,
        )
        .await
        .unwrap();
        let token = tenant.get("_api_key").unwrap().as_str().unwrap();

        let resolved = resolve_tenant_token(&proxy, token).await.unwrap().unwrap();
        assert_eq!(resolved.get("id").unwrap(), "t1");
        assert!(resolve_tenant_token(&proxy, "nope").await.unwrap().is_none());
    }
}
