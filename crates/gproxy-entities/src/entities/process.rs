//! Proxy process endpoint: serve/stop/restart/list over instances.
//!
//! Unlike the other entities this endpoint has no table; it operates
//! on the filesystem instance tree through the supervisor. `serve` is
//! CLI-only by default (starting a server from inside the server makes
//! no sense); stop/restart/list are also exposed over the API for
//! operators.

use async_trait::async_trait;
use gproxy_core::{ProxyConfig, ProxyError, Record, Result};
use gproxy_supervisor::Supervisor;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::endpoint::{Endpoint, MethodSpec, ParamSpec, ParamType};
use crate::entities::tenant::require_str;
use crate::registry::{EndpointSeed, EntityDef};

/// Endpoint for proxy server and instance management.
pub struct ProxyEndpoint {
    supervisor: Arc<Supervisor>,
    config: Arc<ProxyConfig>,
}

impl ProxyEndpoint {
    pub fn new(supervisor: Arc<Supervisor>, config: Arc<ProxyConfig>) -> Self {
        Self { supervisor, config }
    }

    /// Start (or describe how to start) an instance.
    ///
    /// Already-running instances return their status immediately. In
    /// background mode the instance is spawned detached and the PID
    /// file polled; in foreground mode the effective configuration and
    /// environment are returned for the caller to run the server.
    async fn serve(&self, params: &Record) -> Result<Value> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let host_override = params
            .get("host")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let port_override = params
            .get("port")
            .and_then(Value::as_i64)
            .and_then(|p| u16::try_from(p).ok());
        let background = params
            .get("background")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let (running, pid, running_port) = self.supervisor.is_running(&name);
        if running {
            return Ok(json!({
                "ok": true,
                "already_running": true,
                "name": name,
                "pid": pid,
                "port": running_port,
                "url": format!("http://localhost:{}", running_port.unwrap_or(self.config.port)),
            }));
        }

        let existing = self.supervisor.read_config(&name);
        let (host, port) = match &existing {
            Some(config) => (
                host_override.unwrap_or_else(|| config.host.clone()),
                port_override.unwrap_or(config.port),
            ),
            None => (
                host_override.unwrap_or_else(|| "0.0.0.0".to_string()),
                port_override.unwrap_or(self.config.port),
            ),
        };
        let instance = self.supervisor.ensure_config(&name, &host, port)?;

        if background {
            let pid = self.supervisor.spawn_background(&name, &host, port).await?;
            return Ok(json!({
                "ok": true,
                "background": true,
                "name": name,
                "pid": pid,
                "port": port,
                "host": host,
                "url": format!("http://localhost:{port}"),
                "started": pid.is_some(),
            }));
        }

        Ok(json!({
            "ok": true,
            "name": name,
            "host": host,
            "port": port,
            "db_path": instance.db_path,
            "config_file": self.supervisor.config_file(&name).to_string_lossy(),
            "env": {
                "GENRO_PROXY_DB": instance.db_path,
                "GENRO_PROXY_INSTANCE": name,
                "GENRO_PROXY_HOST": host,
                "GENRO_PROXY_PORT": port.to_string(),
            },
        }))
    }
}

#[async_trait]
impl Endpoint for ProxyEndpoint {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn admin_only(&self) -> bool {
        true
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("serve")
                .post()
                .api(false)
                .param(ParamSpec::optional("name", ParamType::Str, json!("default")))
                .param(ParamSpec::optional("host", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("port", ParamType::Int, Value::Null))
                .param(ParamSpec::optional("background", ParamType::Bool, json!(false))),
            MethodSpec::new("list_instances"),
            MethodSpec::new("stop")
                .post()
                .param(ParamSpec::optional("name", ParamType::Str, json!("*")))
                .param(ParamSpec::optional("force", ParamType::Bool, json!(false))),
            MethodSpec::new("restart")
                .post()
                .param(ParamSpec::optional("name", ParamType::Str, json!("*")))
                .param(ParamSpec::optional("force", ParamType::Bool, json!(false))),
        ]
    }

    async fn call(&self, method: &str, params: Record) -> Result<Value> {
        match method {
            "serve" => self.serve(&params).await,
            "list_instances" => {
                let instances = self.supervisor.list_instances();
                Ok(json!({"ok": true, "instances": instances}))
            }
            "stop" => {
                let name = require_str(&params, "name")?;
                let force = params
                    .get("force")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if name != "*" {
                    let (running, _, _) = self.supervisor.is_running(&name);
                    if !running {
                        return Ok(json!({
                            "ok": false,
                            "error": format!("instance '{name}' is not running"),
                        }));
                    }
                }
                let stopped = self.supervisor.stop_matching(&name, force).await;
                let count = stopped.len();
                Ok(json!({"ok": true, "stopped": stopped, "count": count}))
            }
            "restart" => {
                let name = require_str(&params, "name")?;
                let force = params
                    .get("force")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let stopped = self.supervisor.stop_matching(&name, force).await;
                // Respawning needs a fresh process; hand back the
                // commands instead of spawning from here.
                let start_commands: Vec<String> = stopped
                    .iter()
                    .map(|inst| format!("{} serve {inst}", self.supervisor.cli_command()))
                    .collect();
                Ok(json!({
                    "ok": true,
                    "stopped": stopped,
                    "message": "instances stopped; start them with the commands below",
                    "start_commands": start_commands,
                }))
            }
            other => Err(ProxyError::not_found(format!(
                "method '{other}' not found on proxy"
            ))),
        }
    }
}

/// Entity definition for the registry.
pub fn entity() -> EntityDef {
    EntityDef {
        name: "proxy",
        lineage: &["ProxyEndpoint"],
        table: None,
        endpoint: |seed: &EndpointSeed| {
            Arc::new(ProxyEndpoint::new(
                seed.supervisor.clone(),
                seed.config.clone(),
            ))
        },
    }
}
