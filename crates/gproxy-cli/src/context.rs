//! CLI context: active (instance, tenant) resolution.
//!
//! Commands that need an instance or tenant resolve them from, in
//! priority order: explicit flag → environment variables
//! (`GPROXY_INSTANCE` / `GPROXY_TENANT` by default) → the
//! `<base-dir>/.current` file → auto-select when exactly one instance
//! exists. `gproxy use <instance>[/<tenant>]` persists the context.

use gproxy_core::{ProxyError, Result};
use gproxy_supervisor::Supervisor;
use std::path::PathBuf;

/// Filename storing the persisted context inside the base directory.
const CURRENT_FILE: &str = ".current";

/// Configurable context resolver.
#[derive(Debug, Clone)]
pub struct CliContext {
    supervisor: Supervisor,
    env_instance: String,
    env_tenant: String,
    cli_name: String,
}

impl CliContext {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            env_instance: "GPROXY_INSTANCE".to_string(),
            env_tenant: "GPROXY_TENANT".to_string(),
            cli_name: "gproxy".to_string(),
        }
    }

    pub fn with_env_names(mut self, instance: &str, tenant: &str) -> Self {
        self.env_instance = instance.to_string();
        self.env_tenant = tenant.to_string();
        self
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    fn current_file(&self) -> PathBuf {
        self.supervisor.base_dir().join(CURRENT_FILE)
    }

    /// Parse `instance`, `instance/tenant`, or `/tenant`.
    pub fn parse_context(value: &str) -> (Option<String>, Option<String>) {
        match value.split_once('/') {
            Some((instance, tenant)) => (
                (!instance.is_empty()).then(|| instance.to_string()),
                (!tenant.is_empty()).then(|| tenant.to_string()),
            ),
            None => ((!value.is_empty()).then(|| value.to_string()), None),
        }
    }

    /// The persisted context from the `.current` file.
    pub fn current(&self) -> (Option<String>, Option<String>) {
        match std::fs::read_to_string(self.current_file()) {
            Ok(content) => Self::parse_context(content.trim()),
            Err(_) => (None, None),
        }
    }

    /// Persist the context. A missing instance keeps the file as-is.
    pub fn set_current(&self, instance: Option<&str>, tenant: Option<&str>) -> Result<()> {
        let Some(instance) = instance else {
            return Ok(());
        };
        std::fs::create_dir_all(self.supervisor.base_dir()).map_err(|e| {
            ProxyError::configuration(format!(
                "cannot create {}: {e}",
                self.supervisor.base_dir().display()
            ))
        })?;
        let content = match tenant {
            Some(tenant) => format!("{instance}/{tenant}"),
            None => instance.to_string(),
        };
        std::fs::write(self.current_file(), content)
            .map_err(|e| ProxyError::configuration(format!("cannot write context: {e}")))
    }

    /// Resolve the active (instance, tenant) pair; either may be None.
    pub fn resolve(
        &self,
        explicit_instance: Option<&str>,
        explicit_tenant: Option<&str>,
    ) -> (Option<String>, Option<String>) {
        let (current_instance, current_tenant) = self.current();

        let instance = explicit_instance
            .map(ToString::to_string)
            .or_else(|| std::env::var(&self.env_instance).ok().filter(|v| !v.is_empty()))
            .or(current_instance)
            .or_else(|| {
                let names = self.supervisor.instance_names();
                (names.len() == 1).then(|| names[0].clone())
            });

        let tenant = explicit_tenant
            .map(ToString::to_string)
            .or_else(|| std::env::var(&self.env_tenant).ok().filter(|v| !v.is_empty()))
            .or(current_tenant);

        (instance, tenant)
    }

    /// Resolve the instance or fail with a help message enumerating
    /// the candidates.
    pub fn require_instance(
        &self,
        explicit_instance: Option<&str>,
        explicit_tenant: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        let (instance, tenant) = self.resolve(explicit_instance, explicit_tenant);
        if let Some(instance) = instance {
            return Ok((instance, tenant));
        }

        let names = self.supervisor.instance_names();
        let message = if names.is_empty() {
            format!(
                "no instances configured; use '{} serve <name>' to create one",
                self.cli_name
            )
        } else {
            let candidates = names
                .iter()
                .map(|n| format!("  - {n}"))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "multiple instances found, specify which one:\n{candidates}\n\n\
                 options:\n  - use '{} use <instance>' to set a default\n  - set {}",
                self.cli_name, self.env_instance
            )
        };
        Err(ProxyError::configuration(message))
    }
}
