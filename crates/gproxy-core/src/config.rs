//! Process-wide configuration.
//!
//! A [`ProxyConfig`] is built once at process start from environment
//! variables and stays immutable for the life of the process. Concrete
//! proxies may rename the environment variables by supplying their own
//! [`EnvNames`].

use std::env;

/// Environment variable names used by [`ProxyConfig::from_env_names`].
///
/// Defaults match the generic proxy; a concrete proxy can override any
/// of them (e.g. `MAILPROXY_DB` instead of `GENRO_PROXY_DB`).
#[derive(Debug, Clone)]
pub struct EnvNames {
    pub db: &'static str,
    pub api_token: &'static str,
    pub instance: &'static str,
    pub host: &'static str,
    pub port: &'static str,
    pub test_mode: &'static str,
    pub start_active: &'static str,
}

impl Default for EnvNames {
    fn default() -> Self {
        Self {
            db: "GENRO_PROXY_DB",
            api_token: "GENRO_PROXY_API_TOKEN",
            instance: "GENRO_PROXY_INSTANCE",
            host: "GENRO_PROXY_HOST",
            port: "GENRO_PROXY_PORT",
            test_mode: "GENRO_PROXY_TEST_MODE",
            start_active: "GENRO_PROXY_START_ACTIVE",
        }
    }
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Database connection string (SQLite path or PostgreSQL URL).
    pub db: String,
    /// Instance name for display and identification.
    pub instance_name: String,
    /// Host the API server binds to.
    pub host: String,
    /// Port the API server listens on.
    pub port: u16,
    /// Global admin token. `None` means open access.
    pub api_token: Option<String>,
    /// Test mode disables automatic background processing.
    pub test_mode: bool,
    /// Whether processing starts immediately.
    pub start_active: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            db: "/data/service.db".to_string(),
            instance_name: "proxy".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_token: None,
            test_mode: false,
            start_active: false,
        }
    }
}

impl ProxyConfig {
    /// Build configuration from the default `GENRO_PROXY_*` variables.
    pub fn from_env() -> Self {
        Self::from_env_names(&EnvNames::default())
    }

    /// Build configuration from custom environment variable names.
    pub fn from_env_names(names: &EnvNames) -> Self {
        let defaults = Self::default();
        Self {
            db: env::var(names.db).unwrap_or(defaults.db),
            instance_name: env::var(names.instance).unwrap_or(defaults.instance_name),
            host: env::var(names.host).unwrap_or(defaults.host),
            port: env::var(names.port)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            api_token: env::var(names.api_token).ok().filter(|v| !v.is_empty()),
            test_mode: env_truthy(names.test_mode),
            start_active: env_truthy(names.start_active),
        }
    }
}

/// Truthy values accepted for boolean environment variables.
fn env_truthy(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
