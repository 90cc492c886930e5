//! Endpoint contract, method descriptors, and the invoke pipeline.
//!
//! An endpoint exposes named async operations uniformly to every
//! channel (HTTP, CLI, REPL). Each operation is declared by a
//! [`MethodSpec`] carrying its parameter descriptors and the four
//! channel axes (api, cli, repl, post); axes left unset fall back to
//! the endpoint's class-level [`ChannelDefaults`].
//!
//! [`invoke`] is the single entry point used by all channels: it
//! resolves the method, opens the transactional connection scope,
//! resolves the tenant for non-admin tokens, coerces and validates
//! parameters against the descriptor, and dispatches to
//! [`Endpoint::call`]. The enclosing scope commits on success and
//! rolls back on error.

use async_trait::async_trait;
use gproxy_core::{FieldError, ProxyError, Record, Result};
use gproxy_sql::Table;
use serde_json::Value;
use std::sync::Arc;

use crate::entities::tenant;

/// The three invocation channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Api,
    Cli,
    Repl,
}

/// Class-level defaults for the four method axes.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDefaults {
    pub api: bool,
    pub cli: bool,
    pub repl: bool,
    pub post: bool,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            api: true,
            cli: true,
            repl: true,
            post: false,
        }
    }
}

/// Declared parameter types. Types are the source of truth for
/// validation and CLI argument synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
    Float,
    Bool,
    List,
    Map,
    Any,
    /// Closed set of string choices.
    Choice(&'static [&'static str]),
}

impl ParamType {
    /// Complex types ride in a POST body rather than a query string.
    pub fn is_complex(&self) -> bool {
        matches!(self, ParamType::List | ParamType::Map)
    }
}

/// One declared parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &'static str, ty: ParamType, default: Value) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: Some(default),
        }
    }
}

/// Descriptor for one exposed operation.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: &'static str,
    pub params: Vec<ParamSpec>,
    pub api: Option<bool>,
    pub cli: Option<bool>,
    pub repl: Option<bool>,
    pub post: Option<bool>,
}

impl MethodSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            params: Vec::new(),
            api: None,
            cli: None,
            repl: None,
            post: None,
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn post(mut self) -> Self {
        self.post = Some(true);
        self
    }

    pub fn api(mut self, on: bool) -> Self {
        self.api = Some(on);
        self
    }

    pub fn cli(mut self, on: bool) -> Self {
        self.cli = Some(on);
        self
    }

    pub fn repl(mut self, on: bool) -> Self {
        self.repl = Some(on);
        self
    }

    /// True iff no parameter is a list or map.
    pub fn is_simple_params(&self) -> bool {
        self.params.iter().all(|p| !p.ty.is_complex())
    }

    pub fn count_params(&self) -> usize {
        self.params.len()
    }
}

/// A component exposing a set of named async operations.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Identifier used as URL prefix and CLI group.
    fn name(&self) -> &'static str;

    fn defaults(&self) -> ChannelDefaults {
        ChannelDefaults::default()
    }

    /// Admin-only endpoints never accept tenant tokens.
    fn admin_only(&self) -> bool {
        false
    }

    /// Descriptors for every exposed operation.
    fn methods(&self) -> Vec<MethodSpec>;

    /// Backing table; `None` for process-level endpoints.
    fn table(&self) -> Option<Arc<Table>> {
        None
    }

    /// Execute a method with already-validated parameters.
    async fn call(&self, method: &str, params: Record) -> Result<Value>;
}

/// Resolved HTTP verb for a method: per-method axis, else class default.
pub fn http_method(endpoint: &dyn Endpoint, spec: &MethodSpec) -> &'static str {
    let post = spec.post.unwrap_or(endpoint.defaults().post);
    if post {
        "POST"
    } else {
        "GET"
    }
}

/// Channel availability with the same resolution order as the verb.
pub fn is_available(endpoint: &dyn Endpoint, spec: &MethodSpec, channel: Channel) -> bool {
    let defaults = endpoint.defaults();
    match channel {
        Channel::Api => spec.api.unwrap_or(defaults.api),
        Channel::Cli => spec.cli.unwrap_or(defaults.cli),
        Channel::Repl => spec.repl.unwrap_or(defaults.repl),
    }
}

/// Caller identity established by the channel's auth gate.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub api_token: Option<String>,
    pub is_admin: bool,
}

impl CallerIdentity {
    pub fn admin() -> Self {
        Self {
            api_token: None,
            is_admin: true,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            api_token: Some(token.into()),
            is_admin: false,
        }
    }
}

/// Parse JSON strings for parameters declared as list/map.
///
/// The CLI and query strings deliver every value as a string; failures
/// stay silent here so validation reports them uniformly.
fn coerce_json_params(specs: &[ParamSpec], params: &mut Record) {
    for spec in specs {
        if !spec.ty.is_complex() {
            continue;
        }
        if let Some(Value::String(text)) = params.get(spec.name) {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                if parsed.is_array() || parsed.is_object() {
                    params.insert(spec.name.to_string(), parsed);
                }
            }
        }
    }
}

fn coerce_value(value: &Value, ty: ParamType) -> std::result::Result<Value, String> {
    match ty {
        ParamType::Any => Ok(value.clone()),
        ParamType::Str => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err("expected string".to_string()),
        },
        ParamType::Int => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err("expected integer".to_string()),
            },
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| "expected integer".to_string()),
            _ => Err("expected integer".to_string()),
        },
        ParamType::Float => match value {
            Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or_default())),
            Value::String(s) => s
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| "expected number".to_string()),
            _ => Err("expected number".to_string()),
        },
        ParamType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err("expected boolean".to_string()),
            },
            Value::String(s) => match s.to_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(Value::Bool(true)),
                "0" | "false" | "no" => Ok(Value::Bool(false)),
                _ => Err("expected boolean".to_string()),
            },
            _ => Err("expected boolean".to_string()),
        },
        ParamType::List => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err("expected list".to_string()),
        },
        ParamType::Map => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err("expected map".to_string()),
        },
        ParamType::Choice(choices) => match value.as_str() {
            Some(s) if choices.contains(&s) => Ok(value.clone()),
            _ => Err(format!("expected one of: {}", choices.join(", "))),
        },
    }
}

/// Validate and coerce parameters against a method descriptor.
///
/// Unknown fields are dropped (permissive bodies); missing required
/// fields and type mismatches are collected into one validation error;
/// missing optional fields take their declared defaults.
pub fn validate_params(specs: &[ParamSpec], params: &Record) -> Result<Record> {
    let mut validated = Record::new();
    let mut errors: Vec<FieldError> = Vec::new();

    for spec in specs {
        match params.get(spec.name) {
            Some(value) if !value.is_null() => match coerce_value(value, spec.ty) {
                Ok(coerced) => {
                    validated.insert(spec.name.to_string(), coerced);
                }
                Err(message) => errors.push(FieldError::new(spec.name, message)),
            },
            _ if spec.required => errors.push(FieldError::new(spec.name, "field required")),
            _ => {
                validated.insert(
                    spec.name.to_string(),
                    spec.default.clone().unwrap_or(Value::Null),
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(ProxyError::Validation(errors))
    }
}

/// Validate parameters and call an endpoint method within a
/// transaction. Single entry point for every channel.
pub async fn invoke(
    endpoint: &dyn Endpoint,
    method: &str,
    params: Record,
    caller: &CallerIdentity,
) -> Result<Value> {
    let spec = endpoint
        .methods()
        .into_iter()
        .find(|m| m.name == method)
        .ok_or_else(|| {
            ProxyError::not_found(format!(
                "method '{method}' not found on {}",
                endpoint.name()
            ))
        })?;

    match endpoint.table() {
        Some(table) => {
            let db = table.db();
            db.connection(invoke_inner(endpoint, &spec, params, caller, Some(&db)))
                .await
        }
        // Table-less endpoints run without a connection scope.
        None => invoke_inner(endpoint, &spec, params, caller, None).await,
    }
}

async fn invoke_inner(
    endpoint: &dyn Endpoint,
    spec: &MethodSpec,
    mut params: Record,
    caller: &CallerIdentity,
    db: Option<&gproxy_sql::SqlDb>,
) -> Result<Value> {
    // Resolve tenant scope for non-admin tokens before validation so
    // tenant_id can satisfy a required parameter.
    if let (Some(token), Some(db)) = (caller.api_token.as_deref(), db) {
        if !token.is_empty() && !caller.is_admin && !params.contains_key("tenant_id") {
            match tenant::lookup_tenant_by_token(db, token).await? {
                Some(tenant) => {
                    if let Some(id) = tenant.get("id") {
                        params.insert("tenant_id".to_string(), id.clone());
                    }
                }
                None => return Err(ProxyError::InvalidToken),
            }
        }
    }

    coerce_json_params(&spec.params, &mut params);
    let validated = validate_params(&spec.params, &params)?;
    endpoint.call(spec.name, validated).await
}
