//! Command log entity: append-only audit trail of API commands.
//!
//! Every state-changing invocation is recorded with its timestamp,
//! endpoint label, tenant scope, and JSON-serialized payload/response.
//! Rows are never mutated; the surface covers listing with filters,
//! replay-friendly export, and purging by age.

use async_trait::async_trait;
use chrono::Utc;
use gproxy_core::{ProxyError, Record, Result};
use gproxy_sql::{ColType, Columns, Table, TableSchema};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::endpoint::{Endpoint, MethodSpec, ParamSpec, ParamType};
use crate::registry::{EndpointSeed, EntityDef};

/// Audit log table. Server-autoincrement primary key.
pub struct CommandLogTable;

#[async_trait]
impl TableSchema for CommandLogTable {
    fn name(&self) -> &'static str {
        "command_log"
    }

    fn pkey(&self) -> Option<&'static str> {
        Some("id")
    }

    fn new_pkey_value(&self) -> Option<Value> {
        // INTEGER PRIMARY KEY autoincrement.
        None
    }

    fn configure(&self, c: &mut Columns) {
        c.column("id", ColType::Integer);
        c.column("command_ts", ColType::Integer).not_null();
        c.column("endpoint", ColType::String).not_null();
        c.column("tenant_id", ColType::String);
        c.column("payload", ColType::String).not_null();
        c.column("response_status", ColType::Integer);
        c.column("response_body", ColType::String);
    }
}

/// Record one API command in the audit log, returning its id.
pub async fn log_command(
    table: &Table,
    endpoint: &str,
    payload: &Value,
    tenant_id: Option<&str>,
    response_status: Option<i64>,
    response_body: Option<&Value>,
) -> Result<i64> {
    let mut record = Record::new();
    record.insert("command_ts".to_string(), json!(Utc::now().timestamp()));
    record.insert("endpoint".to_string(), json!(endpoint));
    record.insert(
        "tenant_id".to_string(),
        tenant_id.map(|t| json!(t)).unwrap_or(Value::Null),
    );
    record.insert("payload".to_string(), json!(payload.to_string()));
    record.insert(
        "response_status".to_string(),
        response_status.map(Value::from).unwrap_or(Value::Null),
    );
    record.insert(
        "response_body".to_string(),
        response_body
            .map(|b| json!(b.to_string()))
            .unwrap_or(Value::Null),
    );

    table.insert(&mut record, false).await?;
    Ok(record.get("id").and_then(Value::as_i64).unwrap_or(0))
}

fn parse_json_text_fields(mut record: Record) -> Record {
    for field in ["payload", "response_body"] {
        if let Some(Value::String(text)) = record.get(field) {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                record.insert(field.to_string(), parsed);
            }
        }
    }
    record
}

/// Filters accepted by [`list_commands`].
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub tenant_id: Option<String>,
    pub since_ts: Option<i64>,
    pub until_ts: Option<i64>,
    pub endpoint_filter: Option<String>,
    pub limit: u64,
    pub offset: u64,
}

/// List logged commands in ascending timestamp order.
pub async fn list_commands(table: &Table, filter: &CommandFilter) -> Result<Vec<Record>> {
    let mut conditions: Vec<String> = Vec::new();
    let mut params = Record::new();
    params.insert("limit".to_string(), json!(filter.limit.max(1)));
    params.insert("offset".to_string(), json!(filter.offset));

    if let Some(tenant_id) = &filter.tenant_id {
        conditions.push("tenant_id = :tenant_id".to_string());
        params.insert("tenant_id".to_string(), json!(tenant_id));
    }
    if let Some(since) = filter.since_ts {
        conditions.push("command_ts >= :since_ts".to_string());
        params.insert("since_ts".to_string(), json!(since));
    }
    if let Some(until) = filter.until_ts {
        conditions.push("command_ts <= :until_ts".to_string());
        params.insert("until_ts".to_string(), json!(until));
    }
    if let Some(pattern) = &filter.endpoint_filter {
        conditions.push("endpoint LIKE :endpoint_filter".to_string());
        params.insert("endpoint_filter".to_string(), json!(format!("%{pattern}%")));
    }

    let where_clause = if conditions.is_empty() {
        "1=1".to_string()
    } else {
        conditions.join(" AND ")
    };

    let rows = table
        .fetch_all(
            &format!(
                "SELECT id, command_ts, endpoint, tenant_id, payload, response_status, response_body \
                 FROM command_log WHERE {where_clause} \
                 ORDER BY command_ts ASC, id ASC LIMIT :limit OFFSET :offset"
            ),
            &params,
        )
        .await?;
    Ok(rows.into_iter().map(parse_json_text_fields).collect())
}

/// Delete command logs older than the threshold, returning the count.
pub async fn purge_before(table: &Table, threshold_ts: i64) -> Result<u64> {
    let mut params = Record::new();
    params.insert("threshold_ts".to_string(), json!(threshold_ts));
    table
        .execute(
            "DELETE FROM command_log WHERE command_ts < :threshold_ts",
            &params,
        )
        .await
}

/// REST/CLI endpoint over the audit log. Admin-only surface.
pub struct CommandLogEndpoint {
    table: Arc<Table>,
}

impl CommandLogEndpoint {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    fn filter_from_params(params: &Record) -> CommandFilter {
        CommandFilter {
            tenant_id: params
                .get("tenant_id")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            since_ts: params.get("since_ts").and_then(Value::as_i64),
            until_ts: params.get("until_ts").and_then(Value::as_i64),
            endpoint_filter: params
                .get("endpoint_filter")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            limit: params.get("limit").and_then(Value::as_u64).unwrap_or(100),
            offset: params.get("offset").and_then(Value::as_u64).unwrap_or(0),
        }
    }
}

#[async_trait]
impl Endpoint for CommandLogEndpoint {
    fn name(&self) -> &'static str {
        "command_log"
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
                .param(ParamSpec::optional("tenant_id", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("since_ts", ParamType::Int, Value::Null))
                .param(ParamSpec::optional("until_ts", ParamType::Int, Value::Null))
                .param(ParamSpec::optional(
                    "endpoint_filter",
                    ParamType::Str,
                    Value::Null,
                ))
                .param(ParamSpec::optional("limit", ParamType::Int, json!(100)))
                .param(ParamSpec::optional("offset", ParamType::Int, json!(0))),
            MethodSpec::new("get").param(ParamSpec::required("command_id", ParamType::Int)),
            MethodSpec::new("export")
                .param(ParamSpec::optional("tenant_id", ParamType::Str, Value::Null))
                .param(ParamSpec::optional("since_ts", ParamType::Int, Value::Null))
                .param(ParamSpec::optional("until_ts", ParamType::Int, Value::Null)),
            MethodSpec::new("purge")
                .post()
                .param(ParamSpec::required("threshold_ts", ParamType::Int)),
        ]
    }

    async fn call(&self, method: &str, params: Record) -> Result<Value> {
        match method {
            "list" => {
                let filter = Self::filter_from_params(&params);
                let rows = list_commands(&self.table, &filter).await?;
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            "get" => {
                let command_id = params
                    .get("command_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ProxyError::validation("command_id", "field required"))?;
                let mut query_params = Record::new();
                query_params.insert("id".to_string(), json!(command_id));
                let row = self
                    .table
                    .fetch_one("SELECT * FROM command_log WHERE id = :id", &query_params)
                    .await?
                    .ok_or_else(|| {
                        ProxyError::not_found(format!("command '{command_id}' not found"))
                    })?;
                Ok(Value::Object(parse_json_text_fields(row)))
            }
            "export" => {
                let filter = CommandFilter {
                    limit: 100_000,
                    ..Self::filter_from_params(&params)
                };
                let rows = list_commands(&self.table, &filter).await?;
                let exported: Vec<Value> = rows
                    .into_iter()
                    .map(|cmd| {
                        json!({
                            "endpoint": cmd.get("endpoint"),
                            "tenant_id": cmd.get("tenant_id"),
                            "payload": cmd.get("payload"),
                            "command_ts": cmd.get("command_ts"),
                        })
                    })
                    .collect();
                Ok(Value::Array(exported))
            }
            "purge" => {
                let threshold = params
                    .get("threshold_ts")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ProxyError::validation("threshold_ts", "field required"))?;
                let purged = purge_before(&self.table, threshold).await?;
                Ok(json!({"ok": true, "purged": purged}))
            }
            other => Err(ProxyError::not_found(format!(
                "method '{other}' not found on command_log"
            ))),
        }
    }
}

/// Entity definition for the registry.
pub fn entity() -> EntityDef {
    EntityDef {
        name: "command_log",
        lineage: &["CommandLogEndpoint"],
        table: Some(|| Arc::new(CommandLogTable)),
        endpoint: |seed: &EndpointSeed| {
            Arc::new(CommandLogEndpoint::new(
                seed.table.clone().expect("command_log table registered"),
            ))
        },
    }
}
