//! Route factory: one route per exposed endpoint method.
//!
//! Each method an endpoint exposes on the API channel becomes a route
//! at `/api/<entity>/<method-with-dashes>` with the resolved verb. GET
//! handlers read the query string, POST handlers the JSON body; both
//! funnel into `invoke`. Success wraps the result in `{"data": …}`;
//! errors map to the status taxonomy (422/404/401/403/500).
//!
//! Admin-only entities are registered on a separate subtree behind the
//! stricter admin gate. State-changing (POST) invocations are recorded
//! in the command log after the response is produced.

use axum::body::Bytes;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use gproxy_core::{ProxyError, Record};
use gproxy_entities::{
    http_method, invoke, is_available, CallerIdentity, Channel, Endpoint, Proxy,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;

use crate::auth::{require_admin_token, require_token, AuthContext};
use crate::state::ApiState;

/// Entities whose own invocations are not audited.
const UNAUDITED: [&str; 2] = ["command_log", "proxy"];

/// Build the full application router for a proxy.
pub fn build_router(proxy: Arc<Proxy>) -> Router {
    let state = ApiState::new(proxy.clone());

    let mut regular = Router::new();
    let mut admin = Router::new();

    for endpoint in proxy.endpoints() {
        for spec in endpoint.methods() {
            if !is_available(&*endpoint, &spec, Channel::Api) {
                continue;
            }
            let path = format!("/{}/{}", endpoint.name(), spec.name.replace('_', "-"));
            let verb = http_method(&*endpoint, &spec);
            let method_name = spec.name;

            let route = if verb == "POST" {
                let proxy = proxy.clone();
                let endpoint = endpoint.clone();
                post(
                    move |Extension(auth): Extension<AuthContext>, body: Bytes| async move {
                        let params = parse_body(&body);
                        run_invoke(proxy, endpoint, method_name, auth, params, "POST").await
                    },
                )
            } else {
                let proxy = proxy.clone();
                let endpoint = endpoint.clone();
                get(
                    move |Extension(auth): Extension<AuthContext>,
                          Query(query): Query<HashMap<String, String>>| async move {
                        let params: Record = query
                            .into_iter()
                            .map(|(k, v)| (k, Value::String(v)))
                            .collect();
                        run_invoke(proxy, endpoint, method_name, auth, params, "GET").await
                    },
                )
            };

            if endpoint.admin_only() {
                admin = admin.route(&path, route);
            } else {
                regular = regular.route(&path, route);
            }
        }
    }

    let regular = regular.layer(middleware::from_fn_with_state(
        state.clone(),
        require_token,
    ));
    let admin = admin.layer(middleware::from_fn_with_state(
        state.clone(),
        require_admin_token,
    ));

    let mut app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .nest("/api", regular.merge(admin));

    if let Some(ui_dir) = find_ui_dir() {
        tracing::info!(path = %ui_dir.display(), "serving UI");
        app = app.nest_service(
            "/ui",
            ServeDir::new(&ui_dir).append_index_html_on_directories(true),
        );
    }

    app
}

/// Non-empty request bodies parse as JSON objects; anything else is an
/// empty parameter map.
fn parse_body(body: &Bytes) -> Record {
    if body.is_empty() {
        return Record::new();
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => Record::new(),
    }
}

/// Built UI directory relative to the process binary, if any.
fn find_ui_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.join("ui");
    dir.join("index.html").exists().then_some(dir)
}

async fn run_invoke(
    proxy: Arc<Proxy>,
    endpoint: Arc<dyn Endpoint>,
    method: &'static str,
    auth: AuthContext,
    params: Record,
    verb: &'static str,
) -> Response {
    let caller = CallerIdentity {
        api_token: auth.api_token,
        is_admin: auth.is_admin,
    };
    let result = invoke(&*endpoint, method, params.clone(), &caller).await;

    let (status, envelope) = match &result {
        Ok(value) => (StatusCode::OK, json!({"data": value})),
        Err(e) => error_envelope(e),
    };

    if verb == "POST" && !UNAUDITED.contains(&endpoint.name()) {
        let label = format!(
            "POST /api/{}/{}",
            endpoint.name(),
            method.replace('_', "-")
        );
        let tenant_id = params
            .get("tenant_id")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        proxy
            .audit(
                &label,
                &Value::Object(params),
                tenant_id.as_deref(),
                Some(i64::from(status.as_u16())),
                Some(&envelope),
            )
            .await;
    }

    (status, Json(envelope)).into_response()
}

fn error_envelope(err: &ProxyError) -> (StatusCode, Value) {
    match err {
        ProxyError::Validation(fields) => {
            (StatusCode::UNPROCESSABLE_ENTITY, json!({"error": fields}))
        }
        ProxyError::NotFound(message) => (StatusCode::NOT_FOUND, json!({"error": message})),
        ProxyError::InvalidToken => (
            StatusCode::UNAUTHORIZED,
            json!({"error": "invalid API token"}),
        ),
        ProxyError::Forbidden(message) => (StatusCode::FORBIDDEN, json!({"error": message})),
        other => {
            tracing::error!(error = %other, "unhandled endpoint error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": other.to_string()}),
            )
        }
    }
}
