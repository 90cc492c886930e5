//! API authentication and tenant resolution gates.
//!
//! Callers authenticate with the `X-API-Token` header. Two gates
//! exist:
//!
//! - the **regular gate** admits admin tokens, defers tenant-token
//!   resolution to `invoke` (which holds a DB connection), and only
//!   rejects outright when a token is required but missing;
//! - the **admin gate** protects admin-only entities: tenant tokens
//!   are refused with 403, anything else unknown with 401.
//!
//! With no admin token configured the proxy is open: both gates admit
//! anonymous callers.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::state::ApiState;

/// Header carrying the bearer token.
pub const API_TOKEN_HEADER: &str = "X-API-Token";

/// Caller identity attached to request extensions by the gates.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub api_token: Option<String>,
    pub is_admin: bool,
}

/// Constant-time token comparison.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn extract_token(req: &Request) -> Option<String> {
    req.headers()
        .get(API_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid or missing API token"})),
    )
        .into_response()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "admin token required"})),
    )
        .into_response()
}

/// Regular gate for `/api/*` routes.
pub async fn require_token(
    State(state): State<ApiState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = extract_token(&req);
    let admin_token = state.proxy.config().api_token.clone();

    let context = match (token, admin_token) {
        // Open access: no admin token configured.
        (None, None) => AuthContext::default(),
        (None, Some(_)) => return unauthorized(),
        (Some(presented), Some(expected)) if tokens_match(&presented, &expected) => AuthContext {
            api_token: Some(presented),
            is_admin: true,
        },
        // Any other token: admit and defer tenant resolution to
        // invoke, which has a database connection.
        (Some(presented), _) => AuthContext {
            api_token: Some(presented),
            is_admin: false,
        },
    };

    req.extensions_mut().insert(context);
    next.run(req).await
}

/// Stricter gate for admin-only subtrees.
pub async fn require_admin_token(
    State(state): State<ApiState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = extract_token(&req);
    let admin_token = state.proxy.config().api_token.clone();

    let context = match (token, admin_token) {
        (None, None) => AuthContext::default(),
        (None, Some(_)) => return unauthorized(),
        (Some(presented), Some(expected)) if tokens_match(&presented, &expected) => AuthContext {
            api_token: Some(presented),
            is_admin: true,
        },
        (Some(presented), _) => {
            // Admin-only endpoints never accept tenant tokens: a live
            // tenant token is refused explicitly, garbage is 401.
            match gproxy_entities::resolve_tenant_token(&state.proxy, &presented).await {
                Ok(Some(tenant)) => {
                    tracing::warn!(
                        tenant = tenant.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
                        "tenant token on admin-only endpoint"
                    );
                    return forbidden();
                }
                Ok(None) => return unauthorized(),
                Err(e) => {
                    tracing::warn!(error = %e, "tenant lookup failed in admin gate");
                    return unauthorized();
                }
            }
        }
    };

    req.extensions_mut().insert(context);
    next.run(req).await
}
