//! End-to-end API tests over an in-process router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gproxy_core::{EncryptionManager, ProxyConfig};
use gproxy_entities::Proxy;
use gproxy_supervisor::Supervisor;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin-token-1234567890123456789012345";

struct TestApi {
    _dir: tempfile::TempDir,
    proxy: Arc<Proxy>,
    router: Router,
}

async fn setup(admin_token: Option<&str>) -> TestApi {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        db: dir.path().join("test.db").to_string_lossy().into_owned(),
        api_token: admin_token.map(ToString::to_string),
        ..ProxyConfig::default()
    };
    let supervisor = Supervisor::new(dir.path().join("instances"), "gproxy");
    let proxy = Arc::new(
        Proxy::assemble(
            config,
            Proxy::builtin_registry(),
            EncryptionManager::disabled(),
            supervisor,
        )
        .unwrap(),
    );
    proxy.init().await.unwrap();
    let router = gproxy_api::build_router(proxy.clone());
    TestApi {
        _dir: dir,
        proxy,
        router,
    }
}

async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("X-API-Token", token);
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_requires_no_auth() {
    let api = setup(Some(ADMIN_TOKEN)).await;
    let (status, body) = request(&api.router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_open_access_without_configured_token() {
    let api = setup(None).await;
    let (status, body) = request(&api.router, "GET", "/api/tenants/list", None, None).await;
    assert_eq!(status, StatusCode::OK);
    // init seeds the default tenant.
    assert_eq!(body["data"][0]["id"], json!("default"));
}

#[tokio::test]
async fn test_missing_token_rejected_when_configured() {
    let api = setup(Some(ADMIN_TOKEN)).await;
    let (status, _) = request(&api.router, "GET", "/api/accounts/list", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = request(&api.router, "GET", "/api/tenants/list", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_then_list_tenant() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    let (status, body) = request(
        &api.router,
        "POST",
        "/api/tenants/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "acme", "name": "Acme Corp"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], json!("acme"));
    assert_eq!(body["data"]["name"], json!("Acme Corp"));

    let (status, body) = request(
        &api.router,
        "GET",
        "/api/tenants/list",
        Some(ADMIN_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["data"].as_array().unwrap();
    let acme = rows.iter().find(|t| t["id"] == json!("acme")).unwrap();
    assert_eq!(acme["active"], json!(true));
}

#[tokio::test]
async fn test_tenant_token_scoping() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    // Admin creates two tenants, capturing their one-time keys.
    let (_, t1) = request(
        &api.router,
        "POST",
        "/api/tenants/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "t1"})),
    )
    .await;
    let t1_token = t1["data"]["_api_key"].as_str().unwrap().to_string();
    let (_, t2) = request(
        &api.router,
        "POST",
        "/api/tenants/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "t2"})),
    )
    .await;
    let t2_token = t2["data"]["_api_key"].as_str().unwrap().to_string();

    // t1's token creates an account without naming the tenant.
    let (status, body) = request(
        &api.router,
        "POST",
        "/api/accounts/add",
        Some(&t1_token),
        Some(json!({"id": "main", "name": "Main"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tenant_id"], json!("t1"));

    // t2's token cannot see it.
    let (status, _) = request(
        &api.router,
        "GET",
        "/api/accounts/get?account_id=main",
        Some(&t2_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // An unknown token is rejected outright.
    let (status, _) = request(
        &api.router,
        "GET",
        "/api/accounts/list",
        Some("who-is-this"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_gate_refuses_tenant_tokens() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    let (_, t1) = request(
        &api.router,
        "POST",
        "/api/tenants/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "t1"})),
    )
    .await;
    let t1_token = t1["data"]["_api_key"].as_str().unwrap().to_string();

    // Live tenant token on an admin-only entity: 403.
    let (status, _) = request(
        &api.router,
        "GET",
        "/api/tenants/list",
        Some(&t1_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Garbage token on an admin-only entity: 401.
    let (status, _) = request(
        &api.router,
        "GET",
        "/api/tenants/list",
        Some("garbage"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_validation_error_names_missing_field() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    let (status, body) = request(
        &api.router,
        "POST",
        "/api/accounts/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let errors = body["error"].as_array().unwrap();
    assert!(errors.iter().any(|e| e["field"] == json!("tenant_id")));
}

#[tokio::test]
async fn test_get_passes_query_string_params() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    request(
        &api.router,
        "POST",
        "/api/tenants/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "t1", "active": false})),
    )
    .await;

    // active_only arrives as the string "true" and is coerced.
    let (status, body) = request(
        &api.router,
        "GET",
        "/api/tenants/list?active_only=true",
        Some(ADMIN_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["data"].as_array().unwrap();
    assert!(rows.iter().all(|t| t["active"] == json!(true)));
    assert!(!rows.iter().any(|t| t["id"] == json!("t1")));
}

#[tokio::test]
async fn test_malformed_post_body_is_empty_params() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/tenants/add")
        .header("X-API-Token", ADMIN_TOKEN)
        .body(Body::from("{{{not json"))
        .unwrap();
    let response = api.router.clone().oneshot(request).await.unwrap();
    // Empty params: validation rejects the missing id.
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_method_names_use_dashes() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    request(
        &api.router,
        "POST",
        "/api/tenants/add",
        Some(ADMIN_TOKEN),
        Some(json!({"id": "t1"})),
    )
    .await;

    let (status, body) = request(
        &api.router,
        "POST",
        "/api/tenants/create-api-key",
        Some(ADMIN_TOKEN),
        Some(json!({"tenant_id": "t1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["api_key"].as_str().unwrap().len() > 20);
}

#[tokio::test]
async fn test_audit_log_records_posts_in_order() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    for i in 0..5 {
        let (status, _) = request(
            &api.router,
            "POST",
            "/api/tenants/add",
            Some(ADMIN_TOKEN),
            Some(json!({"id": format!("t{i}"), "name": format!("Tenant {i}")})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = request(
        &api.router,
        "GET",
        "/api/command_log/export",
        Some(ADMIN_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 5);

    let timestamps: Vec<i64> = entries
        .iter()
        .map(|e| e["command_ts"].as_i64().unwrap())
        .collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);

    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry["endpoint"], json!("POST /api/tenants/add"));
        assert_eq!(entry["payload"]["id"], json!(format!("t{i}")));
    }

    // The audit log itself is admin-only.
    let (status, _) = request(&api.router, "GET", "/api/command_log/export", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    drop(api.proxy);
}

#[tokio::test]
async fn test_process_endpoint_hides_serve_from_api() {
    let api = setup(Some(ADMIN_TOKEN)).await;

    // serve is CLI-only: the route does not exist.
    let (status, _) = request(
        &api.router,
        "POST",
        "/api/proxy/serve",
        Some(ADMIN_TOKEN),
        Some(json!({"name": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // list_instances is exposed.
    let (status, body) = request(
        &api.router,
        "GET",
        "/api/proxy/list-instances",
        Some(ADMIN_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["instances"], json!([]));
}
