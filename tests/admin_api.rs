mod support;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use readthrough::application::cache_admin::CacheAdminService;
use readthrough::cache::CacheConfig;
use readthrough::infra::http::{AdminState, build_admin_router};
use serde_json::{Value, json};
use tower::ServiceExt;

use support::{ScriptedBackend, TestApp, body_string, header_value};

fn admin(app: &TestApp) -> Router {
    build_admin_router(AdminState {
        cache: CacheAdminService::from_runtime(&app.runtime),
    })
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).expect("request builds"))
        .await
        .expect("router responds");
    let status = response.status();
    let text = body_string(response).await;
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn health_answers_no_content() {
    let app = TestApp::memory();
    let (status, body) = call(&admin(&app), Method::GET, "/_health", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn stats_count_cache_entries() {
    let app = TestApp::memory();
    app.get("/api/products").await;
    app.get("/api/categories").await;

    let (status, body) = call(&admin(&app), Method::GET, "/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["totalKeys"], json!(2));
    assert_eq!(body["data"]["cacheKeys"], json!(2));
    assert!(body["data"]["memoryUsed"].is_string());
}

#[tokio::test]
async fn clear_reports_success() {
    let app = TestApp::memory();
    app.get("/api/products").await;
    let router = admin(&app);

    let (status, body) = call(&router, Method::POST, "/cache/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "message": "All cache cleared successfully" })
    );

    let (_, stats) = call(&router, Method::GET, "/cache/stats", None).await;
    assert_eq!(stats["data"]["cacheKeys"], json!(0));
}

#[tokio::test]
async fn clear_reports_backend_failure() {
    let app = TestApp::new(CacheConfig::default(), Arc::new(ScriptedBackend::down()));

    let (status, body) = call(&admin(&app), Method::POST, "/cache/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": false, "message": "Failed to clear cache" })
    );
}

#[tokio::test]
async fn invalidate_requires_route() {
    let app = TestApp::memory();
    let router = admin(&app);

    for body in [None, Some(json!({})), Some(json!({ "route": "  " }))] {
        let (status, response) = call(&router, Method::POST, "/cache/invalidate", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            response,
            json!({ "success": false, "error": "Route parameter is required" })
        );
    }
}

#[tokio::test]
async fn invalidate_removes_route_entries() {
    let app = TestApp::memory();
    app.get("/api/products").await;
    app.get("/api/products?page=2").await;
    app.get("/api/categories").await;

    let (status, body) = call(
        &admin(&app),
        Method::POST,
        "/cache/invalidate",
        Some(json!({ "route": "/api/products" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["count"], json!(2));
    assert_eq!(
        body["message"],
        json!("Invalidated 2 cache entries for route: /api/products")
    );

    let categories = app.get("/api/categories").await;
    assert_eq!(header_value(&categories, "x-cache"), Some("HIT"));
}

#[tokio::test]
async fn mutation_webhook_invalidates_collection() {
    let app = TestApp::memory();
    app.get("/api/products").await;

    let (status, body) = call(
        &admin(&app),
        Method::POST,
        "/cache/events",
        Some(json!({ "operationKind": "afterUpdate", "collectionName": "products" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], json!(true));

    let products = app.get("/api/products").await;
    assert_eq!(header_value(&products, "x-cache"), Some("MISS"));
}

#[tokio::test]
async fn mutation_webhook_rejects_bad_payloads() {
    let app = TestApp::memory();
    let router = admin(&app);

    let (status, body) = call(
        &router,
        Method::POST,
        "/cache/events",
        Some(json!({ "operationKind": "truncate", "collectionName": "products" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));

    let (status, body) = call(
        &router,
        Method::POST,
        "/cache/events",
        Some(json!({ "operationKind": "create" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("collectionName parameter is required"));
    assert_eq!(app.runtime.hub().published(), 0);
}
