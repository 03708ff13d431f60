//! Integration tests for authentication middleware
//!
//! Tests that the auth middleware extracts the caller identity from the
//! proxy headers and rejects anonymous requests.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`
use sandbox_api::auth::{auth_middleware, AuthenticatedUser};

// Simple handler that returns the authenticated user info
async fn whoami(
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> axum::Json<Value> {
    axum::Json(serde_json::json!({
        "username": user.username,
        "email": user.email,
    }))
}

fn create_test_app() -> Router {
    Router::new()
        .route("/protected", get(whoami))
        .layer(middleware::from_fn(auth_middleware))
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_x_user_header_passes() {
    let request = Request::builder()
        .uri("/protected")
        .header("x-user", "alice")
        .body(Body::empty())
        .unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["username"], "alice");
    assert!(json["email"].is_null());
}

#[tokio::test]
async fn test_forwarded_user_header_takes_precedence() {
    let request = Request::builder()
        .uri("/protected")
        .header("x-forwarded-user", "proxy-user")
        .header("x-forwarded-email", "proxy-user@example.com")
        .header("x-user", "dev-user")
        .body(Body::empty())
        .unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["username"], "proxy-user");
    assert_eq!(json["email"], "proxy-user@example.com");
}

#[tokio::test]
async fn test_missing_identity_returns_unauthorized() {
    let request = Request::builder()
        .uri("/protected")
        .body(Body::empty())
        .unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_blank_identity_returns_unauthorized() {
    let request = Request::builder()
        .uri("/protected")
        .header("x-user", "   ")
        .body(Body::empty())
        .unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
