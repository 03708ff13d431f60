//! Integration tests for REST API endpoints
//!
//! Tests project creation, listing, retrieval, editing, deletion and the
//! history endpoints against mock downstream services.

mod common;

use axum::http::StatusCode;
use common::{create_request, extract_json_body, TestContext};
use sandbox_orchestrator::test_utils::MockClients;
use sandbox_api::routes::projects::BuildStatusResponse;
use sandbox_orchestrator::{EventKind, Project, ProjectEvent, ProjectStatus, Step, StepRecord};
use serde_json::{json, Value};

#[tokio::test]
async fn test_create_project_is_accepted_and_provisioned() {
    let ctx = TestContext::new().await;

    let mut req = create_request("demo", "will-be-overridden");
    req.flavor = Some("medium".to_string());
    let response = ctx.post("/api/v1/projects", &req, Some("alice")).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let project: Project = extract_json_body(response).await;
    assert_eq!(project.name, "demo");
    assert_eq!(project.owner, "alice"); // Should be from auth header
    assert_eq!(project.status, ProjectStatus::Pending);
    assert_eq!(project.flavor.as_deref(), Some("medium"));

    let active = ctx.wait_for_status(&project.id, ProjectStatus::Active).await;
    assert!(active.has_all_resources());
    assert_eq!(ctx.mocks.vm.create_calls(), 1);
}

#[tokio::test]
async fn test_create_project_without_auth_fails() {
    let ctx = TestContext::new().await;

    let response = ctx
        .post("/api/v1/projects", &create_request("demo", "alice"), None)
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(ctx
        .orchestrator
        .list_projects(Default::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_create_project_with_blank_name_is_rejected() {
    let ctx = TestContext::new().await;

    let response = ctx
        .post("/api/v1/projects", &create_request("  ", "alice"), Some("alice"))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("name"));
}

#[tokio::test]
async fn test_failed_project_exposes_last_error() {
    let mocks = MockClients::new();
    mocks
        .vm
        .fail_all_creates(mocks.vm.permanent_error("invalid-quota"));
    let ctx = TestContext::with_mocks(mocks).await;

    let response = ctx
        .post("/api/v1/projects", &create_request("p1", "alice"), Some("alice"))
        .await;
    let project: Project = extract_json_body(response).await;
    ctx.wait_for_status(&project.id, ProjectStatus::Failed).await;

    let response = ctx
        .get(&format!("/api/v1/projects/{}", project.id), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "failed");
    assert!(body["last_error"].as_str().unwrap().contains("invalid-quota"));
    assert_eq!(ctx.mocks.auth.delete_calls(), 1);
}

#[tokio::test]
async fn test_list_projects_only_returns_callers_projects() {
    let ctx = TestContext::new().await;
    ctx.fixture_project("one", "alice").await;
    ctx.fixture_project("two", "alice").await;
    ctx.fixture_project("three", "bob").await;

    let response = ctx.get("/api/v1/projects", Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let projects: Vec<Project> = extract_json_body(response).await;
    assert_eq!(projects.len(), 2);
    assert!(projects.iter().all(|p| p.owner == "alice"));
}

#[tokio::test]
async fn test_list_projects_filters_by_status() {
    let ctx = TestContext::new().await;
    ctx.fixture_project("waiting", "alice").await;
    let active = ctx.fixture_active_project("running", "alice").await;

    let response = ctx.get("/api/v1/projects?status=active", Some("alice")).await;
    let projects: Vec<Project> = extract_json_body(response).await;
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].id, active.id);

    let response = ctx.get("/api/v1/projects?status=sleeping", Some("alice")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_project_enforces_ownership() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_project("demo", "alice").await;
    let uri = format!("/api/v1/projects/{}", project.id);

    let response = ctx.get(&uri, Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: Project = extract_json_body(response).await;
    assert_eq!(fetched.id, project.id);

    let response = ctx.get(&uri, Some("mallory")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = ctx.get("/api/v1/projects/missing", Some("alice")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_project_releases_resources() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_active_project("demo", "alice").await;

    let response = ctx
        .delete(&format!("/api/v1/projects/{}", project.id), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted: Project = extract_json_body(response).await;
    assert_eq!(accepted.status, ProjectStatus::Deleting);

    let deleted = ctx.wait_for_status(&project.id, ProjectStatus::Deleted).await;
    assert!(!deleted.has_any_resource());
    assert_eq!(ctx.mocks.storage.delete_calls(), 1);

    // Deleting again reports the settled record
    let response = ctx
        .delete(&format!("/api/v1/projects/{}", project.id), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(ctx.mocks.storage.delete_calls(), 1);
}

#[tokio::test]
async fn test_delete_mid_workflow_conflicts() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_project("demo", "alice").await;

    let response = ctx
        .delete(&format!("/api/v1/projects/{}", project.id), Some("alice"))
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("pending"));
}

#[tokio::test]
async fn test_delete_of_other_users_project_is_forbidden() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_active_project("demo", "alice").await;

    let response = ctx
        .delete(&format!("/api/v1/projects/{}", project.id), Some("bob"))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let project = ctx.orchestrator.get_project(&project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Active);
}

#[tokio::test]
async fn test_list_steps_endpoint() {
    let mocks = MockClients::new();
    mocks
        .storage
        .fail_creates(1, mocks.storage.transient_error("502 bad gateway"));
    let ctx = TestContext::with_mocks(mocks).await;
    let project = ctx.fixture_active_project("demo", "alice").await;

    let response = ctx
        .get(&format!("/api/v1/projects/{}/steps", project.id), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let steps: Vec<StepRecord> = extract_json_body(response).await;
    assert_eq!(steps.len(), 3);
    let storage = steps
        .iter()
        .find(|s| s.step == Step::Storage)
        .expect("storage step recorded");
    assert_eq!(storage.attempts, 2);
}

#[tokio::test]
async fn test_update_project_renames_it() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_active_project("demo", "alice").await;
    let uri = format!("/api/v1/projects/{}", project.id);

    let body = json!({ "name": "renamed", "description": "for the workshop" });
    let response = ctx.patch(&uri, &body, Some("alice")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let updated: Project = extract_json_body(response).await;
    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.description.as_deref(), Some("for the workshop"));
    assert_eq!(updated.version, project.version + 1);

    let response = ctx.patch(&uri, &json!({ "name": "x" }), Some("bob")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_update_mid_workflow_conflicts() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_project("demo", "alice").await;

    let response = ctx
        .patch(
            &format!("/api/v1/projects/{}", project.id),
            &json!({ "name": "renamed" }),
            Some("alice"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_list_events_endpoint() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_active_project("demo", "alice").await;
    let uri = format!("/api/v1/projects/{}/events", project.id);

    let response = ctx.get(&format!("{uri}?newest_first=false"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let events: Vec<ProjectEvent> = extract_json_body(response).await;
    assert_eq!(events.first().unwrap().kind, EventKind::Created);

    let response = ctx.get(&format!("{uri}?kind=step_succeeded"), Some("alice")).await;
    let steps: Vec<ProjectEvent> = extract_json_body(response).await;
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|e| e.kind == EventKind::StepSucceeded));

    let response = ctx.get(&format!("{uri}?kind=bogus"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = ctx.get(&uri, Some("bob")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_build_status_endpoints() {
    let ctx = TestContext::new().await;
    let project = ctx.fixture_active_project("demo", "alice").await;
    let uri = format!("/api/v1/projects/{}/build-status", project.id);

    let response = ctx.get(&uri, Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let empty: BuildStatusResponse = extract_json_body(response).await;
    assert!(empty.build_status.is_none());

    let body = json!({
        "status": "running",
        "step": "image",
        "message": "pulling base image",
        "pipeline_id": "pipeline-42"
    });
    let response = ctx.patch(&uri, &body, Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = ctx.get(&uri, Some("alice")).await;
    let current: BuildStatusResponse = extract_json_body(response).await;
    assert_eq!(current.project_id, project.id);
    let build = current.build_status.expect("build status recorded");
    assert_eq!(build.status.as_deref(), Some("running"));
    assert_eq!(build.message, "pulling base image");
    assert_eq!(build.pipeline_id.as_deref(), Some("pipeline-42"));

    let response = ctx
        .patch(&uri, &json!({ "status": "", "step": "image" }), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_endpoints() {
    let ctx = TestContext::new().await;

    let response = ctx.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ok");

    let response = ctx.get("/health/ready", None).await;
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_openapi_document_lists_project_routes() {
    let ctx = TestContext::new().await;

    let response = ctx.get("/api-docs/openapi.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc: Value = extract_json_body(response).await;
    assert!(doc["paths"]["/api/v1/projects"].is_object());
    assert!(doc["paths"]["/api/v1/projects/{id}/steps"].is_object());
    assert!(doc["paths"]["/api/v1/projects/{id}"]["patch"].is_object());
    assert!(doc["paths"]["/api/v1/projects/{id}/events"].is_object());
    assert!(doc["paths"]["/api/v1/projects/{id}/build-status"]["patch"].is_object());
    assert!(doc["components"]["schemas"]["ProjectEvent"].is_object());
    assert!(doc["components"]["schemas"]["Project"].is_object());
}
