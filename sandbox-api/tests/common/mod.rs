//! Common test utilities and helpers for sandbox-api tests

#![allow(dead_code)]

use axum::{body::Body, http::Request, response::Response, Router};
use sandbox_api::{create_app, AppState};
use sandbox_orchestrator::test_utils::{create_test_db, fast_config, MockClients};
use sandbox_orchestrator::{
    CreateProjectRequest, Project, ProjectOrchestrator, ProjectStatus, ProjectStore,
};
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

/// App wired to an in-memory database and mock downstream services
pub struct TestContext {
    pub app: Router,
    pub orchestrator: ProjectOrchestrator,
    pub mocks: MockClients,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_mocks(MockClients::new()).await
    }

    pub async fn with_mocks(mocks: MockClients) -> Self {
        let pool = create_test_db().await;
        let orchestrator = ProjectOrchestrator::new(
            ProjectStore::new(pool),
            mocks.service_clients(),
            fast_config(),
        );
        let app = create_app(AppState::new(orchestrator.clone()));

        Self {
            app,
            orchestrator,
            mocks,
        }
    }

    /// Send a request to the API
    pub async fn send(&self, request: Request<Body>) -> Response {
        // Router is cheap to clone
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Post JSON to an endpoint
    pub async fn post<T: serde::Serialize>(
        &self,
        uri: &str,
        body: &T,
        user: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        let body = serde_json::to_string(body).expect("Failed to serialize request body");
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    /// Patch JSON onto an endpoint
    pub async fn patch<T: serde::Serialize>(
        &self,
        uri: &str,
        body: &T,
        user: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder()
            .method("PATCH")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        let body = serde_json::to_string(body).expect("Failed to serialize request body");
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    pub async fn get(&self, uri: &str, user: Option<&str>) -> Response {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn delete(&self, uri: &str, user: Option<&str>) -> Response {
        let mut builder = Request::builder().method("DELETE").uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Fixture: a project created directly through the orchestrator, not run
    pub async fn fixture_project(&self, name: &str, owner: &str) -> Project {
        self.orchestrator
            .create_project(create_request(name, owner))
            .await
            .expect("Failed to create fixture project")
    }

    /// Fixture: a fully provisioned project
    pub async fn fixture_active_project(&self, name: &str, owner: &str) -> Project {
        let project = self.fixture_project(name, owner).await;
        self.orchestrator
            .run(&project.id)
            .await
            .expect("Failed to provision fixture project");
        let project = self.orchestrator.get_project(&project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        project
    }

    /// Poll until a background run leaves the project in `status`
    pub async fn wait_for_status(&self, id: &str, status: ProjectStatus) -> Project {
        for _ in 0..200 {
            let project = self.orchestrator.get_project(id).await.unwrap();
            if project.status == status {
                return project;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let project = self.orchestrator.get_project(id).await.unwrap();
        panic!(
            "project {id} never reached {status}, stuck in {}",
            project.status
        );
    }
}

pub fn create_request(name: &str, owner: &str) -> CreateProjectRequest {
    CreateProjectRequest {
        name: name.to_string(),
        owner: owner.to_string(),
        flavor: None,
        image: None,
        ssh_public_key: None,
        description: None,
    }
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}
