use crate::db::{create_memory_pool, run_migrations};
use crate::lifecycle::{OrchestratorConfig, ProjectOrchestrator, ServiceClients};
use crate::retry::RetryPolicy;
use crate::store::ProjectStore;
use sandbox_clients::mock::MockServiceClient;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    let pool = create_memory_pool()
        .await
        .expect("Failed to create in-memory database");

    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Mock downstream services, kept concrete so tests can inspect them.
#[derive(Clone)]
pub struct MockClients {
    pub auth: Arc<MockServiceClient>,
    pub vm: Arc<MockServiceClient>,
    pub storage: Arc<MockServiceClient>,
}

impl MockClients {
    pub fn new() -> Self {
        Self {
            auth: Arc::new(MockServiceClient::new("auth")),
            vm: Arc::new(MockServiceClient::new("vm")),
            storage: Arc::new(MockServiceClient::new("storage")),
        }
    }

    pub fn service_clients(&self) -> ServiceClients {
        ServiceClients::new(self.auth.clone(), self.vm.clone(), self.storage.clone())
    }

    /// Create calls per service as (auth, vm, storage).
    pub fn create_calls(&self) -> (usize, usize, usize) {
        (
            self.auth.create_calls(),
            self.vm.create_calls(),
            self.storage.create_calls(),
        )
    }

    /// Delete calls per service as (auth, vm, storage).
    pub fn delete_calls(&self) -> (usize, usize, usize) {
        (
            self.auth.delete_calls(),
            self.vm.delete_calls(),
            self.storage.delete_calls(),
        )
    }
}

impl Default for MockClients {
    fn default() -> Self {
        Self::new()
    }
}

/// Config with no backoff or polling delays.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy::immediate(5),
        stuck_after: Duration::from_secs(600),
        release_poll_interval: Duration::ZERO,
        release_timeout: Duration::from_millis(200),
    }
}

/// Orchestrator over a fresh database and the given mocks.
pub async fn test_orchestrator(clients: &MockClients) -> ProjectOrchestrator {
    test_orchestrator_with(clients, fast_config()).await
}

pub async fn test_orchestrator_with(
    clients: &MockClients,
    config: OrchestratorConfig,
) -> ProjectOrchestrator {
    let pool = create_test_db().await;
    ProjectOrchestrator::new(ProjectStore::new(pool), clients.service_clients(), config)
}
