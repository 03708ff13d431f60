//! Shared helpers for orchestrator integration tests
#![allow(dead_code)]

use sandbox_clients::ResourceRef;
use sandbox_orchestrator::{
    CreateProjectRequest, Project, ProjectOrchestrator, ProjectStatus, ProjectStore,
    ProjectUpdate, Step,
};
use std::time::Duration;

pub use sandbox_orchestrator::test_utils::{
    create_test_db, fast_config, test_orchestrator, test_orchestrator_with, MockClients,
};

pub fn request(name: &str, owner: &str) -> CreateProjectRequest {
    CreateProjectRequest {
        name: name.to_string(),
        owner: owner.to_string(),
        flavor: Some("small".to_string()),
        image: Some("ubuntu-22.04".to_string()),
        ssh_public_key: None,
        description: None,
    }
}

/// Pretend the project's last write happened `by` ago.
pub async fn backdate(store: &ProjectStore, id: &str, by: Duration) {
    sqlx::query("UPDATE projects SET updated_at = updated_at - ? WHERE id = ?")
        .bind(by.as_millis() as i64)
        .bind(id)
        .execute(store.pool())
        .await
        .expect("Failed to backdate project");
}

/// Leave a project as a driver that died right after creating the auth grant would.
pub async fn frozen_in_provisioning_vm(
    orchestrator: &ProjectOrchestrator,
    mocks: &MockClients,
    name: &str,
) -> Project {
    let store = orchestrator.store();
    let project = orchestrator
        .create_project(request(name, "alice"))
        .await
        .expect("Failed to create project");

    let grant = ResourceRef::new(format!("grant-{}", project.id));
    mocks.auth.seed_resource(&grant, &project.id);

    let project = store
        .update_status(&project, ProjectStatus::ProvisioningAuth, ProjectUpdate::new())
        .await
        .expect("Failed to claim");
    store
        .update_status(
            &project,
            ProjectStatus::ProvisioningVm,
            ProjectUpdate::new().set_ref(Step::Auth, grant),
        )
        .await
        .expect("Failed to record auth grant")
}
