//! Sandbox project lifecycle orchestration
//!
//! This crate owns the project record and drives each project through its
//! downstream resources (auth grant, VM, storage repository), compensating
//! in reverse order when a step fails. It is consumed by the sandbox-api HTTP
//! service but can also be driven from background workers or tests.

pub mod db;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod project;
pub mod reconciler;
pub mod retry;
pub mod step;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{OrchestratorError, Result};
pub use event::{BuildStatusUpdate, EventFilters, EventKind, ProjectEvent};
pub use lifecycle::{
    ClaimedProject, DeleteTicket, OrchestratorConfig, ProjectOrchestrator, RunOutcome,
    ServiceClients,
};
pub use project::{
    CreateProjectRequest, Project, ProjectFilters, ProjectStatus, ProjectUpdate, Step,
    UpdateProjectRequest,
};
pub use reconciler::{Reconciler, SweepReport};
pub use retry::{RetryPolicy, StepFailure};
pub use step::{Direction, StepOutcome, StepRecord};
pub use store::ProjectStore;
