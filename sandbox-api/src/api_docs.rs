use crate::error::ErrorBody;
use crate::routes::projects::BuildStatusResponse;
use sandbox_orchestrator::{
    BuildStatusUpdate, CreateProjectRequest, Direction, EventKind, Project, ProjectEvent,
    ProjectStatus, Step, StepOutcome, StepRecord, UpdateProjectRequest,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::projects::list_projects,
        crate::routes::projects::create_project,
        crate::routes::projects::get_project,
        crate::routes::projects::update_project,
        crate::routes::projects::delete_project,
        crate::routes::projects::list_steps,
        crate::routes::projects::list_events,
        crate::routes::projects::get_build_status,
        crate::routes::projects::update_build_status,
    ),
    components(
        schemas(
            Project,
            ProjectStatus,
            CreateProjectRequest,
            UpdateProjectRequest,
            StepRecord,
            Step,
            Direction,
            StepOutcome,
            ProjectEvent,
            EventKind,
            BuildStatusUpdate,
            BuildStatusResponse,
            ErrorBody
        )
    ),
    tags(
        (name = "projects", description = "Sandbox project lifecycle"),
        (name = "health", description = "Liveness and readiness")
    )
)]
pub struct ApiDoc;
