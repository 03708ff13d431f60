use crate::{
    auth::{owned_project, AuthenticatedUser},
    error::{ApiError, ApiResult, ErrorBody},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use sandbox_orchestrator::{
    BuildStatusUpdate, ClaimedProject, CreateProjectRequest, DeleteTicket, EventFilters,
    EventKind, Project, ProjectEvent, ProjectFilters, ProjectOrchestrator, ProjectStatus,
    RunOutcome, StepRecord, UpdateProjectRequest,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, Instrument};
use utoipa::{IntoParams, ToSchema};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/projects",
            get(list_projects).post(create_project),
        )
        .route(
            "/api/v1/projects/{id}",
            get(get_project)
                .patch(update_project)
                .delete(delete_project),
        )
        .route("/api/v1/projects/{id}/steps", get(list_steps))
        .route("/api/v1/projects/{id}/events", get(list_events))
        .route(
            "/api/v1/projects/{id}/build-status",
            get(get_build_status).patch(update_build_status),
        )
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListProjectsQuery {
    /// Only return projects in this status
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListEventsQuery {
    /// Only return events of this kind
    pub kind: Option<String>,
    /// Newest events first (default true)
    pub newest_first: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BuildStatusResponse {
    pub project_id: String,
    /// Latest report from the build pipeline, if any
    pub build_status: Option<ProjectEvent>,
}

/// Create a project and start provisioning it in the background
#[utoipa::path(
    post,
    path = "/api/v1/projects",
    tag = "projects",
    request_body = CreateProjectRequest,
    responses(
        (status = 202, description = "Project accepted, provisioning started", body = Project),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing identity header"),
    )
)]
pub async fn create_project(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(mut req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    info!(
        owner = %user.username,
        email = user.email.as_deref().unwrap_or("-"),
        name = %req.name,
        "Creating project"
    );

    // Override owner with authenticated user
    req.owner = user.username;

    let project = state.orchestrator.create_project(req).await?;
    spawn_run(state.orchestrator.clone(), project.id.clone());

    Ok((StatusCode::ACCEPTED, Json(project)))
}

/// List the caller's projects
#[utoipa::path(
    get,
    path = "/api/v1/projects",
    tag = "projects",
    params(ListProjectsQuery),
    responses(
        (status = 200, description = "Projects owned by the caller", body = [Project]),
        (status = 400, description = "Unknown status filter", body = ErrorBody),
        (status = 401, description = "Missing identity header"),
    )
)]
pub async fn list_projects(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListProjectsQuery>,
) -> ApiResult<Json<Vec<Project>>> {
    let status = query
        .status
        .map(|s| s.parse::<ProjectStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let filters = ProjectFilters {
        owner: Some(user.username),
        status,
    };

    let projects = state.orchestrator.list_projects(filters).await?;

    Ok(Json(projects))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}",
    tag = "projects",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Project found", body = Project),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
    )
)]
pub async fn get_project(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Project>> {
    let project = owned_project(&state.orchestrator, &id, &user).await?;

    Ok(Json(project))
}

/// Rename a project or change its description
#[utoipa::path(
    patch,
    path = "/api/v1/projects/{id}",
    tag = "projects",
    params(("id" = String, Path, description = "Project id")),
    request_body = UpdateProjectRequest,
    responses(
        (status = 200, description = "Project updated", body = Project),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
        (status = 409, description = "Project is mid-workflow or changed concurrently", body = ErrorBody),
    )
)]
pub async fn update_project(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> ApiResult<Json<Project>> {
    owned_project(&state.orchestrator, &id, &user).await?;

    let project = state.orchestrator.update_project(&id, req).await?;

    Ok(Json(project))
}

/// Release a project's resources in the background
#[utoipa::path(
    delete,
    path = "/api/v1/projects/{id}",
    tag = "projects",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 202, description = "Deletion started", body = Project),
        (status = 200, description = "Project was already deleted", body = Project),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
        (status = 409, description = "Project is mid-workflow or changed concurrently", body = ErrorBody),
    )
)]
pub async fn delete_project(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    owned_project(&state.orchestrator, &id, &user).await?;

    match state.orchestrator.request_delete(&id).await? {
        DeleteTicket::AlreadyDeleted(project) => Ok((StatusCode::OK, Json(project))),
        DeleteTicket::Claimed(claimed) => {
            let project = claimed.project().clone();
            spawn_drive(state.orchestrator.clone(), claimed);
            Ok((StatusCode::ACCEPTED, Json(project)))
        }
    }
}

/// Attempt history of every downstream call made for the project
#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}/steps",
    tag = "projects",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Step records", body = [StepRecord]),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
    )
)]
pub async fn list_steps(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StepRecord>>> {
    owned_project(&state.orchestrator, &id, &user).await?;

    let steps = state.orchestrator.list_steps(&id).await?;

    Ok(Json(steps))
}

/// History of the project: status changes, step results, edits and builds
#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}/events",
    tag = "projects",
    params(("id" = String, Path, description = "Project id"), ListEventsQuery),
    responses(
        (status = 200, description = "Project events", body = [ProjectEvent]),
        (status = 400, description = "Unknown event kind", body = ErrorBody),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
    )
)]
pub async fn list_events(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<ProjectEvent>>> {
    let kind = query
        .kind
        .map(|k| k.parse::<EventKind>())
        .transpose()
        .map_err(ApiError::BadRequest)?;

    owned_project(&state.orchestrator, &id, &user).await?;

    let filters = EventFilters {
        kind,
        newest_first: query.newest_first.unwrap_or(true),
    };
    let events = state.orchestrator.list_events(&id, filters).await?;

    Ok(Json(events))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}/build-status",
    tag = "projects",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Latest build status", body = BuildStatusResponse),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
    )
)]
pub async fn get_build_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<BuildStatusResponse>> {
    owned_project(&state.orchestrator, &id, &user).await?;

    let build_status = state.orchestrator.build_status(&id).await?;

    Ok(Json(BuildStatusResponse {
        project_id: id,
        build_status,
    }))
}

/// Report build pipeline progress for a project
#[utoipa::path(
    patch,
    path = "/api/v1/projects/{id}/build-status",
    tag = "projects",
    params(("id" = String, Path, description = "Project id")),
    request_body = BuildStatusUpdate,
    responses(
        (status = 200, description = "Build status recorded", body = ProjectEvent),
        (status = 400, description = "Missing status or step", body = ErrorBody),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found", body = ErrorBody),
        (status = 409, description = "Project is deleted", body = ErrorBody),
    )
)]
pub async fn update_build_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(update): Json<BuildStatusUpdate>,
) -> ApiResult<Json<ProjectEvent>> {
    owned_project(&state.orchestrator, &id, &user).await?;

    let event = state.orchestrator.record_build_status(&id, update).await?;

    Ok(Json(event))
}

fn spawn_run(orchestrator: ProjectOrchestrator, id: String) {
    let span = tracing::info_span!("provision", project_id = %id);
    tokio::spawn(
        async move {
            log_outcome(orchestrator.run(&id).await);
        }
        .instrument(span),
    );
}

fn spawn_drive(orchestrator: ProjectOrchestrator, claimed: ClaimedProject) {
    let span = tracing::info_span!("delete", project_id = %claimed.project().id);
    tokio::spawn(
        async move {
            log_outcome(orchestrator.drive(claimed).await);
        }
        .instrument(span),
    );
}

// The reconciler picks up anything left behind by a failed run
fn log_outcome(outcome: sandbox_orchestrator::Result<RunOutcome>) {
    match outcome {
        Ok(RunOutcome::Completed(project)) => {
            info!(status = %project.status, "Background run finished")
        }
        Ok(RunOutcome::Superseded) => info!("Background run superseded"),
        Err(e) => error!("Background run failed: {}", e),
    }
}
