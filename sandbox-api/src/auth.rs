use crate::error::ApiError;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use sandbox_orchestrator::{Project, ProjectOrchestrator};

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub username: String,
    pub email: Option<String>,
}

/// Auth middleware - extracts the user set by the authenticating proxy
///
/// The proxy in front of the service sets `x-forwarded-user` after it has
/// verified the caller; `x-user` is accepted for local development.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = req
        .headers()
        .get("x-forwarded-user") // oauth2-proxy format
        .or_else(|| req.headers().get("x-user")) // fallback for dev
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let email = req
        .headers()
        .get("x-forwarded-email")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    // If no username, return 401
    let username = username.ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut()
        .insert(AuthenticatedUser { username, email });

    Ok(next.run(req).await)
}

/// Load a project and check the authenticated user owns it
///
/// Returns the project if the user owns it, otherwise returns:
/// - ApiError::NotFound if the project doesn't exist
/// - ApiError::Forbidden if the project exists but the user is not the owner
pub async fn owned_project(
    orchestrator: &ProjectOrchestrator,
    project_id: &str,
    user: &AuthenticatedUser,
) -> Result<Project, ApiError> {
    let project = orchestrator.get_project(project_id).await?;

    if project.owner != user.username {
        return Err(ApiError::Forbidden(format!(
            "Access denied: project {} is owned by {}",
            project_id, project.owner
        )));
    }

    Ok(project)
}
