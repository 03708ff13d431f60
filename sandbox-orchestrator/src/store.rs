use crate::error::{OrchestratorError, Result};
use crate::event::{EventFilters, EventKind, ProjectEvent};
use crate::project::{
    CreateProjectRequest, Project, ProjectFilters, ProjectStatus, ProjectUpdate, Step,
    UpdateProjectRequest,
};
use crate::step::{Direction, StepOutcome, StepRecord};
use chrono::{DateTime, Utc};
use sandbox_clients::ResourceRef;
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 255;

/// Durable record of every project and its step history.
///
/// All project writes go through [`ProjectStore::update_status`], a
/// compare-and-set on `(id, status, version)`.
#[derive(Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new project in `pending`
    #[instrument(skip(self, req), fields(owner = %req.owner))]
    pub async fn create_pending(&self, req: CreateProjectRequest) -> Result<Project> {
        let name = validate_name(&req.name)?;
        if req.owner.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "project owner must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let description = normalize_description(req.description.as_deref());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, owner, status, version, flavor, image, ssh_public_key, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(req.owner.trim())
        .bind(ProjectStatus::Pending)
        .bind(&req.flavor)
        .bind(&req.image)
        .bind(&req.ssh_public_key)
        .bind(&description)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let event = ProjectEvent::new(&id, EventKind::Created, format!("project '{name}' created"))
            .with_status(ProjectStatus::Pending);
        insert_event(&mut *tx, &event).await?;
        tx.commit().await?;

        debug!(project_id = %id, "Inserted pending project");

        self.get(&id).await
    }

    /// Get a single project by ID
    pub async fn get(&self, id: &str) -> Result<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    /// List projects with optional filters, newest first
    pub async fn list(&self, filters: ProjectFilters) -> Result<Vec<Project>> {
        let mut query = "SELECT * FROM projects WHERE 1=1".to_string();

        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC, id");

        let mut q = sqlx::query_as::<_, ProjectRow>(&query);

        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(status) = filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Move `current` to `status`, writing `update` in the same statement.
    ///
    /// Fails with `Conflict` when the edge is not legal or when the stored
    /// record no longer matches `current`'s status and version.
    #[instrument(
        skip(self, current, update),
        fields(project_id = %current.id, from = %current.status, to = %status)
    )]
    pub async fn update_status(
        &self,
        current: &Project,
        status: ProjectStatus,
        update: ProjectUpdate,
    ) -> Result<Project> {
        if !current.status.can_transition_to(status) {
            return Err(OrchestratorError::Conflict(format!(
                "illegal transition {} -> {} for project {}",
                current.status, status, current.id
            )));
        }

        let mut next = current.clone();
        update.apply(&mut next);
        next.status = status;
        next.version = current.version + 1;

        if status == ProjectStatus::Active && !next.has_all_resources() {
            return Err(OrchestratorError::InvalidState(format!(
                "project {} cannot be active without all resource refs",
                current.id
            )));
        }
        if status == ProjectStatus::Deleted && next.has_any_resource() {
            return Err(OrchestratorError::InvalidState(format!(
                "project {} cannot be deleted while resource refs remain",
                current.id
            )));
        }

        let now = Utc::now()
            .timestamp_millis()
            .max(current.updated_at.timestamp_millis());
        next.updated_at = from_millis(now);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE projects
             SET status = ?, version = ?, auth_ref = ?, vm_ref = ?, storage_ref = ?, last_error = ?, updated_at = ?
             WHERE id = ? AND status = ? AND version = ?",
        )
        .bind(next.status)
        .bind(next.version)
        .bind(next.auth_ref.as_ref().map(ResourceRef::as_str))
        .bind(next.vm_ref.as_ref().map(ResourceRef::as_str))
        .bind(next.storage_ref.as_ref().map(ResourceRef::as_str))
        .bind(&next.last_error)
        .bind(now)
        .bind(&current.id)
        .bind(current.status)
        .bind(current.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "project {} moved on from {} v{}",
                current.id, current.status, current.version
            )));
        }

        // Self-transitions are claims and bookkeeping, not history
        if status != current.status {
            let mut message = format!("{} -> {}", current.status, status);
            if let Some(error) = next.last_error.as_deref().filter(|_| status.is_terminal()) {
                message.push_str(": ");
                message.push_str(error);
            }
            let mut event = ProjectEvent::new(&current.id, EventKind::StatusChanged, message)
                .with_status(status);
            event.created_at = next.updated_at;
            insert_event(&mut *tx, &event).await?;
        }
        tx.commit().await?;

        Ok(next)
    }

    /// Write owner-editable fields, compare-and-set on status and version
    #[instrument(skip(self, current, req), fields(project_id = %current.id))]
    pub async fn update_details(
        &self,
        current: &Project,
        req: &UpdateProjectRequest,
    ) -> Result<Project> {
        let mut next = current.clone();
        let mut changed = Vec::new();

        if let Some(name) = &req.name {
            let name = validate_name(name)?;
            if name != current.name {
                next.name = name.to_string();
                changed.push("name");
            }
        }
        if let Some(description) = req.description.as_deref() {
            let description = normalize_description(Some(description));
            if description != current.description {
                next.description = description;
                changed.push("description");
            }
        }
        if changed.is_empty() {
            return Ok(next);
        }

        next.version = current.version + 1;
        let now = Utc::now()
            .timestamp_millis()
            .max(current.updated_at.timestamp_millis());
        next.updated_at = from_millis(now);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE projects SET name = ?, description = ?, version = ?, updated_at = ?
             WHERE id = ? AND status = ? AND version = ?",
        )
        .bind(&next.name)
        .bind(&next.description)
        .bind(next.version)
        .bind(now)
        .bind(&current.id)
        .bind(current.status)
        .bind(current.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "project {} moved on from {} v{}",
                current.id, current.status, current.version
            )));
        }

        let mut event = ProjectEvent::new(
            &current.id,
            EventKind::Updated,
            format!("updated {}", changed.join(", ")),
        );
        event.created_at = next.updated_at;
        insert_event(&mut *tx, &event).await?;
        tx.commit().await?;

        Ok(next)
    }

    /// Projects in a working status whose last write is older than `older_than`
    pub async fn list_stuck(&self, older_than: Duration) -> Result<Vec<Project>> {
        let cutoff = Utc::now().timestamp_millis()
            - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);

        let placeholders = vec!["?"; ProjectStatus::IN_PROGRESS.len()].join(", ");
        let query = format!(
            "SELECT * FROM projects WHERE status IN ({placeholders}) AND updated_at < ? ORDER BY updated_at ASC"
        );

        let mut q = sqlx::query_as::<_, ProjectRow>(&query);
        for status in ProjectStatus::IN_PROGRESS {
            q = q.bind(status);
        }

        let rows = q.bind(cutoff).fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Upsert the attempt history for one project/step/direction
    pub async fn record_step(&self, record: &StepRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_records (project_id, step, direction, attempts, last_attempt_at, outcome, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, step, direction) DO UPDATE SET
                attempts = excluded.attempts,
                last_attempt_at = excluded.last_attempt_at,
                outcome = excluded.outcome,
                last_error = excluded.last_error
            "#,
        )
        .bind(&record.project_id)
        .bind(record.step)
        .bind(record.direction)
        .bind(i64::from(record.attempts))
        .bind(record.last_attempt_at.timestamp_millis())
        .bind(record.outcome)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_step(
        &self,
        project_id: &str,
        step: Step,
        direction: Direction,
    ) -> Result<Option<StepRecord>> {
        let row = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM step_records WHERE project_id = ? AND step = ? AND direction = ?",
        )
        .bind(project_id)
        .bind(step)
        .bind(direction)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Step history of a project in the order attempts were made
    pub async fn list_steps(&self, project_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM step_records WHERE project_id = ? ORDER BY last_attempt_at ASC, rowid ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Append an event outside of any status write
    pub async fn record_event(&self, event: &ProjectEvent) -> Result<ProjectEvent> {
        let mut conn = self.pool.acquire().await?;
        let id = insert_event(&mut *conn, event).await?;

        Ok(ProjectEvent {
            id,
            ..event.clone()
        })
    }

    pub async fn list_events(
        &self,
        project_id: &str,
        filters: &EventFilters,
    ) -> Result<Vec<ProjectEvent>> {
        let mut query = "SELECT * FROM project_events WHERE project_id = ?".to_string();
        if filters.kind.is_some() {
            query.push_str(" AND kind = ?");
        }
        if filters.newest_first {
            query.push_str(" ORDER BY created_at DESC, id DESC");
        } else {
            query.push_str(" ORDER BY created_at ASC, id ASC");
        }

        let mut q = sqlx::query_as::<_, EventRow>(&query).bind(project_id);
        if let Some(kind) = filters.kind {
            q = q.bind(kind);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Most recent event of one kind
    pub async fn latest_event(
        &self,
        project_id: &str,
        kind: EventKind,
    ) -> Result<Option<ProjectEvent>> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM project_events WHERE project_id = ? AND kind = ?
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(project_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}

async fn insert_event(conn: &mut SqliteConnection, event: &ProjectEvent) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO project_events (project_id, kind, step, status, pipeline_id, message, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.project_id)
    .bind(event.kind)
    .bind(&event.step)
    .bind(&event.status)
    .bind(&event.pipeline_id)
    .bind(&event.message)
    .bind(event.created_at.timestamp_millis())
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

fn validate_name(raw: &str) -> Result<&str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(OrchestratorError::InvalidInput(
            "project name must not be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(OrchestratorError::InvalidInput(format!(
            "project name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

fn normalize_description(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    owner: String,
    status: ProjectStatus,
    description: Option<String>,
    version: i64,
    auth_ref: Option<String>,
    vm_ref: Option<String>,
    storage_ref: Option<String>,
    flavor: Option<String>,
    image: Option<String>,
    ssh_public_key: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    project_id: String,
    step: Step,
    direction: Direction,
    attempts: i64,
    last_attempt_at: i64,
    outcome: StepOutcome,
    last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    project_id: String,
    kind: EventKind,
    step: Option<String>,
    status: Option<String>,
    pipeline_id: Option<String>,
    message: String,
    created_at: i64,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            status: row.status,
            description: row.description,
            version: row.version,
            auth_ref: row.auth_ref.map(ResourceRef),
            vm_ref: row.vm_ref.map(ResourceRef),
            storage_ref: row.storage_ref.map(ResourceRef),
            flavor: row.flavor,
            image: row.image,
            ssh_public_key: row.ssh_public_key,
            last_error: row.last_error,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

impl From<StepRow> for StepRecord {
    fn from(row: StepRow) -> Self {
        Self {
            project_id: row.project_id,
            step: row.step,
            direction: row.direction,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            last_attempt_at: from_millis(row.last_attempt_at),
            outcome: row.outcome,
            last_error: row.last_error,
        }
    }
}

impl From<EventRow> for ProjectEvent {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            kind: row.kind,
            step: row.step,
            status: row.status,
            pipeline_id: row.pipeline_id,
            message: row.message,
            created_at: from_millis(row.created_at),
        }
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
