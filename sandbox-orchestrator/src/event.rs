use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged,
    StepSucceeded,
    StepFailed,
    Updated,
    /// A resource created by a driver that had already lost its claim
    ResourceOrphaned,
    /// Progress reported by the project's build pipeline
    Build,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Created,
        EventKind::StatusChanged,
        EventKind::StepSucceeded,
        EventKind::StepFailed,
        EventKind::Updated,
        EventKind::ResourceOrphaned,
        EventKind::Build,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::StatusChanged => "status_changed",
            EventKind::StepSucceeded => "step_succeeded",
            EventKind::StepFailed => "step_failed",
            EventKind::Updated => "updated",
            EventKind::ResourceOrphaned => "resource_orphaned",
            EventKind::Build => "build",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

/// One entry in a project's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProjectEvent {
    /// Assigned by the store; zero until recorded
    pub id: i64,
    pub project_id: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ProjectEvent {
    pub fn new(project_id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            project_id: project_id.into(),
            kind,
            step: None,
            status: None,
            pipeline_id: None,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl fmt::Display) -> Self {
        self.step = Some(step.to_string());
        self
    }

    pub fn with_status(mut self, status: impl fmt::Display) -> Self {
        self.status = Some(status.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventFilters {
    pub kind: Option<EventKind>,
    pub newest_first: bool,
}

impl Default for EventFilters {
    fn default() -> Self {
        Self {
            kind: None,
            newest_first: true,
        }
    }
}

/// Build progress pushed by the pipeline that prepares a project's image.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BuildStatusUpdate {
    pub status: String,
    pub step: String,
    pub message: Option<String>,
    pub pipeline_id: Option<String>,
}
