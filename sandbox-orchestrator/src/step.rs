use crate::project::Step;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Direction {
    Create,
    Delete,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Create => "create",
            Direction::Delete => "delete",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StepOutcome {
    Pending,
    Success,
    Failed,
}

/// Attempt history of one downstream call, per project, step and direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepRecord {
    pub project_id: String,
    pub step: Step,
    pub direction: Direction,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StepRecord {
    pub fn new(project_id: impl Into<String>, step: Step, direction: Direction) -> Self {
        Self {
            project_id: project_id.into(),
            step,
            direction,
            attempts: 0,
            last_attempt_at: Utc::now(),
            outcome: StepOutcome::Pending,
            last_error: None,
        }
    }

    /// Record the start of another attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt_at = Utc::now();
        self.outcome = StepOutcome::Pending;
    }

    pub fn succeed(&mut self) {
        self.outcome = StepOutcome::Success;
        self.last_error = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.outcome = StepOutcome::Failed;
        self.last_error = Some(message.into());
    }
}
