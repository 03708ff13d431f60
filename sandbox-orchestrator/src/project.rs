use chrono::{DateTime, Utc};
use sandbox_clients::{ResourceRef, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

/// A sandbox project and the downstream resources provisioned for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub status: ProjectStatus,
    pub description: Option<String>,

    /// Compare-and-set token, bumped on every write
    pub version: i64,

    #[schema(value_type = Option<String>)]
    pub auth_ref: Option<ResourceRef>,
    #[schema(value_type = Option<String>)]
    pub vm_ref: Option<ResourceRef>,
    #[schema(value_type = Option<String>)]
    pub storage_ref: Option<ResourceRef>,

    pub flavor: Option<String>,
    pub image: Option<String>,
    pub ssh_public_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn resource_ref(&self, step: Step) -> Option<&ResourceRef> {
        match step {
            Step::Auth => self.auth_ref.as_ref(),
            Step::Vm => self.vm_ref.as_ref(),
            Step::Storage => self.storage_ref.as_ref(),
        }
    }

    pub(crate) fn set_resource_ref(&mut self, step: Step, resource: Option<ResourceRef>) {
        match step {
            Step::Auth => self.auth_ref = resource,
            Step::Vm => self.vm_ref = resource,
            Step::Storage => self.storage_ref = resource,
        }
    }

    pub fn has_all_resources(&self) -> bool {
        Step::CREATE_ORDER
            .iter()
            .all(|step| self.resource_ref(*step).is_some())
    }

    pub fn has_any_resource(&self) -> bool {
        Step::CREATE_ORDER
            .iter()
            .any(|step| self.resource_ref(*step).is_some())
    }

    pub fn resource_spec(&self) -> ResourceSpec {
        ResourceSpec {
            project_id: self.id.clone(),
            project_name: self.name.clone(),
            owner: self.owner.clone(),
            flavor: self.flavor.clone(),
            image: self.image.clone(),
            ssh_public_key: self.ssh_public_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    ProvisioningAuth,
    ProvisioningVm,
    ProvisioningStorage,
    Active,
    RollingBack,
    Failed,
    Deleting,
    Deleted,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 9] = [
        ProjectStatus::Pending,
        ProjectStatus::ProvisioningAuth,
        ProjectStatus::ProvisioningVm,
        ProjectStatus::ProvisioningStorage,
        ProjectStatus::Active,
        ProjectStatus::RollingBack,
        ProjectStatus::Failed,
        ProjectStatus::Deleting,
        ProjectStatus::Deleted,
    ];

    /// Statuses a run drives out of on its own; what the reconciler resumes.
    pub const IN_PROGRESS: [ProjectStatus; 6] = [
        ProjectStatus::Pending,
        ProjectStatus::ProvisioningAuth,
        ProjectStatus::ProvisioningVm,
        ProjectStatus::ProvisioningStorage,
        ProjectStatus::RollingBack,
        ProjectStatus::Deleting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::ProvisioningAuth => "provisioning_auth",
            ProjectStatus::ProvisioningVm => "provisioning_vm",
            ProjectStatus::ProvisioningStorage => "provisioning_storage",
            ProjectStatus::Active => "active",
            ProjectStatus::RollingBack => "rolling_back",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Deleting => "deleting",
            ProjectStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Failed | ProjectStatus::Deleted)
    }

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    /// The step a provisioning status is working on.
    pub fn provisioning_step(&self) -> Option<Step> {
        match self {
            ProjectStatus::ProvisioningAuth => Some(Step::Auth),
            ProjectStatus::ProvisioningVm => Some(Step::Vm),
            ProjectStatus::ProvisioningStorage => Some(Step::Storage),
            _ => None,
        }
    }

    /// Legal lifecycle edges. Self-edges on working statuses let a driver
    /// claim a project or persist compensation progress.
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;

        matches!(
            (self, next),
            (Pending, ProvisioningAuth)
                | (ProvisioningAuth, ProvisioningAuth | ProvisioningVm | RollingBack)
                | (ProvisioningVm, ProvisioningVm | ProvisioningStorage | RollingBack)
                | (ProvisioningStorage, ProvisioningStorage | Active | RollingBack)
                | (RollingBack, RollingBack | Failed)
                | (Active, Deleting)
                | (Failed, Deleting)
                | (Deleting, Deleting | Deleted | Failed)
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown project status '{s}'"))
    }
}

/// One of the three downstream resources a project is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Step {
    Auth,
    Vm,
    Storage,
}

impl Step {
    pub const CREATE_ORDER: [Step; 3] = [Step::Auth, Step::Vm, Step::Storage];
    pub const RELEASE_ORDER: [Step; 3] = [Step::Storage, Step::Vm, Step::Auth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Auth => "auth",
            Step::Vm => "vm",
            Step::Storage => "storage",
        }
    }

    /// Status that follows a successful create of this step.
    pub fn next_status(&self) -> ProjectStatus {
        match self {
            Step::Auth => ProjectStatus::ProvisioningVm,
            Step::Vm => ProjectStatus::ProvisioningStorage,
            Step::Storage => ProjectStatus::Active,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    pub name: String,
    /// Overridden with the authenticated user by the HTTP API
    #[serde(default)]
    pub owner: String,
    pub flavor: Option<String>,
    pub image: Option<String>,
    pub ssh_public_key: Option<String>,
    pub description: Option<String>,
}

/// Owner-editable fields. Absent fields are left unchanged; an empty
/// description clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectFilters {
    pub owner: Option<String>,
    pub status: Option<ProjectStatus>,
}

/// Field changes written together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    refs: Vec<(Step, Option<ResourceRef>)>,
    last_error: Option<Option<String>>,
}

impl ProjectUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ref(mut self, step: Step, resource: ResourceRef) -> Self {
        self.refs.push((step, Some(resource)));
        self
    }

    pub fn clear_ref(mut self, step: Step) -> Self {
        self.refs.push((step, None));
        self
    }

    pub fn last_error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    pub fn clear_last_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub(crate) fn apply(self, project: &mut Project) {
        for (step, resource) in self.refs {
            project.set_resource_ref(step, resource);
        }
        if let Some(last_error) = self.last_error {
            project.last_error = last_error;
        }
    }
}
