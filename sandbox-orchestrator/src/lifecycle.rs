//! Drives projects through their provisioning and deletion lifecycle.
//!
//! Every status change is a compare-and-set in the [`ProjectStore`]; a driver
//! that loses one stops and reports [`RunOutcome::Superseded`], so at most one
//! driver works on a project at a time without any lock.

use crate::error::{OrchestratorError, Result};
use crate::event::{BuildStatusUpdate, EventFilters, EventKind, ProjectEvent};
use crate::project::{
    CreateProjectRequest, Project, ProjectFilters, ProjectStatus, ProjectUpdate, Step,
    UpdateProjectRequest,
};
use crate::retry::{RetryPolicy, StepFailure};
use crate::step::{Direction, StepRecord};
use crate::store::ProjectStore;
use chrono::Utc;
use sandbox_clients::{ClientError, ResourceRef, ResourceStatus, ServiceClient};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

type StepResult<T> = std::result::Result<T, StepFailure>;

/// The three downstream services a project spans.
#[derive(Clone)]
pub struct ServiceClients {
    pub auth: Arc<dyn ServiceClient>,
    pub vm: Arc<dyn ServiceClient>,
    pub storage: Arc<dyn ServiceClient>,
}

impl ServiceClients {
    pub fn new(
        auth: Arc<dyn ServiceClient>,
        vm: Arc<dyn ServiceClient>,
        storage: Arc<dyn ServiceClient>,
    ) -> Self {
        Self { auth, vm, storage }
    }

    pub fn for_step(&self, step: Step) -> &Arc<dyn ServiceClient> {
        match step {
            Step::Auth => &self.auth,
            Step::Vm => &self.vm,
            Step::Storage => &self.storage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// Age after which a working project is considered abandoned by its driver.
    /// Live drivers renew their claim well within it.
    pub stuck_after: Duration,
    pub release_poll_interval: Duration,
    /// How long to wait for a deleted VM to report gone
    pub release_timeout: Duration,
}

impl OrchestratorConfig {
    /// How often a driver renews its claim while it waits on a downstream call.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stuck_after / 4).max(Duration::from_millis(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.stuck_after.is_zero() {
            return Err(OrchestratorError::InvalidInput(
                "stuck_after must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::InvalidInput(
                "retry policy must allow at least one attempt".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(OrchestratorError::InvalidInput(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.release_poll_interval > self.release_timeout {
            return Err(OrchestratorError::InvalidInput(format!(
                "release poll interval {:?} exceeds release timeout {:?}",
                self.release_poll_interval, self.release_timeout
            )));
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stuck_after: Duration::from_secs(600),
            release_poll_interval: Duration::from_secs(5),
            release_timeout: Duration::from_secs(600),
        }
    }
}

/// A project this driver has just won the compare-and-set for.
///
/// Only the orchestrator hands these out, so [`ProjectOrchestrator::drive`]
/// never runs on a project somebody else owns.
#[derive(Debug)]
pub struct ClaimedProject {
    project: Project,
}

impl ClaimedProject {
    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn into_project(self) -> Project {
        self.project
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The project settled in `active`, `failed` or `deleted`.
    Completed(Project),
    /// Another writer owns the project; nothing was done.
    Superseded,
}

impl RunOutcome {
    pub fn project(&self) -> Option<&Project> {
        match self {
            RunOutcome::Completed(project) => Some(project),
            RunOutcome::Superseded => None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, RunOutcome::Superseded)
    }
}

#[derive(Debug)]
pub enum DeleteTicket {
    /// The project moved to `deleting` and is ready to drive.
    Claimed(ClaimedProject),
    AlreadyDeleted(Project),
}

impl DeleteTicket {
    pub fn project(&self) -> &Project {
        match self {
            DeleteTicket::Claimed(claimed) => claimed.project(),
            DeleteTicket::AlreadyDeleted(project) => project,
        }
    }
}

#[derive(Clone)]
pub struct ProjectOrchestrator {
    store: ProjectStore,
    clients: Arc<ServiceClients>,
    config: Arc<OrchestratorConfig>,
}

impl ProjectOrchestrator {
    pub fn new(store: ProjectStore, clients: ServiceClients, config: OrchestratorConfig) -> Self {
        Self {
            store,
            clients: Arc::new(clients),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Record a new project in `pending`. Nothing is provisioned until it is run.
    pub async fn create_project(&self, req: CreateProjectRequest) -> Result<Project> {
        let project = self.store.create_pending(req).await?;
        info!(project_id = %project.id, owner = %project.owner, "Project created");
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        self.store.get(id).await
    }

    pub async fn list_projects(&self, filters: ProjectFilters) -> Result<Vec<Project>> {
        self.store.list(filters).await
    }

    pub async fn list_steps(&self, id: &str) -> Result<Vec<StepRecord>> {
        self.store.get(id).await?;
        self.store.list_steps(id).await
    }

    /// Rename a project or change its description.
    ///
    /// Only settled, live projects are editable; a project being driven
    /// is rejected with `InvalidState` rather than racing its driver.
    #[instrument(skip(self, req), fields(project_id = %id))]
    pub async fn update_project(&self, id: &str, req: UpdateProjectRequest) -> Result<Project> {
        let project = self.store.get(id).await?;

        match project.status {
            ProjectStatus::Active | ProjectStatus::Failed => {
                let project = self.store.update_details(&project, &req).await?;
                info!(version = project.version, "Project updated");
                Ok(project)
            }
            status => Err(OrchestratorError::InvalidState(format!(
                "project {id} is {status}; it can be edited once it is active or failed"
            ))),
        }
    }

    pub async fn list_events(&self, id: &str, filters: EventFilters) -> Result<Vec<ProjectEvent>> {
        self.store.get(id).await?;
        self.store.list_events(id, &filters).await
    }

    /// Record build progress reported by the project's pipeline.
    #[instrument(skip(self, update), fields(project_id = %id, build_step = %update.step))]
    pub async fn record_build_status(
        &self,
        id: &str,
        update: BuildStatusUpdate,
    ) -> Result<ProjectEvent> {
        let project = self.store.get(id).await?;
        if project.status == ProjectStatus::Deleted {
            return Err(OrchestratorError::InvalidState(format!(
                "project {id} is deleted"
            )));
        }
        if update.status.trim().is_empty() || update.step.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "build status and step must not be empty".to_string(),
            ));
        }

        let message = update
            .message
            .clone()
            .unwrap_or_else(|| format!("{} {}", update.step.trim(), update.status.trim()));
        let mut event = ProjectEvent::new(id, EventKind::Build, message)
            .with_step(update.step.trim())
            .with_status(update.status.trim());
        event.pipeline_id = update.pipeline_id;

        let event = self.store.record_event(&event).await?;
        debug!(event_id = event.id, "Build status recorded");
        Ok(event)
    }

    /// Latest build progress, if the pipeline has reported any.
    pub async fn build_status(&self, id: &str) -> Result<Option<ProjectEvent>> {
        self.store.get(id).await?;
        self.store.latest_event(id, EventKind::Build).await
    }

    /// Resume a project from whatever status it is stored in.
    ///
    /// Settled projects are returned untouched. A working project is only
    /// re-claimed once its last write is older than `stuck_after`.
    #[instrument(skip(self), fields(project_id = %id))]
    pub async fn run(&self, id: &str) -> Result<RunOutcome> {
        let project = self.store.get(id).await?;

        let claim = match project.status {
            ProjectStatus::Active | ProjectStatus::Failed | ProjectStatus::Deleted => {
                debug!(status = %project.status, "Nothing to do");
                return Ok(RunOutcome::Completed(project));
            }
            ProjectStatus::Pending => {
                self.store
                    .update_status(&project, ProjectStatus::ProvisioningAuth, ProjectUpdate::new())
                    .await
            }
            status => {
                if !self.is_abandoned(&project) {
                    debug!(status = %status, "Project is being driven elsewhere");
                    return Ok(RunOutcome::Superseded);
                }
                info!(status = %status, "Re-claiming abandoned project");
                self.store
                    .update_status(&project, status, ProjectUpdate::new())
                    .await
            }
        };

        match claim {
            Ok(project) => self.drive(ClaimedProject { project }).await,
            Err(e) if e.is_conflict() => {
                debug!("Lost claim: {}", e);
                Ok(RunOutcome::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a claimed project until it settles or loses a compare-and-set.
    #[instrument(skip(self, claimed), fields(project_id = %claimed.project.id))]
    pub async fn drive(&self, claimed: ClaimedProject) -> Result<RunOutcome> {
        match self.advance(claimed.project).await {
            Ok(project) => {
                info!(status = %project.status, "Project settled");
                Ok(RunOutcome::Completed(project))
            }
            Err(e) if e.is_conflict() => {
                info!("Superseded: {}", e);
                Ok(RunOutcome::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    /// Move an `active` or `failed` project to `deleting`.
    ///
    /// Projects still provisioning or rolling back are rejected with
    /// `InvalidState`; a lost race surfaces as `Conflict`.
    #[instrument(skip(self), fields(project_id = %id))]
    pub async fn request_delete(&self, id: &str) -> Result<DeleteTicket> {
        let project = self.store.get(id).await?;

        match project.status {
            ProjectStatus::Deleted => Ok(DeleteTicket::AlreadyDeleted(project)),
            ProjectStatus::Active | ProjectStatus::Failed => {
                let project = self
                    .store
                    .update_status(&project, ProjectStatus::Deleting, ProjectUpdate::new())
                    .await?;
                info!("Deletion requested");
                Ok(DeleteTicket::Claimed(ClaimedProject { project }))
            }
            status => Err(OrchestratorError::InvalidState(format!(
                "project {id} is {status}; it can be deleted once it is active or failed"
            ))),
        }
    }

    /// Request deletion and drive it to completion.
    pub async fn delete_project(&self, id: &str) -> Result<RunOutcome> {
        match self.request_delete(id).await? {
            DeleteTicket::AlreadyDeleted(project) => Ok(RunOutcome::Completed(project)),
            DeleteTicket::Claimed(claimed) => self.drive(claimed).await,
        }
    }

    fn is_abandoned(&self, project: &Project) -> bool {
        Utc::now()
            .signed_duration_since(project.updated_at)
            .to_std()
            .map(|age| age >= self.config.stuck_after)
            .unwrap_or(false)
    }

    async fn advance(&self, mut project: Project) -> Result<Project> {
        loop {
            project = match project.status {
                ProjectStatus::ProvisioningAuth => self.provision(project, Step::Auth).await?,
                ProjectStatus::ProvisioningVm => self.provision(project, Step::Vm).await?,
                ProjectStatus::ProvisioningStorage => {
                    self.provision(project, Step::Storage).await?
                }
                ProjectStatus::RollingBack | ProjectStatus::Deleting => {
                    self.release_all(project).await?
                }
                _ => return Ok(project),
            };
        }
    }

    /// Create one step's resource and advance past it in a single write.
    async fn provision(&self, mut project: Project, step: Step) -> Result<Project> {
        if project.resource_ref(step).is_some() {
            debug!(step = %step, "Resource already recorded, skipping create");
            return self
                .store
                .update_status(&project, step.next_status(), ProjectUpdate::new())
                .await;
        }

        let client = Arc::clone(self.clients.for_step(step));
        let spec = project.resource_spec();
        let created = self
            .call_with_retry(&mut project, step, Direction::Create, move || {
                let client = Arc::clone(&client);
                let spec = spec.clone();
                async move { client.create(&spec).await }
            })
            .await?;

        match created {
            Ok(resource) => {
                info!(step = %step, resource_ref = %resource, "Resource created");
                let update = ProjectUpdate::new().set_ref(step, resource.clone());
                match self
                    .store
                    .update_status(&project, step.next_status(), update)
                    .await
                {
                    Err(e) if e.is_conflict() => {
                        self.release_orphan(&project.id, step, &resource).await;
                        Err(e)
                    }
                    other => other,
                }
            }
            Err(failure) => {
                warn!(step = %step, error = %failure, "Provisioning step failed, rolling back");
                let message = format!("{step} provisioning failed: {failure}");
                let update = ProjectUpdate::new().last_error(message);
                self.store
                    .update_status(&project, ProjectStatus::RollingBack, update)
                    .await
            }
        }
    }

    /// Release a resource this driver created after losing its claim.
    ///
    /// Nothing records the ref, so it is released here unless the current
    /// owner has already recorded the same ref (idempotent creates).
    async fn release_orphan(&self, project_id: &str, step: Step, resource: &ResourceRef) {
        match self.store.get(project_id).await {
            Ok(current) if current.resource_ref(step) == Some(resource) => {
                debug!(step = %step, resource_ref = %resource, "Owner recorded the resource");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    step = %step,
                    resource_ref = %resource,
                    error = %e,
                    "Cannot tell whether the resource is owned; leaving it in place"
                );
                return;
            }
        }

        warn!(step = %step, resource_ref = %resource, "Claim lost after create, releasing");
        let client = self.clients.for_step(step);
        let policy = &self.config.retry;
        let mut attempt = 0;
        let released = loop {
            attempt += 1;
            match client.delete(resource).await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_not_found() => break Ok(()),
                Err(e) if policy.should_retry(attempt, &e) => {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(e) => break Err(e),
            }
        };

        let message = match released {
            Ok(()) => {
                info!(step = %step, resource_ref = %resource, "Orphaned resource released");
                format!("{step} resource {resource} created after losing the claim was released")
            }
            Err(e) => {
                error!(
                    step = %step,
                    resource_ref = %resource,
                    error = %e,
                    "Orphaned resource could not be released"
                );
                format!("{step} resource {resource} created after losing the claim is live: {e}")
            }
        };
        let event =
            ProjectEvent::new(project_id, EventKind::ResourceOrphaned, message).with_step(step);
        if let Err(e) = self.store.record_event(&event).await {
            error!(error = %e, "Failed to record orphaned resource");
        }
    }

    /// Release every recorded resource in reverse creation order, then settle.
    ///
    /// Each release clears its ref in its own write. Refs whose release fails
    /// permanently stay set so the leftover resource stays visible.
    async fn release_all(&self, mut project: Project) -> Result<Project> {
        let mut errors = Vec::new();

        for step in Step::RELEASE_ORDER {
            let Some(resource) = project.resource_ref(step).cloned() else {
                continue;
            };

            match self.release(&mut project, step, &resource).await? {
                Ok(()) => {
                    let update = ProjectUpdate::new().clear_ref(step);
                    project = self
                        .store
                        .update_status(&project, project.status, update)
                        .await?;
                    info!(step = %step, resource_ref = %resource, "Resource released");
                }
                Err(failure) => {
                    warn!(
                        step = %step,
                        resource_ref = %resource,
                        error = %failure,
                        "Release failed"
                    );
                    errors.push(format!("{step} release failed: {failure}"));
                }
            }
        }

        match project.status {
            ProjectStatus::RollingBack => {
                let mut message = project
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "provisioning failed".to_string());
                if !errors.is_empty() {
                    message.push_str("; rollback: ");
                    message.push_str(&errors.join("; "));
                }
                let update = ProjectUpdate::new().last_error(message);
                self.store
                    .update_status(&project, ProjectStatus::Failed, update)
                    .await
            }
            ProjectStatus::Deleting if errors.is_empty() => {
                let update = ProjectUpdate::new().clear_last_error();
                self.store
                    .update_status(&project, ProjectStatus::Deleted, update)
                    .await
            }
            ProjectStatus::Deleting => {
                let message = format!("deletion failed: {}", errors.join("; "));
                let update = ProjectUpdate::new().last_error(message);
                self.store
                    .update_status(&project, ProjectStatus::Failed, update)
                    .await
            }
            status => Err(OrchestratorError::InvalidState(format!(
                "project {} has nothing to release in status {status}",
                project.id
            ))),
        }
    }

    async fn release(
        &self,
        lease: &mut Project,
        step: Step,
        resource: &ResourceRef,
    ) -> Result<StepResult<()>> {
        let client = Arc::clone(self.clients.for_step(step));
        let target = resource.clone();
        let released = self
            .call_with_retry(lease, step, Direction::Delete, move || {
                let client = Arc::clone(&client);
                let target = target.clone();
                async move {
                    match client.delete(&target).await {
                        Err(e) if e.is_not_found() => {
                            debug!(resource_ref = %target, "Already gone downstream");
                            Ok(())
                        }
                        other => other,
                    }
                }
            })
            .await?;

        if released.is_ok() && step == Step::Vm {
            self.await_gone(lease, step, resource).await?;
        }

        Ok(released)
    }

    /// Poll until the resource reports gone or the release deadline passes,
    /// renewing the claim on every tick.
    async fn await_gone(
        &self,
        lease: &mut Project,
        step: Step,
        resource: &ResourceRef,
    ) -> Result<()> {
        let client = self.clients.for_step(step);
        let deadline = Instant::now() + self.config.release_timeout;

        loop {
            match client.get_status(resource).await {
                Ok(ResourceStatus::Gone) => return Ok(()),
                Ok(status) => debug!(resource_ref = %resource, ?status, "Waiting for release"),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => debug!(resource_ref = %resource, error = %e, "Status poll failed"),
            }

            if Instant::now() + self.config.release_poll_interval > deadline {
                warn!(
                    service = client.service(),
                    resource_ref = %resource,
                    "Timed out waiting for release confirmation, continuing"
                );
                return Ok(());
            }

            self.renew(lease).await?;
            let (_, held) = self
                .hold(lease, tokio::time::sleep(self.config.release_poll_interval))
                .await;
            if !held {
                return Err(lost_claim(lease));
            }
        }
    }

    /// Bump the claim's version so nobody treats the project as abandoned.
    async fn renew(&self, lease: &mut Project) -> Result<()> {
        let renewed = self
            .store
            .update_status(&*lease, lease.status, ProjectUpdate::new())
            .await?;
        *lease = renewed;
        Ok(())
    }

    /// Await `fut` while renewing the claim on `lease` every heartbeat.
    ///
    /// `fut` always runs to completion. The flag is `false` once a renewal
    /// found the claim taken over; renewal stops from then on.
    async fn hold<F: Future>(&self, lease: &mut Project, fut: F) -> (F::Output, bool) {
        let heartbeat = self.config.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(fut);
        let mut held = true;

        loop {
            tokio::select! {
                output = &mut fut => return (output, held),
                _ = ticker.tick(), if held => match self.renew(lease).await {
                    Ok(()) => debug!(version = lease.version, "Claim renewed"),
                    Err(e) if e.is_conflict() => {
                        warn!(error = %e, "Claim taken over while waiting");
                        held = false;
                    }
                    Err(e) => warn!(error = %e, "Failed to renew claim"),
                },
            }
        }
    }

    /// Call `op` until it succeeds, fails permanently or runs out of attempts,
    /// recording every attempt.
    ///
    /// Each attempt runs on its own task so a dropped run never abandons a
    /// downstream call halfway. The claim on `lease` is renewed while calls
    /// are in flight and before every retry. A successful call is returned
    /// even if the claim was lost meanwhile, so the caller can account for
    /// what it created.
    async fn call_with_retry<F, Fut, T>(
        &self,
        lease: &mut Project,
        step: Step,
        direction: Direction,
        op: F,
    ) -> Result<StepResult<T>>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = sandbox_clients::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.clients.for_step(step).service();
        let policy = &self.config.retry;
        let project_id = lease.id.clone();
        let mut record = self
            .store
            .get_step(&project_id, step, direction)
            .await?
            .unwrap_or_else(|| StepRecord::new(&project_id, step, direction));

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                self.renew(lease).await?;
            }
            record.begin_attempt();
            self.store.record_step(&record).await?;

            let (joined, held) = self.hold(lease, tokio::spawn(op())).await;
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(ClientError::transient(service, format!("call aborted: {e}"))),
            };

            let error = match result {
                Ok(value) => {
                    record.succeed();
                    self.store.record_step(&record).await?;
                    let event = ProjectEvent::new(
                        &project_id,
                        EventKind::StepSucceeded,
                        format!("{step} {direction} succeeded after {attempt} attempt(s)"),
                    )
                    .with_step(step);
                    self.store.record_event(&event).await?;
                    return Ok(Ok(value));
                }
                Err(error) => error,
            };

            if !held {
                record.fail(error.to_string());
                self.store.record_step(&record).await?;
                return Err(lost_claim(lease));
            }

            if policy.should_retry(attempt, &error) {
                let delay = policy.delay(attempt);
                debug!(
                    step = %step,
                    direction = %direction,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                record.last_error = Some(error.to_string());
                self.store.record_step(&record).await?;
                if !self.hold(lease, tokio::time::sleep(delay)).await.1 {
                    return Err(lost_claim(lease));
                }
                continue;
            }

            record.fail(error.to_string());
            self.store.record_step(&record).await?;

            let failure = if error.is_retryable() {
                StepFailure::ExhaustedRetries {
                    attempts: attempt,
                    last: error,
                }
            } else {
                StepFailure::Permanent(error)
            };
            let event = ProjectEvent::new(
                &project_id,
                EventKind::StepFailed,
                format!("{step} {direction} failed: {failure}"),
            )
            .with_step(step);
            self.store.record_event(&event).await?;
            return Ok(Err(failure));
        }
    }
}

fn lost_claim(lease: &Project) -> OrchestratorError {
    OrchestratorError::Conflict(format!(
        "claim on project {} was taken over from {} v{}",
        lease.id, lease.status, lease.version
    ))
}
