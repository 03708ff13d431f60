use crate::error::Result;
use crate::lifecycle::{ProjectOrchestrator, RunOutcome};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing::{error, info, instrument};

const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Totals from one pass over abandoned projects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub superseded: usize,
    pub errored: usize,
}

/// Resumes projects whose driver went away mid-workflow.
#[derive(Clone)]
pub struct Reconciler {
    orchestrator: ProjectOrchestrator,
    max_concurrent: usize,
}

impl Reconciler {
    pub fn new(orchestrator: ProjectOrchestrator) -> Self {
        Self {
            orchestrator,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Run every project idle past `stuck_after`. One project failing does
    /// not stop the others.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let stuck = self
            .orchestrator
            .store()
            .list_stuck(self.orchestrator.config().stuck_after)
            .await?;

        let mut report = SweepReport {
            examined: stuck.len(),
            ..SweepReport::default()
        };
        if stuck.is_empty() {
            return Ok(report);
        }

        info!("Resuming {} stuck projects", stuck.len());

        let mut runs = stream::iter(stuck)
            .map(|project| {
                let orchestrator = self.orchestrator.clone();
                async move {
                    let outcome = orchestrator.run(&project.id).await;
                    (project, outcome)
                }
            })
            .buffer_unordered(self.max_concurrent);

        while let Some((project, outcome)) = runs.next().await {
            match outcome {
                Ok(RunOutcome::Completed(settled)) => {
                    info!(
                        project_id = %settled.id,
                        from = %project.status,
                        to = %settled.status,
                        "Reconciled project"
                    );
                    report.completed += 1;
                }
                Ok(RunOutcome::Superseded) => report.superseded += 1,
                Err(e) => {
                    error!(project_id = %project.id, "Failed to reconcile project: {}", e);
                    report.errored += 1;
                }
            }
        }

        Ok(report)
    }
}
