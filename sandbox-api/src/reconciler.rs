use sandbox_orchestrator::{ProjectOrchestrator, Reconciler};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

pub async fn start_reconciler_task(orchestrator: ProjectOrchestrator, interval_secs: u64) {
    let reconciler = Reconciler::new(orchestrator);
    let mut interval = interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Reconciler task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match reconciler.sweep_once().await {
            Ok(report) if report.examined == 0 => debug!("No stuck projects"),
            Ok(report) => info!(
                examined = report.examined,
                completed = report.completed,
                superseded = report.superseded,
                errored = report.errored,
                "Reconciler sweep finished"
            ),
            Err(e) => error!("Reconciler sweep failed: {}", e),
        }
    }
}
