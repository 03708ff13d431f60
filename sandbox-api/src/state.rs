use sandbox_orchestrator::ProjectOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ProjectOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: ProjectOrchestrator) -> Self {
        Self { orchestrator }
    }
}
