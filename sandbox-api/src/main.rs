use anyhow::Result;
use sandbox_api::{create_app, start_reconciler_task, AppState, Config};
use sandbox_orchestrator::db::{backup_database, create_pool, run_migrations};
use sandbox_orchestrator::{ProjectOrchestrator, ProjectStore};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Held for the life of the process so buffered file logs get flushed
    let _log_guard = sandbox_logging::init_subscriber();

    info!("Starting sandbox-api service...");

    // Load configuration
    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}",
        config.bind_addr,
        config.db_path.display()
    );

    // Database setup
    let db_path = &config.db_path;

    // Backup before migrations
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let clients = config.service_clients()?;
    info!(
        auth = %config.auth_url,
        vm = %config.vm_url,
        storage = %config.storage_url,
        "Downstream services configured"
    );

    let orchestrator_config = config.orchestrator_config();
    orchestrator_config.validate()?;

    let orchestrator =
        ProjectOrchestrator::new(ProjectStore::new(pool), clients, orchestrator_config);

    // Start reconciler task
    tokio::spawn(start_reconciler_task(
        orchestrator.clone(),
        config.reconciler_interval_secs,
    ));
    info!(
        "Reconciler task started (interval: {}s)",
        config.reconciler_interval_secs
    );

    // Create app
    let app = create_app(AppState::new(orchestrator));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
