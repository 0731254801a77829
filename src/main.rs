use std::sync::Arc;

use arq_orchestrator::api::{AppState, api_routes};
use arq_orchestrator::config::AppConfig;
use arq_orchestrator::consumer::{NoopHandler, TaskConsumerPool, TaskHandlerRegistry};
use arq_orchestrator::events::EventBroadcaster;
use arq_orchestrator::queue::TaskQueue;
use arq_orchestrator::resilience::{CircuitBreakerRegistry, RateLimiter, spawn_prune_task};
use arq_orchestrator::store::{Database, LibSqlBackend};
use arq_orchestrator::workflow::{
    ConditionStep, SetStep, StepExecutor, WorkflowEngine, WorkflowStepHandler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;
    let port = config.server.port;

    eprintln!("⚙️  Arq orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}", port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws", port);
    eprintln!("   Workers: {}", config.pool.worker_count);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = config.server.db_path.clone();
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&db_path).await.map_err(
        |e| anyhow::anyhow!("Failed to open database at {}: {e}", db_path.display()),
    )?);
    eprintln!("   Database: {}", db_path.display());

    // ── Queue & Resilience ───────────────────────────────────────────────
    let broadcaster = Arc::new(EventBroadcaster::new());
    let queue = TaskQueue::new(
        Arc::clone(&db),
        Arc::clone(&broadcaster),
        config.queue.clone(),
        config.retry.clone(),
    );
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let _prune_handle = spawn_prune_task(Arc::clone(&rate_limiter));

    // ── Workflow Engine ──────────────────────────────────────────────────
    let executor = Arc::new(StepExecutor::new(config.workflow.default_step_timeout));
    executor.register(Arc::new(SetStep));
    executor.register(Arc::new(ConditionStep::default()));
    eprintln!("   Step types: {}", executor.types().join(", "));

    let engine = WorkflowEngine::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        executor,
        Arc::clone(&broadcaster),
        config.workflow.clone(),
    );

    // ── Consumers ────────────────────────────────────────────────────────
    let handlers = Arc::new(TaskHandlerRegistry::new());
    handlers.register(Arc::new(NoopHandler)).await;
    handlers
        .register(Arc::new(WorkflowStepHandler::new(Arc::clone(&engine))))
        .await;
    eprintln!("   Task types: {}\n", handlers.list().await.join(", "));

    let pool = Arc::new(
        TaskConsumerPool::new(
            Arc::clone(&queue),
            handlers,
            Arc::clone(&breakers),
            config.pool.clone(),
        )
        .with_hook(engine.clone()),
    );
    pool.start();

    // ── HTTP Server ──────────────────────────────────────────────────────
    let app = api_routes(AppState {
        queue,
        engine,
        broadcaster,
        breakers,
        rate_limiter,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "HTTP server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    pool.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
