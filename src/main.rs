use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workflow_dispatch::config::Config;
use workflow_dispatch::dedupe::{IdempotencyStore, WindowedIdempotencyStore};
use workflow_dispatch::executor::ExecutorRegistry;
use workflow_dispatch::queue::TaskQueue;
use workflow_dispatch::server::{AppState, build_router};
use workflow_dispatch::worker::WorkerPool;
use workflow_dispatch::workflow::WorkflowGraph;

/// How often expired idempotency keys are dropped.
const DEDUPE_PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How long in-flight executions get to finish after shutdown is requested.
/// Jobs still running afterwards are requeued on the next start.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workflow_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let graph = WorkflowGraph::load(&config.workflows_path)
        .with_context(|| format!("loading {}", config.workflows_path.display()))?;

    let queue = TaskQueue::open(config.queue_config())
        .with_context(|| format!("opening queue at {}", config.queue_dir.display()))?;
    let queue = Arc::new(queue);

    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(WindowedIdempotencyStore::new(
        config.dedupe_ttl(),
        config.dedupe_capacity,
    ));

    let shutdown = CancellationToken::new();

    let executors = ExecutorRegistry::with_defaults(&config.executor_settings());
    tracing::debug!(?executors, "Executors registered");
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(executors),
        config.concurrency,
        shutdown.child_token(),
    )
    .spawn();

    let pruner = tokio::spawn(prune_idempotency_keys(
        idempotency.clone(),
        shutdown.child_token(),
    ));

    let app_state = AppState::new(
        config.secret.clone(),
        idempotency,
        Arc::new(graph),
        queue,
        config.log_ignored,
    );
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // The server may also stop on its own; make sure everything else does.
    shutdown.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, pool.shutdown()).await.is_err() {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "In-flight jobs did not finish; they will be requeued on restart"
        );
    }
    let _ = pruner.await;

    Ok(())
}

async fn prune_idempotency_keys(store: Arc<dyn IdempotencyStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(DEDUPE_PRUNE_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = store.prune();
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "Pruned idempotency keys");
                }
            }
        }
    }
}
