use std::sync::Arc;

use roadwatch_pipeline::{
    DisabledGuard, NullArtifactStore, PreprocessOnlyProcessor, ResourceGuard, SystemMemoryGuard,
};
use roadwatch_worker::{RedisStreamLog, StreamWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; the environment itself wins.
    let _ = dotenvy::dotenv();
    roadwatch_observability::init();

    let config = WorkerConfig::from_env();
    let counters = Arc::new(roadwatch_observability::CounterRegistry::new());

    // Failing to reach the log is the only error that aborts startup;
    // everything after this point is retried or self-healed in the loops.
    let log = Arc::new(RedisStreamLog::connect(&config.connection_url()).await?);
    tracing::info!(url = %config.redis_url, "connected to stream log");

    let guard: Arc<dyn ResourceGuard> = if config.memory_guard {
        Arc::new(SystemMemoryGuard::default())
    } else {
        Arc::new(DisabledGuard)
    };

    let worker = StreamWorker::new(
        log,
        Arc::new(PreprocessOnlyProcessor),
        Arc::new(NullArtifactStore),
        guard,
        counters,
        config,
    );

    worker.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    worker.stop().await;

    Ok(())
}
