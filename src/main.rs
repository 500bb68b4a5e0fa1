// # QuarryDB Coordinator
//
// Entry point for the coordinator server: wires the admission queues,
// query registry, lifecycle sweeper, cluster memory manager, and the
// statement HTTP surface, then serves until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use quarry_db::admission::QueueManager;
use quarry_db::execution::LocalExecutionFactory;
use quarry_db::memory::{ClusterMemoryManager, WorkerPoolView};
use quarry_db::protocol::{router, CoordinatorService, StreamingQueryManager};
use quarry_db::registry::{LifecycleSweeper, QueryRegistry};
use quarry_db::{CoordError, CoordinatorConfig, Result, VERSION};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config = load_config()?;

    // The management pool size bounds the scheduled side of the
    // runtime; worker threads never drop below the host parallelism.
    let worker_threads = num_cpus::get().max(config.query_manager_executor_pool_size);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

fn load_config() -> Result<CoordinatorConfig> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| {
            let default = PathBuf::from("quarrydb.json");
            default.exists().then_some(default)
        });
    match path {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            CoordinatorConfig::load(&path)
        }
        None => Ok(CoordinatorConfig::default()),
    }
}

async fn serve(config: CoordinatorConfig) -> Result<()> {
    info!("QuarryDB coordinator {} starting", VERSION);

    let execution = LocalExecutionFactory::new();
    let queue_manager = Arc::new(QueueManager::load(
        config.query_queue_config_file.as_deref(),
        execution,
    )?);
    let workers = Arc::new(WorkerPoolView::new());
    let memory_manager = Arc::new(ClusterMemoryManager::new(
        config.memory_general_pool_bytes,
        config.memory_reserved_pool_bytes,
        config.query_max_memory_bytes,
        workers,
    ));
    let registry = QueryRegistry::new(&config, queue_manager, memory_manager);
    let sweeper = LifecycleSweeper::start(registry.clone());
    let streaming = StreamingQueryManager::new(registry.clone());
    let purger = streaming.spawn_purger();
    let service = CoordinatorService::new(streaming);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordError::Unavailable(format!("failed to bind {}: {}", addr, e)))?;
    info!("statement endpoint listening on {}", addr);

    let serve_result = axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutdown signal received");
        })
        .await;

    // Orderly teardown: fail in-flight queries, then stop the
    // maintenance tasks.
    registry.stop();
    sweeper.stop().await;
    purger.abort();

    serve_result.map_err(|e| CoordError::Unavailable(format!("server error: {}", e)))?;
    info!("coordinator stopped");
    Ok(())
}
