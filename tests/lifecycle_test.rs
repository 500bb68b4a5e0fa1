// Lifecycle integration tests
// Exercises the registry + sweeper passes and the cluster memory
// manager against real (locally executing) queries: abandonment,
// expiration, shutdown, and memory kills.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use quarry_db::admission::QueueManager;
use quarry_db::config::CoordinatorConfig;
use quarry_db::error::ErrorCode;
use quarry_db::execution::{LocalExecutionFactory, EXECUTION_DELAY_PROPERTY};
use quarry_db::memory::{ClusterMemoryManager, MemoryPoolId, WorkerPoolView};
use quarry_db::query::{QueryHandle, QueryState};
use quarry_db::registry::QueryRegistry;
use quarry_db::session::Session;

fn registry_with(config: &CoordinatorConfig) -> (Arc<QueryRegistry>, Arc<WorkerPoolView>) {
    let execution = LocalExecutionFactory::new();
    let queue_manager = Arc::new(
        QueueManager::load(config.query_queue_config_file.as_deref(), execution).unwrap(),
    );
    let workers = Arc::new(WorkerPoolView::new());
    let memory_manager = Arc::new(ClusterMemoryManager::new(
        config.memory_general_pool_bytes,
        config.memory_reserved_pool_bytes,
        config.query_max_memory_bytes,
        workers.clone(),
    ));
    (
        QueryRegistry::new(config, queue_manager, memory_manager),
        workers,
    )
}

fn slow_session() -> Session {
    Session::builder("alice")
        .property(EXECUTION_DELAY_PROPERTY, "60000")
        .build()
}

async fn wait_for_state(handle: &Arc<QueryHandle>, state: QueryState) {
    for _ in 0..200 {
        if handle.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "query {} never reached {:?} (currently {:?})",
        handle.query_id(),
        state,
        handle.state()
    );
}

#[tokio::test]
async fn test_abandonment_releases_queue_slots() {
    let mut queue_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        queue_file,
        r#"{{
            "queues": {{"serial": {{"maxConcurrent": 1, "maxQueued": 5}}}},
            "rules": [{{"queues": ["serial"]}}]
        }}"#
    )
    .unwrap();
    let mut config = CoordinatorConfig::default();
    config.query_client_timeout_secs = 0;
    config.query_queue_config_file = Some(queue_file.path().to_path_buf());
    let (registry, _) = registry_with(&config);

    let running = registry.create(slow_session(), "SELECT 1");
    let queued = registry.create(slow_session(), "SELECT 2");
    wait_for_state(&running, QueryState::Running).await;
    assert_eq!(queued.state(), QueryState::Queued);

    // Nobody ever polls: the next sweep abandons both and frees the
    // queue for new work.
    registry.run_maintenance();
    assert_eq!(
        running.failure().unwrap().code,
        ErrorCode::ABANDONED_QUERY
    );
    assert_eq!(queued.failure().unwrap().code, ErrorCode::ABANDONED_QUERY);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let fresh = registry.create(Session::builder("alice").build(), "SELECT 3");
    for _ in 0..200 {
        if fresh.is_done() {
            break;
        }
        fresh.record_heartbeat();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fresh.state(), QueryState::Finished);
}

#[tokio::test]
async fn test_abandoned_query_eventually_leaves_registry() {
    let mut config = CoordinatorConfig::default();
    config.query_client_timeout_secs = 0;
    config.query_max_age_secs = 0;
    config.query_max_history = 0;
    let (registry, _) = registry_with(&config);

    let handle = registry.create(slow_session(), "SELECT 1");
    wait_for_state(&handle, QueryState::Running).await;

    registry.run_maintenance();
    assert_eq!(handle.failure().unwrap().code, ErrorCode::ABANDONED_QUERY);

    // The completion listener enqueues expiration asynchronously; the
    // following sweep removes the query.
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.run_maintenance();
    assert!(registry.lookup(handle.query_id()).is_none());
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_queries() {
    let config = CoordinatorConfig::default();
    let (registry, _) = registry_with(&config);

    let running = registry.create(slow_session(), "SELECT 1");
    let finished = registry.create(Session::builder("alice").build(), "SELECT 2");
    wait_for_state(&running, QueryState::Running).await;
    wait_for_state(&finished, QueryState::Finished).await;

    registry.stop();

    assert_eq!(
        running.failure().unwrap().code,
        ErrorCode::SERVER_SHUTTING_DOWN
    );
    assert_eq!(finished.state(), QueryState::Finished);
}

#[tokio::test]
async fn test_memory_kill_prefers_largest_consumer() {
    let mut config = CoordinatorConfig::default();
    config.memory_general_pool_bytes = 1000;
    config.memory_reserved_pool_bytes = 800;
    config.query_max_memory_bytes = 10_000;
    let (registry, workers) = registry_with(&config);

    let small = registry.create(slow_session(), "SELECT 1");
    let large = registry.create(slow_session(), "SELECT 2");
    wait_for_state(&small, QueryState::Running).await;
    wait_for_state(&large, QueryState::Running).await;
    small.update_memory_reservation(400);
    large.update_memory_reservation(700);

    // First enforcement: the pool is oversubscribed, the largest query
    // escapes into the reserved pool.
    registry.run_maintenance();
    assert_eq!(large.memory_pool().pool, MemoryPoolId::reserved());
    assert_eq!(large.state(), QueryState::Running);
    assert_eq!(workers.acknowledged_version(), 1);

    // A third query oversubscribes again with the reserved pool taken:
    // it is the largest in the general pool and is killed; the small
    // one is untouched.
    let huge = registry.create(slow_session(), "SELECT 3");
    wait_for_state(&huge, QueryState::Running).await;
    huge.update_memory_reservation(900);

    small.record_heartbeat();
    large.record_heartbeat();
    huge.record_heartbeat();
    registry.run_maintenance();

    assert_eq!(
        huge.failure().unwrap().code,
        ErrorCode::EXCEEDED_MEMORY_LIMIT
    );
    assert_eq!(small.state(), QueryState::Running);
    assert_eq!(large.state(), QueryState::Running);
}

#[tokio::test]
async fn test_per_query_memory_cap() {
    let mut config = CoordinatorConfig::default();
    config.query_max_memory_bytes = 100;
    let (registry, _) = registry_with(&config);

    let handle = registry.create(slow_session(), "SELECT 1");
    wait_for_state(&handle, QueryState::Running).await;
    handle.update_memory_reservation(101);

    handle.record_heartbeat();
    registry.run_maintenance();
    assert_eq!(
        handle.failure().unwrap().code,
        ErrorCode::EXCEEDED_MEMORY_LIMIT
    );
}
