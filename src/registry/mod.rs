//! The query registry: owner of every live query handle.
//!
//! Creation runs parse → register → admit; every other component
//! re-resolves handles through the registry by id rather than holding
//! strong references of its own. The registry also hosts the four
//! maintenance passes the sweeper drives each second: abandonment,
//! memory enforcement, expiration, and history pruning.

pub mod sweeper;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::admission::QueueManager;
use crate::config::CoordinatorConfig;
use crate::error::{ErrorCode, ExecutionFailure};
use crate::memory::ClusterMemoryManager;
use crate::parser::StatementParser;
use crate::query::{BasicQueryInfo, QueryHandle, QueryId, QueryIdGenerator, QueryState};
use crate::session::Session;

pub use sweeper::LifecycleSweeper;

pub struct QueryRegistry {
    queries: DashMap<QueryId, Arc<QueryHandle>>,
    expiration_queue: Mutex<VecDeque<QueryId>>,
    id_generator: QueryIdGenerator,
    parser: StatementParser,
    queue_manager: Arc<QueueManager>,
    memory_manager: Arc<ClusterMemoryManager>,
    client_timeout: chrono::Duration,
    max_age: chrono::Duration,
    max_history: usize,
}

impl QueryRegistry {
    pub fn new(
        config: &CoordinatorConfig,
        queue_manager: Arc<QueueManager>,
        memory_manager: Arc<ClusterMemoryManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queries: DashMap::new(),
            expiration_queue: Mutex::new(VecDeque::new()),
            id_generator: QueryIdGenerator::new(),
            parser: StatementParser::new(),
            queue_manager,
            memory_manager,
            client_timeout: chrono::Duration::from_std(config.query_client_timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            max_age: chrono::Duration::from_std(config.query_max_age())
                .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            max_history: config.query_max_history,
        })
    }

    /// Create a query from a submitted statement. The returned handle is
    /// always registered; a parse failure or admission refusal comes
    /// back as an already-FAILED handle, not an error.
    pub fn create(self: &Arc<Self>, session: Session, sql: impl Into<String>) -> Arc<QueryHandle> {
        let sql = sql.into();
        let query_id = self.id_generator.next_id();
        let handle = QueryHandle::new(query_id.clone(), sql.clone(), session);

        info!(query_id = %query_id, user = %handle.session().user, "query created");
        self.queries.insert(query_id.clone(), handle.clone());

        // Every query that completes enters the expiration FIFO exactly
        // once; the sweeper removes it after the grace window.
        let registry = Arc::downgrade(self);
        let expired_id = query_id.clone();
        let completed = handle.clone();
        handle.state_machine().add_completion_listener(move |state| {
            info!(
                query_id = %expired_id,
                state = state.as_str(),
                elapsed_ms = completed.info().elapsed_millis,
                "query completed"
            );
            if let Some(registry) = registry.upgrade() {
                registry.expiration_queue.lock().push_back(expired_id);
            }
        });

        if let Err(failure) = self.parser.parse(&sql) {
            debug!(query_id = %query_id, error = %failure.message, "statement failed to parse");
            handle.fail(failure);
            return handle;
        }

        if !self.queue_manager.submit(&handle) {
            handle.fail(ExecutionFailure::new(
                ErrorCode::QUERY_QUEUE_FULL,
                "Too many queued queries",
            ));
        }
        handle
    }

    pub fn lookup(&self, query_id: &QueryId) -> Option<Arc<QueryHandle>> {
        self.queries.get(query_id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<QueryHandle>> {
        self.queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn infos(&self) -> Vec<BasicQueryInfo> {
        let mut infos: Vec<BasicQueryInfo> = self.queries.iter().map(|e| e.value().info()).collect();
        infos.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        infos
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn record_heartbeat(&self, query_id: &QueryId) {
        if let Some(handle) = self.lookup(query_id) {
            handle.record_heartbeat();
        }
    }

    pub fn cancel(&self, query_id: &QueryId) -> bool {
        match self.lookup(query_id) {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    /// Stage-level cancellation is a worker-side operation; the local
    /// execution engine has nothing to cancel below the query.
    pub fn cancel_stage(&self, query_id: &QueryId, stage_id: u32) -> bool {
        let found = self.queries.contains_key(query_id);
        if found {
            debug!(query_id = %query_id, stage_id, "stage cancellation ignored by local execution");
        }
        found
    }

    pub async fn wait_for_state_change(
        &self,
        query_id: &QueryId,
        current: QueryState,
        max_wait: Duration,
    ) -> Option<QueryState> {
        let handle = self.lookup(query_id)?;
        Some(
            handle
                .state_machine()
                .wait_for_state_change(current, max_wait)
                .await,
        )
    }

    pub fn queue_manager(&self) -> &QueueManager {
        &self.queue_manager
    }

    pub fn memory_manager(&self) -> &ClusterMemoryManager {
        &self.memory_manager
    }

    // ---- maintenance passes (driven by the sweeper) ----

    /// One sweeper tick. A problem in one pass must not suppress the
    /// later passes, so each pass contains its own error handling.
    pub fn run_maintenance(&self) {
        self.fail_abandoned_queries();
        self.enforce_memory_limits();
        self.remove_expired_queries();
        self.prune_query_history();
    }

    /// Pass 1: fail queries whose client has stopped polling.
    fn fail_abandoned_queries(&self) {
        let horizon = Utc::now() - self.client_timeout;
        for entry in self.queries.iter() {
            let handle = entry.value();
            if handle.is_done() {
                continue;
            }
            let last_heartbeat = handle.last_heartbeat();
            if last_heartbeat < horizon {
                warn!(query_id = %handle.query_id(), "query abandoned by client");
                handle.fail(ExecutionFailure::new(
                    ErrorCode::ABANDONED_QUERY,
                    format!(
                        "Query abandoned: last client heartbeat at {}, abandonment horizon {}",
                        last_heartbeat.to_rfc3339(),
                        horizon.to_rfc3339()
                    ),
                ));
            }
        }
    }

    /// Pass 2: hand the running set to the cluster memory manager.
    fn enforce_memory_limits(&self) {
        let running: Vec<Arc<QueryHandle>> = self
            .queries
            .iter()
            .filter(|entry| entry.value().state() == QueryState::Running)
            .map(|entry| entry.value().clone())
            .collect();
        self.memory_manager.process(&running);
    }

    /// Pass 3: drop completed queries older than the grace window, but
    /// only while more than `max_history` entries remain.
    fn remove_expired_queries(&self) {
        let horizon = Utc::now() - self.max_age;
        let mut expiration_queue = self.expiration_queue.lock();
        while expiration_queue.len() > self.max_history {
            let query_id = match expiration_queue.front() {
                Some(id) => id.clone(),
                None => break,
            };
            let expired = match self.lookup(&query_id) {
                // Gone already; just drop the entry.
                None => true,
                Some(handle) => handle
                    .times()
                    .ended
                    .map(|ended| ended < horizon)
                    .unwrap_or(false),
            };
            if !expired {
                break;
            }
            expiration_queue.pop_front();
            if self.queries.remove(&query_id).is_some() {
                debug!(query_id = %query_id, "expired query removed");
            }
        }
    }

    /// Pass 4: trim detail on history beyond the cap that is too young
    /// to remove.
    fn prune_query_history(&self) {
        let expiration_queue = self.expiration_queue.lock();
        let excess = expiration_queue.len().saturating_sub(self.max_history);
        for query_id in expiration_queue.iter().take(excess) {
            if let Some(handle) = self.lookup(query_id) {
                handle.prune_info();
            }
        }
    }

    /// Shutdown: every query still in flight fails with
    /// SERVER_SHUTTING_DOWN.
    pub fn stop(&self) {
        for entry in self.queries.iter() {
            let handle = entry.value();
            if !handle.is_done() {
                handle.fail(ExecutionFailure::new(
                    ErrorCode::SERVER_SHUTTING_DOWN,
                    "Server is shutting down",
                ));
            }
        }
        info!("query registry stopped");
    }

    #[cfg(test)]
    pub(crate) fn expiration_queue_len(&self) -> usize {
        self.expiration_queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::queue::QueryStarter;
    use crate::memory::WorkerPoolView;

    struct NoopStarter;

    impl QueryStarter for NoopStarter {
        fn start(&self, handle: Arc<QueryHandle>) {
            handle.state_machine().transition_to_running();
        }
    }

    fn registry_with(config: CoordinatorConfig) -> Arc<QueryRegistry> {
        let starter = Arc::new(NoopStarter);
        let queue_manager = Arc::new(QueueManager::load(None, starter).unwrap());
        let memory_manager = Arc::new(ClusterMemoryManager::new(
            config.memory_general_pool_bytes,
            config.memory_reserved_pool_bytes,
            config.query_max_memory_bytes,
            Arc::new(WorkerPoolView::new()),
        ));
        QueryRegistry::new(&config, queue_manager, memory_manager)
    }

    fn registry() -> Arc<QueryRegistry> {
        registry_with(CoordinatorConfig::default())
    }

    fn session() -> Session {
        Session::builder("alice").build()
    }

    #[tokio::test]
    async fn test_create_registers_and_admits() {
        let registry = registry();
        let handle = registry.create(session(), "SELECT 1");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(handle.state(), QueryState::Running);
        assert!(registry.lookup(handle.query_id()).is_some());
    }

    #[tokio::test]
    async fn test_parse_failure_synthesizes_failed_query() {
        let registry = registry();
        let handle = registry.create(session(), "NOT SQL");

        assert_eq!(handle.state(), QueryState::Failed);
        assert_eq!(handle.failure().unwrap().code, ErrorCode::SYNTAX_ERROR);
        // Registered and queued for expiration despite never starting.
        assert!(registry.lookup(handle.query_id()).is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.expiration_queue_len(), 1);
    }

    #[tokio::test]
    async fn test_empty_sql_synthesizes_failed_query() {
        let registry = registry();
        let handle = registry.create(session(), "");
        assert_eq!(handle.state(), QueryState::Failed);
        assert_eq!(
            handle.failure().unwrap().code.kind,
            crate::error::ErrorKind::UserError
        );
    }

    #[tokio::test]
    async fn test_cancel_is_terminal_and_idempotent() {
        let registry = registry();
        let handle = registry.create(session(), "SELECT 1");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(registry.cancel(handle.query_id()));
        assert!(handle.failure().unwrap().is_user_canceled());
        assert!(!registry.cancel(handle.query_id()));
        assert!(!registry.cancel(&"20260801_000000_00000_nope0".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_abandonment_pass() {
        let mut config = CoordinatorConfig::default();
        config.query_client_timeout_secs = 0;
        let registry = registry_with(config);

        let handle = registry.create(session(), "SELECT 1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.run_maintenance();

        assert_eq!(handle.state(), QueryState::Failed);
        assert_eq!(handle.failure().unwrap().code, ErrorCode::ABANDONED_QUERY);
    }

    #[tokio::test]
    async fn test_heartbeat_defers_abandonment() {
        let mut config = CoordinatorConfig::default();
        config.query_client_timeout_secs = 60;
        let registry = registry_with(config);

        let handle = registry.create(session(), "SELECT 1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.record_heartbeat(handle.query_id());
        registry.run_maintenance();
        assert_eq!(handle.state(), QueryState::Running);
    }

    #[tokio::test]
    async fn test_expiration_respects_history_floor() {
        let mut config = CoordinatorConfig::default();
        config.query_max_age_secs = 0;
        config.query_max_history = 1;
        let registry = registry_with(config);

        let first = registry.create(session(), "SELECT 1");
        let second = registry.create(session(), "SELECT 2");
        tokio::time::sleep(Duration::from_millis(30)).await;
        first.state_machine().transition_to_finished();
        second.state_machine().transition_to_finished();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.expiration_queue_len(), 2);

        registry.run_maintenance();

        // Only the entries above max_history were removable.
        assert_eq!(registry.query_count(), 1);
        assert!(registry.lookup(first.query_id()).is_none());
        assert!(registry.lookup(second.query_id()).is_some());
    }

    #[tokio::test]
    async fn test_history_pruning_trims_excess() {
        let mut config = CoordinatorConfig::default();
        // Old enough never to expire, so pruning has to act instead.
        config.query_max_age_secs = 3600;
        config.query_max_history = 0;
        let registry = registry_with(config);

        let handle = registry.create(session(), "SELECT 1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.state_machine().transition_to_finished();
        tokio::time::sleep(Duration::from_millis(30)).await;

        registry.run_maintenance();
        assert!(handle.is_pruned());
        // Too young to remove.
        assert!(registry.lookup(handle.query_id()).is_some());
    }

    #[tokio::test]
    async fn test_stop_fails_everything_in_flight() {
        let registry = registry();
        let running = registry.create(session(), "SELECT 1");
        let failed = registry.create(session(), "NOT SQL");
        tokio::time::sleep(Duration::from_millis(30)).await;

        registry.stop();

        assert_eq!(
            running.failure().unwrap().code,
            ErrorCode::SERVER_SHUTTING_DOWN
        );
        // Already-done queries keep their original failure.
        assert_eq!(failed.failure().unwrap().code, ErrorCode::SYNTAX_ERROR);
    }
}
