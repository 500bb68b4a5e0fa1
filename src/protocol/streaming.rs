//! Per-query streaming sessions: token minting, idempotent replay, and
//! the advance path that turns exchange pages into responses.
//!
//! The contract, per query:
//!
//! - tokens mint monotonically; `nextUri` carries the next one;
//! - a GET of the URI that produced the cached page replays it verbatim;
//! - a GET of an older token is 410 Gone;
//! - a GET of anything that is neither the cached page nor the expected
//!   next page is 404;
//! - the expected next page advances: wait for the query to start,
//!   materialize columns, wire finalized output buffers into the
//!   exchange, pull up to ~1 MiB of pages, and decide whether another
//!   `nextUri` is owed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::exchange::ExchangeClient;
use crate::protocol::{Column, QueryResults, StatementStats};
use crate::query::{QueryHandle, QueryId, QueryState};
use crate::registry::QueryRegistry;
use crate::session::Session;

/// Server-side ceiling on one long poll.
pub const MAX_WAIT: Duration = Duration::from_secs(1);
/// Page budget for one response.
pub const DESIRED_RESULT_BYTES: usize = 1024 * 1024;

const PURGE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    /// Token is older than anything replayable.
    Gone,
    /// Unknown query, or a token that was never minted.
    NotFound,
}

pub struct StreamingQueryManager {
    registry: Arc<QueryRegistry>,
    queries: DashMap<QueryId, Arc<StreamingQuery>>,
}

impl StreamingQueryManager {
    pub fn new(registry: Arc<QueryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queries: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    /// Create the query and return the initial response: empty data,
    /// a `nextUri` carrying token 0. Never blocks on execution.
    pub fn submit(&self, session: Session, sql: impl Into<String>) -> QueryResults {
        let handle = self.registry.create(session, sql);
        let query_id = handle.query_id().clone();
        let initial = QueryResults {
            id: query_id.to_string(),
            info_uri: handle.self_uri().to_string(),
            partial_cancel_uri: None,
            next_uri: Some(next_uri(&query_id, 0)),
            columns: None,
            data: None,
            stats: StatementStats::from_handle(&handle),
            error: None,
            update_type: handle.update_type(),
            update_count: None,
        };
        self.queries.insert(
            query_id.clone(),
            Arc::new(StreamingQuery::new(
                query_id,
                self.registry.clone(),
                initial.clone(),
            )),
        );
        initial
    }

    /// Resolve the page for `token`; `max_wait` is clamped to the
    /// server ceiling.
    pub async fn poll(
        &self,
        query_id: &QueryId,
        token: u64,
        max_wait: Option<Duration>,
    ) -> Result<QueryResults, PollError> {
        let streaming = self
            .queries
            .get(query_id)
            .map(|entry| entry.value().clone())
            .ok_or(PollError::NotFound)?;
        let max_wait = max_wait.unwrap_or(MAX_WAIT).min(MAX_WAIT);
        streaming.get_results(token, max_wait).await
    }

    /// Best-effort cancel: fails the query, which also closes its
    /// result buffer.
    pub fn cancel(&self, query_id: &QueryId) {
        self.registry.cancel(query_id);
    }

    /// Drop streaming state for queries the registry no longer tracks;
    /// release the exchange of queries the registry reports FAILED.
    pub fn purge(&self) {
        let mut stale = Vec::new();
        for entry in self.queries.iter() {
            match self.registry.lookup(entry.key()) {
                None => stale.push(entry.key().clone()),
                Some(handle) => {
                    if handle.state() == QueryState::Failed {
                        if let Some(exchange) = handle.exchange() {
                            exchange.close();
                        }
                    }
                }
            }
        }
        for query_id in stale {
            debug!(query_id = %query_id, "purging streaming state");
            self.queries.remove(&query_id);
        }
    }

    pub fn spawn_purger(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.purge();
            }
        })
    }

    pub fn tracked_queries(&self) -> usize {
        self.queries.len()
    }
}

fn next_uri(query_id: &QueryId, token: u64) -> String {
    format!("/v1/statement/{}/{}", query_id, token)
}

struct StreamingInner {
    last_result: QueryResults,
    /// Path whose GET produced `last_result`; empty until the first GET
    /// (the initial response comes from the POST).
    last_result_path: String,
    /// Most recently minted token.
    result_id: u64,
    columns: Option<Vec<Column>>,
    no_more_locations_sent: bool,
    update_count_synthesized: bool,
}

/// Streaming state for one query. `poll`, `cancel`, and the purger may
/// race, so everything mutable sits behind one async mutex.
pub struct StreamingQuery {
    query_id: QueryId,
    registry: Arc<QueryRegistry>,
    inner: Mutex<StreamingInner>,
}

impl StreamingQuery {
    fn new(query_id: QueryId, registry: Arc<QueryRegistry>, initial: QueryResults) -> Self {
        Self {
            query_id,
            registry,
            inner: Mutex::new(StreamingInner {
                last_result: initial,
                last_result_path: String::new(),
                result_id: 0,
                columns: None,
                no_more_locations_sent: false,
                update_count_synthesized: false,
            }),
        }
    }

    async fn get_results(&self, token: u64, max_wait: Duration) -> Result<QueryResults, PollError> {
        let path = next_uri(&self.query_id, token);
        let mut inner = self.inner.lock().await;

        // Idempotent retry of the URI that produced the cached page.
        if path == inner.last_result_path {
            self.registry.record_heartbeat(&self.query_id);
            return Ok(inner.last_result.clone());
        }

        if token < inner.result_id {
            return Err(PollError::Gone);
        }

        if inner.last_result.next_uri.as_deref() != Some(path.as_str()) {
            return Err(PollError::NotFound);
        }

        let handle = self
            .registry
            .lookup(&self.query_id)
            .ok_or(PollError::NotFound)?;
        Ok(self.advance(&mut inner, &handle, path, max_wait).await)
    }

    async fn advance(
        &self,
        inner: &mut StreamingInner,
        handle: &Arc<QueryHandle>,
        path: String,
        max_wait: Duration,
    ) -> QueryResults {
        handle.record_heartbeat();
        let deadline = tokio::time::Instant::now() + max_wait;

        // Wait (within the poll budget) for execution to start.
        loop {
            let state = handle.state();
            let pre_execution = matches!(
                state,
                QueryState::Queued | QueryState::Planning | QueryState::Starting
            );
            if !pre_execution {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            handle.record_heartbeat();
            handle
                .state_machine()
                .wait_for_state_change(state, remaining)
                .await;
        }

        // First sight of the output schema.
        if inner.columns.is_none() {
            if let Some(columns) = handle.output_columns() {
                inner.columns = Some(columns.iter().map(Column::from).collect());
            }
        }

        // Wire finalized output buffers into the exchange.
        let exchange = handle.exchange();
        if let Some(exchange) = &exchange {
            let tasks = handle.output_tasks();
            let mut all_finalized = !tasks.is_empty();
            for task in &tasks {
                if task.is_finalized() {
                    exchange.add_location(task.buffer_uri());
                } else {
                    all_finalized = false;
                }
            }
            if all_finalized && !inner.no_more_locations_sent {
                exchange.no_more_locations();
                inner.no_more_locations_sent = true;
            }
        }

        // Pull pages up to the byte budget: the first pull may wait out
        // the remaining poll budget, the rest must be immediate.
        let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut bytes = 0usize;
        if let Some(exchange) = &exchange {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Some(page) = exchange.wait_for_page(remaining).await {
                bytes += page.size_bytes;
                rows.extend(page.rows);
            }
            while bytes < DESIRED_RESULT_BYTES {
                match exchange.poll_page() {
                    Some(page) => {
                        bytes += page.size_bytes;
                        rows.extend(page.rows);
                    }
                    None => break,
                }
            }
        }

        let state = handle.state();
        let mut data = if rows.is_empty() { None } else { Some(rows) };

        if state.is_done() {
            match &exchange {
                Some(exchange) => {
                    if exchange.is_finished() {
                        exchange.close();
                    }
                }
                // No output stage (DDL and session control): synthesize
                // the single-row success indicator.
                None => {
                    if state == QueryState::Finished && !inner.update_count_synthesized {
                        inner.columns = Some(vec![Column::new("result", "boolean")]);
                        data = Some(vec![vec![serde_json::json!(true)]]);
                        inner.update_count_synthesized = true;
                    }
                }
            }
        }

        let exchange_has_more = exchange
            .as_ref()
            .map(|exchange| !exchange.is_finished())
            .unwrap_or(false);
        // A response that carried rows always owes one more page, so
        // clients observe an explicit empty terminal response.
        let owes_next = exchange.is_some() && data.is_some();
        let next_uri = if !state.is_done() || exchange_has_more || owes_next {
            let token = inner.result_id + 1;
            inner.result_id = token;
            Some(next_uri(&self.query_id, token))
        } else {
            None
        };

        let error = if state == QueryState::Failed {
            handle.failure().map(|failure| failure.to_query_error())
        } else {
            None
        };

        let results = QueryResults {
            id: self.query_id.to_string(),
            info_uri: handle.self_uri().to_string(),
            partial_cancel_uri: None,
            next_uri,
            columns: inner.columns.clone(),
            data,
            stats: StatementStats::from_handle(handle),
            error,
            update_type: handle.update_type(),
            update_count: handle.update_count(),
        };
        inner.last_result = results.clone();
        inner.last_result_path = path;
        results
    }
}
