//! The per-query handle: the one entity every component talks to.
//!
//! The registry owns handles; everything else (admission, memory
//! manager, streaming protocol, execution) holds an `Arc` and mutates
//! only the fields it is responsible for. State transitions go through
//! the embedded [`QueryStateMachine`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ExecutionFailure;
use crate::exchange::{ExchangeClient, SharedExchangeClient};
use crate::memory::VersionedPoolId;
use crate::query::state::StateTimes;
use crate::query::{QueryId, QueryState, QueryStateMachine};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputColumn {
    pub name: String,
    pub type_name: String,
}

/// One output-stage task's buffer, as the coordinator sees it.
pub struct TaskOutput {
    buffer_uri: String,
    finalized: AtomicBool,
}

impl TaskOutput {
    pub fn new(buffer_uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            buffer_uri: buffer_uri.into(),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn buffer_uri(&self) -> &str {
        &self.buffer_uri
    }

    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

/// Output side of a started query: schema, the output stage's task
/// buffers, and the exchange client draining them.
pub struct QueryOutput {
    pub columns: Vec<OutputColumn>,
    pub tasks: Vec<Arc<TaskOutput>>,
    pub exchange: SharedExchangeClient,
}

pub struct QueryHandle {
    sql: String,
    session: Session,
    self_uri: String,
    state_machine: QueryStateMachine,
    last_heartbeat: Mutex<DateTime<Utc>>,
    memory_reservation: AtomicU64,
    peak_memory_reservation: AtomicU64,
    memory_pool: Mutex<VersionedPoolId>,
    set_session_properties: Mutex<HashMap<String, String>>,
    reset_session_properties: Mutex<HashSet<String>>,
    update_type: Mutex<Option<String>>,
    update_count: Mutex<Option<u64>>,
    output: Mutex<Option<QueryOutput>>,
    total_drivers: AtomicUsize,
    completed_drivers: AtomicUsize,
    processed_rows: AtomicU64,
    processed_bytes: AtomicU64,
    pruned: AtomicBool,
}

impl QueryHandle {
    pub fn new(query_id: QueryId, sql: impl Into<String>, session: Session) -> Arc<Self> {
        let self_uri = format!("/v1/query/{}", query_id);
        Arc::new(Self {
            sql: sql.into(),
            session,
            self_uri,
            state_machine: QueryStateMachine::new(query_id),
            last_heartbeat: Mutex::new(Utc::now()),
            memory_reservation: AtomicU64::new(0),
            peak_memory_reservation: AtomicU64::new(0),
            memory_pool: Mutex::new(VersionedPoolId::general()),
            set_session_properties: Mutex::new(HashMap::new()),
            reset_session_properties: Mutex::new(HashSet::new()),
            update_type: Mutex::new(None),
            update_count: Mutex::new(None),
            output: Mutex::new(None),
            total_drivers: AtomicUsize::new(0),
            completed_drivers: AtomicUsize::new(0),
            processed_rows: AtomicU64::new(0),
            processed_bytes: AtomicU64::new(0),
            pruned: AtomicBool::new(false),
        })
    }

    pub fn query_id(&self) -> &QueryId {
        self.state_machine.query_id()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn self_uri(&self) -> &str {
        &self.self_uri
    }

    pub fn state_machine(&self) -> &QueryStateMachine {
        &self.state_machine
    }

    pub fn state(&self) -> QueryState {
        self.state_machine.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.state_machine.created()
    }

    pub fn times(&self) -> StateTimes {
        self.state_machine.times()
    }

    pub fn failure(&self) -> Option<ExecutionFailure> {
        self.state_machine.failure()
    }

    /// State string as clients see it: a FAILED query whose cause was
    /// user cancellation reads CANCELED.
    pub fn display_state(&self) -> &'static str {
        let state = self.state();
        if state == QueryState::Failed {
            if let Some(failure) = self.failure() {
                if failure.is_user_canceled() {
                    return QueryState::Canceled.as_str();
                }
            }
        }
        state.as_str()
    }

    pub fn fail(&self, failure: ExecutionFailure) -> bool {
        self.state_machine.transition_to_failed(failure)
    }

    pub fn cancel(&self) -> bool {
        let canceled = self.state_machine.cancel();
        if canceled {
            if let Some(exchange) = self.exchange() {
                exchange.close();
            }
        }
        canceled
    }

    // ---- heartbeat ----

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock() = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock()
    }

    // ---- memory ----

    pub fn total_memory_reservation(&self) -> u64 {
        self.memory_reservation.load(Ordering::SeqCst)
    }

    pub fn peak_memory_reservation(&self) -> u64 {
        self.peak_memory_reservation.load(Ordering::SeqCst)
    }

    pub fn update_memory_reservation(&self, bytes: u64) {
        self.memory_reservation.store(bytes, Ordering::SeqCst);
        self.peak_memory_reservation
            .fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn memory_pool(&self) -> VersionedPoolId {
        self.memory_pool.lock().clone()
    }

    pub fn set_memory_pool(&self, pool: VersionedPoolId) {
        *self.memory_pool.lock() = pool;
    }

    // ---- session property directives ----

    pub fn add_set_session_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.set_session_properties
            .lock()
            .insert(name.into(), value.into());
    }

    pub fn add_reset_session_property(&self, name: impl Into<String>) {
        self.reset_session_properties.lock().insert(name.into());
    }

    pub fn set_session_properties(&self) -> HashMap<String, String> {
        self.set_session_properties.lock().clone()
    }

    pub fn reset_session_properties(&self) -> HashSet<String> {
        self.reset_session_properties.lock().clone()
    }

    // ---- update metadata ----

    pub fn set_update_type(&self, update_type: impl Into<String>) {
        *self.update_type.lock() = Some(update_type.into());
    }

    pub fn update_type(&self) -> Option<String> {
        self.update_type.lock().clone()
    }

    pub fn set_update_count(&self, count: u64) {
        *self.update_count.lock() = Some(count);
    }

    pub fn update_count(&self) -> Option<u64> {
        *self.update_count.lock()
    }

    // ---- output ----

    /// Install the output side once execution has produced a schema.
    /// A failure after this point closes the exchange so producers and
    /// blocked consumers are released.
    pub fn set_output(&self, output: QueryOutput) {
        let exchange = output.exchange.clone();
        *self.output.lock() = Some(output);
        self.state_machine.add_completion_listener(move |state| {
            if state == QueryState::Failed {
                exchange.close();
            }
        });
    }

    pub fn output_columns(&self) -> Option<Vec<OutputColumn>> {
        self.output.lock().as_ref().map(|o| o.columns.clone())
    }

    pub fn output_tasks(&self) -> Vec<Arc<TaskOutput>> {
        self.output
            .lock()
            .as_ref()
            .map(|o| o.tasks.clone())
            .unwrap_or_default()
    }

    pub fn exchange(&self) -> Option<SharedExchangeClient> {
        self.output.lock().as_ref().map(|o| o.exchange.clone())
    }

    // ---- driver / throughput counters ----

    pub fn set_total_drivers(&self, drivers: usize) {
        self.total_drivers.store(drivers, Ordering::SeqCst);
    }

    pub fn add_completed_driver(&self) {
        self.completed_drivers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_processed(&self, rows: u64, bytes: u64) {
        self.processed_rows.fetch_add(rows, Ordering::SeqCst);
        self.processed_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    // ---- history pruning ----

    /// Trim per-task detail once the query is deep in history. Summary
    /// stats and the terminal state survive.
    pub fn prune_info(&self) {
        if self.pruned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(output) = self.output.lock().as_mut() {
            output.tasks.clear();
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned.load(Ordering::SeqCst)
    }

    // ---- snapshots ----

    pub fn info(&self) -> BasicQueryInfo {
        let times = self.times();
        let ended = times.ended;
        let elapsed_millis = ended
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.created())
            .num_milliseconds()
            .max(0) as u64;
        BasicQueryInfo {
            query_id: self.query_id().clone(),
            state: self.display_state().to_string(),
            user: self.session.user.clone(),
            source: self.session.source.clone(),
            query: self.sql.clone(),
            created: self.created(),
            ended,
            elapsed_millis,
            memory_reservation_bytes: self.total_memory_reservation(),
            memory_pool: self.memory_pool(),
            total_drivers: self.total_drivers.load(Ordering::SeqCst),
            completed_drivers: self.completed_drivers.load(Ordering::SeqCst),
            processed_rows: self.processed_rows.load(Ordering::SeqCst),
            processed_bytes: self.processed_bytes.load(Ordering::SeqCst),
        }
    }
}

/// Registry/info-surface snapshot of one query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicQueryInfo {
    pub query_id: QueryId,
    pub state: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub query: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    pub elapsed_millis: u64,
    pub memory_reservation_bytes: u64,
    pub memory_pool: VersionedPoolId,
    pub total_drivers: usize,
    pub completed_drivers: usize,
    pub processed_rows: u64,
    pub processed_bytes: u64,
}
