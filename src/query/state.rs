//! The query lifecycle state machine.
//!
//! Transitions are forward-only along the lifecycle and the done states
//! absorb everything. A transition is decided under one lock, so at most
//! one of any set of racing callers wins; the new state is broadcast on
//! a watch channel (which `wait_for_state_change` consumes) and fanned
//! out to registered listeners off the caller's stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ErrorCode, ExecutionFailure};
use crate::query::QueryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    Queued,
    Planning,
    Starting,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl QueryState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Failed | QueryState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Queued => "QUEUED",
            QueryState::Planning => "PLANNING",
            QueryState::Starting => "STARTING",
            QueryState::Running => "RUNNING",
            QueryState::Finished => "FINISHED",
            QueryState::Failed => "FAILED",
            QueryState::Canceled => "CANCELED",
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            QueryState::Queued => 0,
            QueryState::Planning => 1,
            QueryState::Starting => 2,
            QueryState::Running => 3,
            QueryState::Finished => 4,
            QueryState::Failed => 4,
            QueryState::Canceled => 4,
        }
    }

    /// The permitted transitions form a DAG: strictly forward along the
    /// lifecycle, never out of a done state.
    pub fn can_transition_to(&self, target: QueryState) -> bool {
        !self.is_done() && target.ordinal() > self.ordinal()
    }
}

/// Timestamps recorded as each state is entered.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateTimes {
    pub planning_started: Option<DateTime<Utc>>,
    pub starting_started: Option<DateTime<Utc>>,
    pub execution_started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

struct Inner {
    state: QueryState,
    failure: Option<ExecutionFailure>,
    times: StateTimes,
    listeners: Vec<Arc<dyn Fn(QueryState) + Send + Sync>>,
}

pub struct QueryStateMachine {
    query_id: QueryId,
    created: DateTime<Utc>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<QueryState>,
}

impl QueryStateMachine {
    pub fn new(query_id: QueryId) -> Self {
        let (state_tx, _) = watch::channel(QueryState::Queued);
        Self {
            query_id,
            created: Utc::now(),
            inner: Mutex::new(Inner {
                state: QueryState::Queued,
                failure: None,
                times: StateTimes::default(),
                listeners: Vec::new(),
            }),
            state_tx,
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn state(&self) -> QueryState {
        self.inner.lock().state
    }

    pub fn times(&self) -> StateTimes {
        self.inner.lock().times
    }

    pub fn failure(&self) -> Option<ExecutionFailure> {
        self.inner.lock().failure.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState> {
        self.state_tx.subscribe()
    }

    pub fn transition_to_planning(&self) -> bool {
        self.transition(QueryState::Planning)
    }

    pub fn transition_to_starting(&self) -> bool {
        self.transition(QueryState::Starting)
    }

    pub fn transition_to_running(&self) -> bool {
        self.transition(QueryState::Running)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.transition(QueryState::Finished)
    }

    /// Record the cause and move to FAILED. The first failure wins;
    /// later calls are ignored.
    pub fn transition_to_failed(&self, failure: ExecutionFailure) -> bool {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                return false;
            }
            inner.failure = Some(failure);
            self.apply(&mut inner, QueryState::Failed)
        };
        fan_out_listeners(listeners, QueryState::Failed);
        true
    }

    /// User cancellation: FAILED with USER_CANCELED (the protocol layer
    /// reports such queries as CANCELED).
    pub fn cancel(&self) -> bool {
        self.transition_to_failed(ExecutionFailure::new(
            ErrorCode::USER_CANCELED,
            "Query was canceled by the user",
        ))
    }

    pub fn transition(&self, target: QueryState) -> bool {
        let listeners = {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition_to(target) {
                return false;
            }
            self.apply(&mut inner, target)
        };
        fan_out_listeners(listeners, target);
        true
    }

    /// Commit the transition under the lock; the returned listener set
    /// is invoked by the caller after the lock is released.
    fn apply(
        &self,
        inner: &mut Inner,
        target: QueryState,
    ) -> Vec<Arc<dyn Fn(QueryState) + Send + Sync>> {
        let now = Utc::now();
        match target {
            QueryState::Planning => inner.times.planning_started = Some(now),
            QueryState::Starting => inner.times.starting_started = Some(now),
            QueryState::Running => inner.times.execution_started = Some(now),
            QueryState::Finished | QueryState::Failed | QueryState::Canceled => {
                inner.times.ended = Some(now)
            }
            QueryState::Queued => {}
        }
        inner.state = target;
        debug!(query_id = %self.query_id, state = target.as_str(), "query state changed");
        self.state_tx.send_replace(target);
        inner.listeners.clone()
    }

    /// Attach a listener invoked for every subsequent state change.
    pub fn add_state_listener(&self, listener: impl Fn(QueryState) + Send + Sync + 'static) {
        self.inner.lock().listeners.push(Arc::new(listener));
    }

    /// Attach a callback fired exactly once when a done state is
    /// reached. If the machine is already done it fires inline.
    pub fn add_completion_listener(
        &self,
        listener: impl FnOnce(QueryState) + Send + Sync + 'static,
    ) {
        let fired = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(Mutex::new(Some(listener)));

        let mut inner = self.inner.lock();
        if inner.state.is_done() {
            let state = inner.state;
            drop(inner);
            if !fired.swap(true, Ordering::SeqCst) {
                if let Some(callback) = slot.lock().take() {
                    callback(state);
                }
            }
            return;
        }
        inner.listeners.push(Arc::new(move |state: QueryState| {
            if state.is_done() && !fired.swap(true, Ordering::SeqCst) {
                if let Some(callback) = slot.lock().take() {
                    callback(state);
                }
            }
        }));
    }

    /// Block until the state differs from `current` or `max_wait`
    /// elapses; returns the state observed last either way.
    pub async fn wait_for_state_change(
        &self,
        current: QueryState,
        max_wait: Duration,
    ) -> QueryState {
        let mut rx = self.state_tx.subscribe();
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let state = *rx.borrow_and_update();
            if state != current {
                return state;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Timeout, or the machine was dropped.
                _ => return *rx.borrow(),
            }
        }
    }
}

/// Fan listeners out off the transitioning thread. Outside a runtime
/// (plain unit tests) they run inline instead.
fn fan_out_listeners(listeners: Vec<Arc<dyn Fn(QueryState) + Send + Sync>>, state: QueryState) {
    if listeners.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for listener in listeners {
                    listener(state);
                }
            });
        }
        Err(_) => {
            for listener in listeners {
                listener(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn machine() -> QueryStateMachine {
        QueryStateMachine::new("20260801_000000_00000_test0".parse().unwrap())
    }

    #[test]
    fn test_full_lifecycle() {
        let sm = machine();
        assert_eq!(sm.state(), QueryState::Queued);
        assert!(sm.transition_to_planning());
        assert!(sm.transition_to_starting());
        assert!(sm.transition_to_running());
        assert!(sm.transition_to_finished());
        assert!(sm.state().is_done());
        assert!(sm.times().ended.is_some());
    }

    #[test]
    fn test_states_can_be_skipped() {
        let sm = machine();
        assert!(sm.transition_to_running());
        assert_eq!(sm.state(), QueryState::Running);
    }

    #[test]
    fn test_no_backward_transitions() {
        let sm = machine();
        assert!(sm.transition_to_running());
        assert!(!sm.transition_to_planning());
        assert!(!sm.transition_to_starting());
        assert_eq!(sm.state(), QueryState::Running);
    }

    #[test]
    fn test_done_states_are_absorbing() {
        let sm = machine();
        assert!(sm.transition_to_finished());
        assert!(!sm.transition_to_running());
        assert!(!sm.transition_to_failed(ExecutionFailure::new(
            ErrorCode::GENERIC_INTERNAL_ERROR,
            "too late"
        )));
        assert_eq!(sm.state(), QueryState::Finished);
        assert!(sm.failure().is_none());
    }

    #[test]
    fn test_first_failure_wins() {
        let sm = machine();
        assert!(sm.transition_to_failed(ExecutionFailure::new(
            ErrorCode::EXCEEDED_MEMORY_LIMIT,
            "out of memory"
        )));
        assert!(!sm.transition_to_failed(ExecutionFailure::new(
            ErrorCode::ABANDONED_QUERY,
            "abandoned"
        )));
        assert_eq!(
            sm.failure().unwrap().code,
            ErrorCode::EXCEEDED_MEMORY_LIMIT
        );
    }

    #[test]
    fn test_cancel_records_user_canceled() {
        let sm = machine();
        assert!(sm.cancel());
        assert_eq!(sm.state(), QueryState::Failed);
        assert!(sm.failure().unwrap().is_user_canceled());
        // Cancel of a done query is a no-op.
        assert!(!sm.cancel());
    }

    #[test]
    fn test_completion_listener_fires_once() {
        let sm = machine();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        sm.add_completion_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sm.transition_to_running();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sm.transition_to_finished();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_listener_fires_inline_when_already_done() {
        let sm = machine();
        sm.cancel();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        sm.add_completion_listener(move |state| {
            assert!(state.is_done());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_state_change() {
        let sm = Arc::new(machine());
        let waiter = sm.clone();
        let task = tokio::spawn(async move {
            waiter
                .wait_for_state_change(QueryState::Queued, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sm.transition_to_running();
        assert_eq!(task.await.unwrap(), QueryState::Running);
    }

    #[tokio::test]
    async fn test_wait_for_state_change_times_out() {
        let sm = machine();
        let state = sm
            .wait_for_state_change(QueryState::Queued, Duration::from_millis(20))
            .await;
        assert_eq!(state, QueryState::Queued);
    }
}
