//! A single bounded admission queue.
//!
//! Each queue holds two budgets: `max_queued + max_concurrent`
//! admission permits (consumed by `reserve`, returned when the query
//! completes) and a dispatch semaphore of `max_concurrent` permits that
//! gates how many dequeued queries are in flight at once. Counters are
//! atomics; the dispatcher is a task fed by an unbounded channel, so
//! enqueue never blocks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ErrorCode, ExecutionFailure};
use crate::query::QueryHandle;

/// Seam to the execution collaborator: invoked when a query clears its
/// innermost queue.
pub trait QueryStarter: Send + Sync {
    fn start(&self, handle: Arc<QueryHandle>);
}

#[derive(Debug)]
pub struct QueryQueue {
    name: String,
    max_queued: usize,
    max_concurrent: usize,
    permits: AtomicUsize,
    queued_count: Arc<AtomicUsize>,
    running_count: Arc<AtomicUsize>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<QueuedExecution>,
}

impl QueryQueue {
    /// Create the queue and spawn its dispatcher. Must be called from a
    /// runtime context.
    pub fn new(name: impl Into<String>, max_queued: usize, max_concurrent: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            name: name.into(),
            max_queued,
            max_concurrent,
            permits: AtomicUsize::new(max_queued + max_concurrent),
            queued_count: Arc::new(AtomicUsize::new(0)),
            running_count: Arc::new(AtomicUsize::new(0)),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tx,
        });
        tokio::spawn(dispatch(
            rx,
            queue.semaphore.clone(),
            queue.running_count.clone(),
        ));
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_queued(&self) -> usize {
        self.max_queued
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn queued(&self) -> usize {
        self.queued_count.load(Ordering::SeqCst)
    }

    /// Admission permits currently available (`max_queued +
    /// max_concurrent` minus outstanding reservations).
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    /// Take one admission permit. The permit is returned when the query
    /// completes, or earlier through the returned token on rollback.
    pub fn reserve(self: &Arc<Self>, handle: &Arc<QueryHandle>) -> Option<Arc<ReservationToken>> {
        let acquired = self
            .permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |permits| {
                permits.checked_sub(1)
            })
            .is_ok();
        if !acquired {
            debug!(queue = %self.name, query_id = %handle.query_id(), "queue out of permits");
            return None;
        }
        let token = Arc::new(ReservationToken {
            queue: self.clone(),
            released: AtomicBool::new(false),
        });
        let completion_token = token.clone();
        handle
            .state_machine()
            .add_completion_listener(move |_| completion_token.release());
        Some(token)
    }

    fn release_permit(&self) {
        self.permits.fetch_add(1, Ordering::SeqCst);
    }

    /// Append the query to this queue's FIFO. Fails when the waiting
    /// count is at `max_queued`.
    pub fn enqueue(
        &self,
        handle: Arc<QueryHandle>,
        next_queues: Vec<Arc<QueryQueue>>,
        starter: Arc<dyn QueryStarter>,
    ) -> bool {
        let admitted = self
            .queued_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                if queued < self.max_queued {
                    Some(queued + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !admitted {
            return false;
        }

        let token = Arc::new(DequeueToken {
            claimed: AtomicBool::new(false),
            queued_count: self.queued_count.clone(),
        });
        // A query that dies while waiting leaves the FIFO logically:
        // its waiting slot is given back and the dispatcher will skip it.
        let completion_token = token.clone();
        handle.state_machine().add_completion_listener(move |_| {
            completion_token.claim();
        });

        self.tx
            .send(QueuedExecution {
                handle,
                next_queues,
                starter,
                token,
            })
            .is_ok()
    }
}

/// One admission permit, releasable at most once (rollback or query
/// completion, whichever happens first).
pub struct ReservationToken {
    queue: Arc<QueryQueue>,
    released: AtomicBool,
}

impl ReservationToken {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.queue.release_permit();
        }
    }
}

/// Claimed exactly once, by the dispatcher or by query completion;
/// claiming gives the waiting slot back.
struct DequeueToken {
    claimed: AtomicBool,
    queued_count: Arc<AtomicUsize>,
}

impl DequeueToken {
    fn claim(&self) -> bool {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.queued_count.fetch_sub(1, Ordering::SeqCst);
        true
    }
}

struct QueuedExecution {
    handle: Arc<QueryHandle>,
    next_queues: Vec<Arc<QueryQueue>>,
    starter: Arc<dyn QueryStarter>,
    token: Arc<DequeueToken>,
}

impl QueuedExecution {
    /// Invoked by the dispatcher with a held dispatch permit. The permit
    /// travels with the query until it completes; if the wrapper was
    /// already claimed (the query died in the queue) the permit is
    /// simply dropped.
    fn dequeue(self, permit: OwnedSemaphorePermit, running_count: Arc<AtomicUsize>) {
        if !self.token.claim() {
            return;
        }
        if self.handle.is_done() {
            return;
        }

        running_count.fetch_add(1, Ordering::SeqCst);
        let permit_slot = Arc::new(Mutex::new(Some(permit)));
        let completion_running = running_count.clone();
        self.handle.state_machine().add_completion_listener(move |_| {
            permit_slot.lock().take();
            completion_running.fetch_sub(1, Ordering::SeqCst);
        });

        match self.next_queues.split_first() {
            // Strict nesting: hand the query to the next (inner) queue.
            Some((next, rest)) => {
                if !next.enqueue(self.handle.clone(), rest.to_vec(), self.starter.clone()) {
                    self.handle.fail(ExecutionFailure::new(
                        ErrorCode::QUERY_QUEUE_FULL,
                        format!("Too many queued queries for queue {}", next.name()),
                    ));
                }
            }
            // Innermost queue: this is the actual concurrency gate.
            None => self.starter.start(self.handle.clone()),
        }
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<QueuedExecution>,
    semaphore: Arc<Semaphore>,
    running_count: Arc<AtomicUsize>,
) {
    while let Some(execution) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        execution.dequeue(permit, running_count.clone());
    }
}
