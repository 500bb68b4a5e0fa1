//! Admission control: routing new queries to bounded queues.
//!
//! A query passes `reserve` on every queue named by its rule before it
//! is enqueued on the outermost one; the queues then hand it inward on
//! dequeue, so the innermost queue is the real concurrency gate. Any
//! failure rolls back every permit already taken and the caller fails
//! the query with QUERY_QUEUE_FULL.

pub mod queue;
pub mod rules;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::query::QueryHandle;
use crate::session::Session;

pub use queue::{QueryQueue, QueryStarter};
pub use rules::{QueueConfigFile, QueueRule};

pub struct QueueManager {
    queues: HashMap<String, Arc<QueryQueue>>,
    rules: Vec<QueueRule>,
    starter: Arc<dyn QueryStarter>,
}

impl QueueManager {
    pub fn new(config: &QueueConfigFile, starter: Arc<dyn QueryStarter>) -> Result<Self> {
        let (queues, rules) = rules::build_rules(config)?;
        info!(
            queues = queues.len(),
            rules = rules.len(),
            "admission queues configured"
        );
        Ok(Self {
            queues,
            rules,
            starter,
        })
    }

    pub fn load(path: Option<&Path>, starter: Arc<dyn QueryStarter>) -> Result<Self> {
        let config = match path {
            Some(path) => QueueConfigFile::load(path)?,
            None => QueueConfigFile::permissive(),
        };
        Self::new(&config, starter)
    }

    fn select_queues(&self, session: &Session) -> Option<&[Arc<QueryQueue>]> {
        self.rules
            .iter()
            .find(|rule| rule.matches(session))
            .map(|rule| rule.queues())
    }

    /// Admit a not-yet-started query. Returns false when it must be
    /// failed with QUERY_QUEUE_FULL: no rule matched, a queue was out of
    /// permits, or the outermost FIFO was full.
    pub fn submit(&self, handle: &Arc<QueryHandle>) -> bool {
        let queues = match self.select_queues(handle.session()) {
            Some(queues) => queues,
            None => {
                debug!(query_id = %handle.query_id(), "no queue rule matched");
                return false;
            }
        };

        let mut reserved = Vec::with_capacity(queues.len());
        for queue in queues {
            match queue.reserve(handle) {
                Some(token) => reserved.push(token),
                None => {
                    for token in reserved {
                        token.release();
                    }
                    return false;
                }
            }
        }

        let enqueued = queues[0].enqueue(
            handle.clone(),
            queues[1..].to_vec(),
            self.starter.clone(),
        );
        if !enqueued {
            for token in reserved {
                token.release();
            }
        }
        enqueued
    }

    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        let mut snapshot: Vec<QueueSnapshot> = self
            .queues
            .values()
            .map(|queue| QueueSnapshot {
                name: queue.name().to_string(),
                queued: queue.queued(),
                running: queue.running(),
                max_queued: queue.max_queued(),
                max_concurrent: queue.max_concurrent(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub name: String,
    pub queued: usize,
    pub running: usize,
    pub max_queued: usize,
    pub max_concurrent: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RunningStarter {
        started: Mutex<usize>,
    }

    impl RunningStarter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Mutex::new(0),
            })
        }
    }

    impl QueryStarter for RunningStarter {
        fn start(&self, handle: Arc<QueryHandle>) {
            *self.started.lock() += 1;
            handle.state_machine().transition_to_running();
        }
    }

    fn query(id: u32, user: &str) -> Arc<QueryHandle> {
        QueryHandle::new(
            format!("20260801_000000_{:05}_test0", id).parse().unwrap(),
            "SELECT 1",
            Session::builder(user).build(),
        )
    }

    fn manager(json: &str, starter: Arc<dyn QueryStarter>) -> QueueManager {
        let config: QueueConfigFile = serde_json::from_str(json).unwrap();
        QueueManager::new(&config, starter).unwrap()
    }

    #[tokio::test]
    async fn test_submit_starts_query() {
        let starter = RunningStarter::new();
        let manager = manager(
            r#"{
                "queues": {"global": {"maxConcurrent": 5, "maxQueued": 5}},
                "rules": [{"queues": ["global"]}]
            }"#,
            starter.clone(),
        );
        let q = query(1, "alice");
        assert!(manager.submit(&q));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*starter.started.lock(), 1);
    }

    #[tokio::test]
    async fn test_rejects_when_permits_exhausted_and_recovers() {
        let starter = RunningStarter::new();
        let manager = manager(
            r#"{
                "queues": {"tiny": {"maxConcurrent": 1, "maxQueued": 1}},
                "rules": [{"queues": ["tiny"]}]
            }"#,
            starter,
        );

        let a = query(1, "alice");
        let b = query(2, "alice");
        let c = query(3, "alice");
        assert!(manager.submit(&a));
        assert!(manager.submit(&b));
        assert!(!manager.submit(&c));

        // The running query completing frees a permit for resubmission.
        tokio::time::sleep(Duration::from_millis(30)).await;
        a.state_machine().transition_to_finished();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.submit(&c));
    }

    #[tokio::test]
    async fn test_rollback_on_inner_queue_rejection() {
        let starter = RunningStarter::new();
        let manager = manager(
            r#"{
                "queues": {
                    "outer": {"maxConcurrent": 2, "maxQueued": 2},
                    "inner": {"maxConcurrent": 1, "maxQueued": 1}
                },
                "rules": [{"queues": ["outer", "inner"]}]
            }"#,
            starter,
        );

        // inner has 2 permits total; the third submission fails reserve
        // on inner after reserving outer, and must give outer back.
        let a = query(1, "alice");
        let b = query(2, "alice");
        let c = query(3, "alice");
        assert!(manager.submit(&a));
        assert!(manager.submit(&b));
        assert!(!manager.submit(&c));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outer = manager.queues.get("outer").unwrap();
        // Two reservations (a, b) outstanding out of four permits; c's
        // was rolled back.
        assert_eq!(outer.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let starter = RunningStarter::new();
        let manager = manager(
            r#"{
                "queues": {
                    "admin": {"maxConcurrent": 5, "maxQueued": 5},
                    "global": {"maxConcurrent": 5, "maxQueued": 5}
                },
                "rules": [
                    {"user": "admin", "queues": ["admin"]},
                    {"queues": ["global"]}
                ]
            }"#,
            starter,
        );

        manager.submit(&query(1, "admin"));
        manager.submit(&query(2, "bob"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = manager.snapshot();
        let admin = snapshot.iter().find(|q| q.name == "admin").unwrap();
        let global = snapshot.iter().find(|q| q.name == "global").unwrap();
        assert_eq!(admin.running, 1);
        assert_eq!(global.running, 1);
    }
}
