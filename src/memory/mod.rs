//! Cluster memory management.
//!
//! The coordinator tracks every running query's memory reservation
//! against versioned pools. Two pools are privileged: `general`, where
//! queries start, and `reserved`, which hosts the single largest query
//! when the general pool is oversubscribed. When even that escape hatch
//! is occupied, the largest consumer is killed. Pool reassignments are
//! broadcast to workers as versioned requests; workers apply them in
//! version order and ignore stale versions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorCode, ExecutionFailure};
use crate::query::{QueryHandle, QueryId};

pub const GENERAL_POOL: &str = "general";
pub const RESERVED_POOL: &str = "reserved";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryPoolId(String);

impl MemoryPoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn general() -> Self {
        Self(GENERAL_POOL.to_string())
    }

    pub fn reserved() -> Self {
        Self(RESERVED_POOL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A pool assignment stamped with the version of the request that
/// produced it, so queries and workers can detect reallocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedPoolId {
    pub pool: MemoryPoolId,
    pub version: u64,
}

impl VersionedPoolId {
    pub fn general() -> Self {
        Self {
            pool: MemoryPoolId::general(),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPoolInfo {
    pub pool: MemoryPoolId,
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    pub free_bytes: u64,
    pub version: u64,
    pub query_count: usize,
}

/// The complete query→pool mapping dispatched to every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAssignmentsRequest {
    pub version: u64,
    pub assignments: Vec<PoolAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAssignment {
    pub query_id: QueryId,
    pub pool: MemoryPoolId,
}

/// Sink for assignment broadcasts. The real implementation fans out to
/// worker task endpoints; [`WorkerPoolView`] is the in-process stand-in.
pub trait PoolAssignmentNotifier: Send + Sync {
    fn send_assignments(&self, request: PoolAssignmentsRequest);
}

/// In-process view of the worker fleet's pool assignments. Applies
/// requests in version order, drops stale versions, and reports the
/// last applied version the way workers do on their heartbeats.
#[derive(Default)]
pub struct WorkerPoolView {
    applied_version: AtomicU64,
    assignments: Mutex<HashMap<QueryId, MemoryPoolId>>,
}

impl WorkerPoolView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledged_version(&self) -> u64 {
        self.applied_version.load(Ordering::SeqCst)
    }

    pub fn assignment(&self, query_id: &QueryId) -> Option<MemoryPoolId> {
        self.assignments.lock().get(query_id).cloned()
    }
}

impl PoolAssignmentNotifier for WorkerPoolView {
    fn send_assignments(&self, request: PoolAssignmentsRequest) {
        let mut assignments = self.assignments.lock();
        let applied = self.applied_version.load(Ordering::SeqCst);
        if request.version <= applied {
            warn!(
                version = request.version,
                applied, "dropping stale pool assignment request"
            );
            return;
        }
        assignments.clear();
        for assignment in request.assignments {
            assignments.insert(assignment.query_id, assignment.pool);
        }
        self.applied_version.store(request.version, Ordering::SeqCst);
    }
}

struct PoolState {
    total_bytes: u64,
    reserved_bytes: u64,
    version: u64,
    query_reservations: HashMap<QueryId, u64>,
}

pub struct ClusterMemoryManager {
    pools: Mutex<HashMap<MemoryPoolId, PoolState>>,
    max_query_memory: u64,
    next_request_version: AtomicU64,
    notifier: Arc<dyn PoolAssignmentNotifier>,
}

impl ClusterMemoryManager {
    pub fn new(
        general_pool_bytes: u64,
        reserved_pool_bytes: u64,
        max_query_memory: u64,
        notifier: Arc<dyn PoolAssignmentNotifier>,
    ) -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            MemoryPoolId::general(),
            PoolState {
                total_bytes: general_pool_bytes,
                reserved_bytes: 0,
                version: 0,
                query_reservations: HashMap::new(),
            },
        );
        pools.insert(
            MemoryPoolId::reserved(),
            PoolState {
                total_bytes: reserved_pool_bytes,
                reserved_bytes: 0,
                version: 0,
                query_reservations: HashMap::new(),
            },
        );
        Self {
            pools: Mutex::new(pools),
            max_query_memory,
            next_request_version: AtomicU64::new(0),
            notifier,
        }
    }

    /// One enforcement tick over the currently running queries. All
    /// state changes the manager makes for the tick happen under its
    /// pool lock; at most one reassignment is emitted per tick.
    pub fn process(&self, queries: &[Arc<QueryHandle>]) {
        // Per-query hard cap, independent of pool state.
        for query in queries {
            if query.is_done() {
                continue;
            }
            let reservation = query.total_memory_reservation();
            if reservation > self.max_query_memory {
                warn!(
                    query_id = %query.query_id(),
                    reservation,
                    limit = self.max_query_memory,
                    "query exceeded per-query memory limit"
                );
                query.fail(ExecutionFailure::new(
                    ErrorCode::EXCEEDED_MEMORY_LIMIT,
                    format!(
                        "Query exceeded max memory limit of {} bytes (reserved {} bytes)",
                        self.max_query_memory, reservation
                    ),
                ));
            }
        }

        let running: Vec<&Arc<QueryHandle>> = queries.iter().filter(|q| !q.is_done()).collect();

        let mut pools = self.pools.lock();

        // Recompute pool composition from the live reservations.
        for state in pools.values_mut() {
            state.reserved_bytes = 0;
            state.query_reservations.clear();
        }
        for query in &running {
            let pool_id = query.memory_pool().pool;
            if let Some(state) = pools.get_mut(&pool_id) {
                let reservation = query.total_memory_reservation();
                state.reserved_bytes += reservation;
                state
                    .query_reservations
                    .insert(query.query_id().clone(), reservation);
            }
        }

        let general = MemoryPoolId::general();
        let oversubscribed = pools
            .get(&general)
            .map(|p| p.reserved_bytes > p.total_bytes)
            .unwrap_or(false);
        if !oversubscribed {
            return;
        }

        let largest = running
            .iter()
            .filter(|q| q.memory_pool().pool == general)
            .max_by_key(|q| q.total_memory_reservation());
        let largest = match largest {
            Some(q) => q,
            None => return,
        };

        let reserved = MemoryPoolId::reserved();
        let reserved_occupied = running.iter().any(|q| q.memory_pool().pool == reserved);

        if reserved_occupied {
            warn!(
                query_id = %largest.query_id(),
                reservation = largest.total_memory_reservation(),
                "general pool oversubscribed and reserved pool occupied; killing largest query"
            );
            largest.fail(ExecutionFailure::new(
                ErrorCode::EXCEEDED_MEMORY_LIMIT,
                format!(
                    "The cluster is out of memory and the reserved pool is occupied \
                     (query reserved {} bytes in the general pool)",
                    largest.total_memory_reservation()
                ),
            ));
            return;
        }

        // Promote the largest consumer to the reserved pool and
        // broadcast the new allocation under a fresh version.
        let version = self.next_request_version.fetch_add(1, Ordering::SeqCst) + 1;
        let moved = largest.total_memory_reservation();
        largest.set_memory_pool(VersionedPoolId {
            pool: reserved.clone(),
            version,
        });
        if let Some(state) = pools.get_mut(&general) {
            state.reserved_bytes = state.reserved_bytes.saturating_sub(moved);
            state.query_reservations.remove(largest.query_id());
            state.version = version;
        }
        if let Some(state) = pools.get_mut(&reserved) {
            state.reserved_bytes += moved;
            state
                .query_reservations
                .insert(largest.query_id().clone(), moved);
            state.version = version;
        }
        drop(pools);

        info!(
            query_id = %largest.query_id(),
            version,
            bytes = moved,
            "reassigned largest query to the reserved pool"
        );

        let assignments = running
            .iter()
            .map(|q| PoolAssignment {
                query_id: q.query_id().clone(),
                pool: q.memory_pool().pool,
            })
            .collect();
        self.notifier.send_assignments(PoolAssignmentsRequest {
            version,
            assignments,
        });
    }

    pub fn pools(&self) -> Vec<MemoryPoolInfo> {
        self.pools
            .lock()
            .iter()
            .map(|(id, state)| MemoryPoolInfo {
                pool: id.clone(),
                total_bytes: state.total_bytes,
                reserved_bytes: state.reserved_bytes,
                free_bytes: state.total_bytes.saturating_sub(state.reserved_bytes),
                version: state.version,
                query_count: state.query_reservations.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryState;
    use crate::session::Session;

    fn query(id: u32, reservation: u64) -> Arc<QueryHandle> {
        let handle = QueryHandle::new(
            format!("20260801_000000_{:05}_test0", id).parse().unwrap(),
            "SELECT 1",
            Session::builder("alice").build(),
        );
        handle.state_machine().transition_to_running();
        handle.update_memory_reservation(reservation);
        handle
    }

    fn manager(
        general: u64,
        reserved: u64,
        per_query: u64,
    ) -> (ClusterMemoryManager, Arc<WorkerPoolView>) {
        let workers = Arc::new(WorkerPoolView::new());
        let manager = ClusterMemoryManager::new(general, reserved, per_query, workers.clone());
        (manager, workers)
    }

    #[test]
    fn test_within_capacity_no_action() {
        let (manager, workers) = manager(1000, 500, 10_000);
        let a = query(1, 400);
        let b = query(2, 300);
        manager.process(&[a.clone(), b.clone()]);

        assert_eq!(a.state(), QueryState::Running);
        assert_eq!(b.state(), QueryState::Running);
        assert_eq!(workers.acknowledged_version(), 0);

        let general = manager
            .pools()
            .into_iter()
            .find(|p| p.pool == MemoryPoolId::general())
            .unwrap();
        assert_eq!(general.reserved_bytes, 700);
        assert_eq!(general.free_bytes, 300);
    }

    #[test]
    fn test_per_query_cap_kills_regardless_of_pool() {
        let (manager, _) = manager(10_000, 500, 100);
        let q = query(1, 101);
        manager.process(&[q.clone()]);
        assert_eq!(q.state(), QueryState::Failed);
        assert_eq!(
            q.failure().unwrap().code,
            ErrorCode::EXCEEDED_MEMORY_LIMIT
        );
    }

    #[test]
    fn test_oversubscription_moves_largest_to_reserved() {
        let (manager, workers) = manager(1000, 800, 10_000);
        let small = query(1, 400);
        let large = query(2, 700);
        manager.process(&[small.clone(), large.clone()]);

        assert_eq!(large.memory_pool().pool, MemoryPoolId::reserved());
        assert_eq!(large.memory_pool().version, 1);
        assert_eq!(small.memory_pool().pool, MemoryPoolId::general());
        assert_eq!(large.state(), QueryState::Running);

        // Workers saw the new allocation.
        assert_eq!(workers.acknowledged_version(), 1);
        assert_eq!(
            workers.assignment(large.query_id()),
            Some(MemoryPoolId::reserved())
        );

        // After the tick the general pool is back under capacity.
        let general = manager
            .pools()
            .into_iter()
            .find(|p| p.pool == MemoryPoolId::general())
            .unwrap();
        assert!(general.reserved_bytes <= general.total_bytes);
    }

    #[test]
    fn test_reserved_occupied_kills_largest() {
        let (manager, _) = manager(1000, 800, 10_000);
        let small = query(1, 400);
        let large = query(2, 700);
        manager.process(&[small.clone(), large.clone()]);
        assert_eq!(large.memory_pool().pool, MemoryPoolId::reserved());

        // A new pair oversubscribes the general pool again while the
        // reserved pool is still occupied: the bigger one dies.
        let third = query(3, 900);
        manager.process(&[small.clone(), large.clone(), third.clone()]);

        assert_eq!(third.state(), QueryState::Failed);
        assert_eq!(
            third.failure().unwrap().code,
            ErrorCode::EXCEEDED_MEMORY_LIMIT
        );
        assert_eq!(small.state(), QueryState::Running);
        assert_eq!(large.state(), QueryState::Running);
    }

    #[test]
    fn test_request_versions_increase() {
        let (manager, workers) = manager(100, 800, 10_000);
        let first = query(1, 150);
        manager.process(&[first.clone()]);
        assert_eq!(first.memory_pool().version, 1);

        // First query completes; another oversubscribes later.
        first.state_machine().transition_to_finished();
        let second = query(2, 150);
        manager.process(&[second.clone()]);
        assert_eq!(second.memory_pool().version, 2);
        assert_eq!(workers.acknowledged_version(), 2);
    }

    #[test]
    fn test_worker_view_drops_stale_versions() {
        let workers = WorkerPoolView::new();
        let id: QueryId = "20260801_000000_00001_test0".parse().unwrap();
        workers.send_assignments(PoolAssignmentsRequest {
            version: 5,
            assignments: vec![PoolAssignment {
                query_id: id.clone(),
                pool: MemoryPoolId::reserved(),
            }],
        });
        workers.send_assignments(PoolAssignmentsRequest {
            version: 3,
            assignments: vec![PoolAssignment {
                query_id: id.clone(),
                pool: MemoryPoolId::general(),
            }],
        });
        assert_eq!(workers.acknowledged_version(), 5);
        assert_eq!(workers.assignment(&id), Some(MemoryPoolId::reserved()));
    }
}
