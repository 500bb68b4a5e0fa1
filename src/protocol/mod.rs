//! The client-facing streaming results protocol.
//!
//! Wire types here, per-query streaming sessions in [`streaming`], the
//! HTTP surface in [`http`].

pub mod http;
pub mod streaming;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::query::{OutputColumn, QueryHandle, QueryState};

pub use http::{parse_session_headers, router, CoordinatorService};
pub use streaming::{PollError, StreamingQueryManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub type_signature: TypeSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSignature {
    pub raw_type: String,
    pub arguments: Vec<serde_json::Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            type_signature: TypeSignature {
                raw_type: type_name.clone(),
                arguments: Vec::new(),
            },
            type_name,
        }
    }
}

impl From<&OutputColumn> for Column {
    fn from(column: &OutputColumn) -> Self {
        Column::new(column.name.clone(), column.type_name.clone())
    }
}

/// One page of the streaming response. `next_uri` absent means the
/// response is terminal and the client stops polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    pub id: String,
    pub info_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_cancel_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Vec<serde_json::Value>>>,
    pub stats: StatementStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementStats {
    pub state: String,
    pub queued: bool,
    pub nodes: u32,
    pub total_splits: usize,
    pub queued_splits: usize,
    pub running_splits: usize,
    pub completed_splits: usize,
    pub cpu_time_millis: u64,
    pub wall_time_millis: u64,
    pub queued_time_millis: u64,
    pub elapsed_time_millis: u64,
    pub processed_rows: u64,
    pub processed_bytes: u64,
    pub peak_memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_stage: Option<StageStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStats {
    pub stage_id: String,
    pub state: String,
    pub done: bool,
    pub total_splits: usize,
    pub completed_splits: usize,
    pub processed_rows: u64,
    pub processed_bytes: u64,
    pub sub_stages: Vec<StageStats>,
}

impl StatementStats {
    pub fn from_handle(handle: &QueryHandle) -> Self {
        let info = handle.info();
        let times = handle.times();
        let state = handle.state();

        let queued_end = times
            .planning_started
            .or(times.starting_started)
            .or(times.execution_started)
            .or(times.ended);
        let queued_time_millis = queued_end
            .map(|t| t.signed_duration_since(handle.created()).num_milliseconds())
            .unwrap_or_else(|| {
                chrono::Utc::now()
                    .signed_duration_since(handle.created())
                    .num_milliseconds()
            })
            .max(0) as u64;
        let wall_time_millis = match (times.execution_started, times.ended) {
            (Some(start), Some(end)) => end.signed_duration_since(start).num_milliseconds(),
            (Some(start), None) => chrono::Utc::now()
                .signed_duration_since(start)
                .num_milliseconds(),
            _ => 0,
        }
        .max(0) as u64;

        let running_splits = if state == QueryState::Running {
            info.total_drivers.saturating_sub(info.completed_drivers)
        } else {
            0
        };
        let root_stage = if handle.output_columns().is_some() {
            Some(StageStats {
                stage_id: "0".to_string(),
                state: handle.display_state().to_string(),
                done: state.is_done(),
                total_splits: info.total_drivers,
                completed_splits: info.completed_drivers,
                processed_rows: info.processed_rows,
                processed_bytes: info.processed_bytes,
                sub_stages: Vec::new(),
            })
        } else {
            None
        };

        Self {
            state: handle.display_state().to_string(),
            queued: state == QueryState::Queued,
            nodes: 1,
            total_splits: info.total_drivers,
            queued_splits: 0,
            running_splits,
            completed_splits: info.completed_drivers,
            cpu_time_millis: 0,
            wall_time_millis,
            queued_time_millis,
            elapsed_time_millis: info.elapsed_millis,
            processed_rows: info.processed_rows,
            processed_bytes: info.processed_bytes,
            peak_memory_bytes: handle.peak_memory_reservation(),
            root_stage,
        }
    }
}
