//! HTTP surface of the streaming protocol.
//!
//! `/v1/statement` is the long-poll submit/poll/cancel triple;
//! `/v1/execute` is the synchronous convenience wrapper; `/v1/query`
//! and `/v1/status` expose coordinator state for tooling.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::admission::QueueSnapshot;
use crate::error::{CoordError, Result};
use crate::memory::MemoryPoolInfo;
use crate::protocol::streaming::{PollError, StreamingQueryManager, MAX_WAIT};
use crate::protocol::{Column, QueryResults, StatementStats};
use crate::query::{BasicQueryInfo, QueryId};
use crate::session::Session;

pub const USER_HEADER: &str = "x-user";
pub const SOURCE_HEADER: &str = "x-source";
pub const CATALOG_HEADER: &str = "x-catalog";
pub const SCHEMA_HEADER: &str = "x-schema";
pub const TIME_ZONE_HEADER: &str = "x-time-zone";
pub const LANGUAGE_HEADER: &str = "x-language";
pub const SESSION_HEADER: &str = "x-session";
pub const PREPARED_STATEMENT_HEADER: &str = "x-prepared-statement";
pub const SET_SESSION_HEADER: &str = "x-set-session";
pub const CLEAR_SESSION_HEADER: &str = "x-clear-session";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct CoordinatorService {
    streaming: Arc<StreamingQueryManager>,
    started: std::time::Instant,
}

impl CoordinatorService {
    pub fn new(streaming: Arc<StreamingQueryManager>) -> Arc<Self> {
        Arc::new(Self {
            streaming,
            started: std::time::Instant::now(),
        })
    }

    pub fn streaming(&self) -> &Arc<StreamingQueryManager> {
        &self.streaming
    }
}

pub fn router(service: Arc<CoordinatorService>) -> Router {
    Router::new()
        .route("/v1/statement", post(submit_statement))
        .route(
            "/v1/statement/{query_id}/{token}",
            get(poll_statement).delete(cancel_statement),
        )
        .route("/v1/execute", post(execute_statement))
        .route("/v1/query", get(list_queries))
        .route("/v1/query/{query_id}", get(query_info))
        .route("/v1/status", get(coordinator_status))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(service)
}

/// Build a `Session` from submission headers. `X-USER` is mandatory;
/// `X-SESSION` and `X-PREPARED-STATEMENT` are repeatable and may carry
/// comma-separated `name=value` pairs.
pub fn parse_session_headers(headers: &HeaderMap) -> Result<Session> {
    let user = single_header(headers, USER_HEADER)?
        .filter(|user| !user.is_empty())
        .ok_or_else(|| CoordError::InvalidRequest("X-USER header is required".to_string()))?;
    let mut builder = Session::builder(user);

    if let Some(source) = single_header(headers, SOURCE_HEADER)? {
        builder = builder.source(source);
    }
    if let Some(catalog) = single_header(headers, CATALOG_HEADER)? {
        builder = builder.catalog(catalog);
    }
    if let Some(schema) = single_header(headers, SCHEMA_HEADER)? {
        builder = builder.schema(schema);
    }
    if let Some(time_zone) = single_header(headers, TIME_ZONE_HEADER)? {
        builder = builder.time_zone(time_zone);
    }
    if let Some(language) = single_header(headers, LANGUAGE_HEADER)? {
        builder = builder.language(language);
    }

    for value in headers.get_all(SESSION_HEADER) {
        let value = value.to_str().map_err(|_| {
            CoordError::InvalidRequest("X-SESSION header is not valid UTF-8".to_string())
        })?;
        for pair in value.split(',') {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                CoordError::InvalidRequest(format!("malformed X-SESSION entry: {}", pair))
            })?;
            builder = builder.property(name.trim(), value.trim().to_string());
        }
    }

    for value in headers.get_all(PREPARED_STATEMENT_HEADER) {
        let value = value.to_str().map_err(|_| {
            CoordError::InvalidRequest("X-PREPARED-STATEMENT header is not valid UTF-8".to_string())
        })?;
        let (name, sql) = value.split_once('=').ok_or_else(|| {
            CoordError::InvalidRequest(format!("malformed X-PREPARED-STATEMENT entry: {}", value))
        })?;
        builder = builder.prepared_statement(name.trim(), sql.trim());
    }

    Ok(builder.build())
}

fn single_header(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|value| Some(value.trim().to_string()))
            .map_err(|_| {
                CoordError::InvalidRequest(format!("{} header is not valid UTF-8", name))
            }),
    }
}

/// Durations on the wire read like `800ms`, `1.5s`, `2m`; a bare number
/// is seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, scale_ms) = if let Some(number) = value.strip_suffix("ms") {
        (number, 1.0)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, 1000.0)
    } else if let Some(number) = value.strip_suffix('m') {
        (number, 60_000.0)
    } else {
        (value, 1000.0)
    };
    let number: f64 = number.trim().parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some(Duration::from_millis((number * scale_ms) as u64))
}

/// Attach the query's accumulated session mutations as side-channel
/// headers on every statement response.
fn session_directive_headers(service: &CoordinatorService, query_id: &QueryId) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let handle = match service.streaming.registry().lookup(query_id) {
        Some(handle) => handle,
        None => return headers,
    };
    for (name, value) in handle.set_session_properties() {
        if let Ok(value) = HeaderValue::from_str(&format!("{}={}", name, value)) {
            headers.append(HeaderName::from_static(SET_SESSION_HEADER), value);
        }
    }
    for name in handle.reset_session_properties() {
        if let Ok(value) = HeaderValue::from_str(&name) {
            headers.append(HeaderName::from_static(CLEAR_SESSION_HEADER), value);
        }
    }
    headers
}

fn statement_response(service: &CoordinatorService, results: QueryResults) -> Response {
    match results.id.parse::<QueryId>() {
        Ok(query_id) => {
            let headers = session_directive_headers(service, &query_id);
            (StatusCode::OK, headers, Json(results)).into_response()
        }
        Err(_) => (StatusCode::OK, Json(results)).into_response(),
    }
}

async fn submit_statement(
    State(service): State<Arc<CoordinatorService>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session = match parse_session_headers(&headers) {
        Ok(session) => session,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    debug!(user = %session.user, "statement submitted");
    let results = service.streaming.submit(session, body);
    statement_response(&service, results)
}

#[derive(Debug, Deserialize)]
struct PollParams {
    #[serde(rename = "maxWait")]
    max_wait: Option<String>,
}

async fn poll_statement(
    State(service): State<Arc<CoordinatorService>>,
    Path((query_id, token)): Path<(String, u64)>,
    Query(params): Query<PollParams>,
) -> Response {
    let query_id: QueryId = match query_id.parse() {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let max_wait = params.max_wait.as_deref().and_then(parse_duration);
    match service.streaming.poll(&query_id, token, max_wait).await {
        Ok(results) => statement_response(&service, results),
        Err(PollError::Gone) => StatusCode::GONE.into_response(),
        Err(PollError::NotFound) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cancel_statement(
    State(service): State<Arc<CoordinatorService>>,
    Path((query_id, _token)): Path<(String, u64)>,
) -> Response {
    if let Ok(query_id) = query_id.parse::<QueryId>() {
        service.streaming.cancel(&query_id);
    }
    StatusCode::NO_CONTENT.into_response()
}

/// The blocking alternative: consume the streaming protocol internally
/// and return the whole result set in one document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    pub data: Vec<Vec<serde_json::Value>>,
    pub stats: StatementStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::QueryError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_count: Option<u64>,
}

async fn execute_statement(
    State(service): State<Arc<CoordinatorService>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session = match parse_session_headers(&headers) {
        Ok(session) => session,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut current = service.streaming.submit(session, body);
    let query_id: QueryId = match current.id.parse() {
        Ok(id) => id,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let mut columns = None;
    let mut data = Vec::new();
    while let Some(next) = &current.next_uri {
        let token = match next.rsplit('/').next().and_then(|t| t.parse::<u64>().ok()) {
            Some(token) => token,
            None => break,
        };
        current = match service.streaming.poll(&query_id, token, Some(MAX_WAIT)).await {
            Ok(results) => results,
            Err(_) => break,
        };
        if current.columns.is_some() {
            columns = current.columns.clone();
        }
        if let Some(rows) = &current.data {
            data.extend(rows.clone());
        }
    }

    let headers = session_directive_headers(&service, &query_id);
    let results = ExecuteResults {
        columns,
        data,
        stats: current.stats,
        error: current.error,
        update_type: current.update_type,
        update_count: current.update_count,
    };
    (StatusCode::OK, headers, Json(results)).into_response()
}

async fn list_queries(State(service): State<Arc<CoordinatorService>>) -> Json<Vec<BasicQueryInfo>> {
    Json(service.streaming.registry().infos())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryDetail {
    #[serde(flatten)]
    info: BasicQueryInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<crate::error::QueryError>,
}

async fn query_info(
    State(service): State<Arc<CoordinatorService>>,
    Path(query_id): Path<String>,
) -> Response {
    let query_id: QueryId = match query_id.parse() {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match service.streaming.registry().lookup(&query_id) {
        Some(handle) => Json(QueryDetail {
            info: handle.info(),
            error: handle.failure().map(|failure| failure.to_query_error()),
        })
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CoordinatorStatus {
    version: String,
    uptime_millis: u64,
    registered_queries: usize,
    streaming_queries: usize,
    queues: Vec<QueueSnapshot>,
    memory_pools: Vec<MemoryPoolInfo>,
}

async fn coordinator_status(
    State(service): State<Arc<CoordinatorService>>,
) -> Json<CoordinatorStatus> {
    let registry = service.streaming.registry();
    Json(CoordinatorStatus {
        version: crate::VERSION.to_string(),
        uptime_millis: service.started.elapsed().as_millis() as u64,
        registered_queries: registry.query_count(),
        streaming_queries: service.streaming.tracked_queries(),
        queues: registry.queue_manager().snapshot(),
        memory_pools: registry.memory_manager().pools(),
    })
}
