//! Local execution collaborator.
//!
//! Stands in for the distributed planner/scheduler/worker fleet: drives
//! a started query through PLANNING → STARTING → RUNNING, evaluates the
//! statement forms the coordinator can answer by itself (literal
//! SELECTs, SHOW metadata, session control, DDL labels), and publishes
//! result pages into the query's exchange. Anything that needs a real
//! worker fleet fails with NOT_SUPPORTED.
//!
//! The `execution_delay` session property (milliseconds) holds a query
//! in RUNNING before it produces results, which is how long-running
//! work is simulated.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::admission::queue::QueryStarter;
use crate::error::{ErrorCode, ExecutionFailure};
use crate::exchange::{LocalExchangeClient, Page};
use crate::parser::{LiteralColumn, ParsedStatement, StatementParser};
use crate::query::{OutputColumn, QueryHandle, QueryOutput, TaskOutput};

const ROWS_PER_PAGE: usize = 1024;

pub const EXECUTION_DELAY_PROPERTY: &str = "execution_delay";

pub struct LocalExecutionFactory {
    catalogs: Vec<String>,
}

impl LocalExecutionFactory {
    pub fn new() -> Arc<Self> {
        Self::with_catalogs(vec!["system".to_string()])
    }

    pub fn with_catalogs(catalogs: Vec<String>) -> Arc<Self> {
        Arc::new(Self { catalogs })
    }
}

impl QueryStarter for LocalExecutionFactory {
    fn start(&self, handle: Arc<QueryHandle>) {
        let catalogs = self.catalogs.clone();
        tokio::spawn(async move {
            run_query(handle, catalogs).await;
        });
    }
}

async fn run_query(handle: Arc<QueryHandle>, catalogs: Vec<String>) {
    if !handle.state_machine().transition_to_planning() {
        return;
    }

    let statement = match StatementParser::new().parse(handle.sql()) {
        Ok(statement) => statement,
        Err(failure) => {
            handle.fail(failure);
            return;
        }
    };

    // Decide the output shape during planning.
    let result = match plan(&handle, &statement, &catalogs) {
        Ok(result) => result,
        Err(failure) => {
            handle.fail(failure);
            return;
        }
    };

    let output = match &result {
        Planned::Rows { columns, .. } => {
            let exchange = Arc::new(LocalExchangeClient::default());
            let task = TaskOutput::new(format!("local://{}/0/0", handle.query_id()));
            handle.set_output(QueryOutput {
                columns: columns.clone(),
                tasks: vec![task.clone()],
                exchange: exchange.clone(),
            });
            handle.set_total_drivers(1);
            Some((exchange, task))
        }
        Planned::NoOutput => None,
    };

    if !handle.state_machine().transition_to_starting() {
        return;
    }
    if !handle.state_machine().transition_to_running() {
        return;
    }

    let delay = execution_delay(&handle);
    if !delay.is_zero() && !delay_or_done(&handle, delay).await {
        debug!(query_id = %handle.query_id(), "query ended during simulated execution");
        return;
    }

    if let Planned::Rows { rows, .. } = result {
        let (exchange, task) = match output {
            Some(output) => output,
            None => return,
        };
        let mut published_rows = 0u64;
        let mut published_bytes = 0u64;
        for chunk in rows.chunks(ROWS_PER_PAGE) {
            let page = Page::new(chunk.to_vec());
            published_rows += page.row_count() as u64;
            published_bytes += page.size_bytes as u64;
            handle.update_memory_reservation(page.size_bytes as u64);
            if !exchange.publish(page).await {
                // Exchange closed under us: the query was canceled or
                // failed; nothing more to do.
                return;
            }
        }
        handle.add_processed(published_rows, published_bytes);
        exchange.finish();
        task.finalize();
        handle.add_completed_driver();
    }

    handle.update_memory_reservation(0);
    handle.state_machine().transition_to_finished();
}

enum Planned {
    Rows {
        columns: Vec<OutputColumn>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    NoOutput,
}

fn plan(
    handle: &Arc<QueryHandle>,
    statement: &ParsedStatement,
    catalogs: &[String],
) -> Result<Planned, ExecutionFailure> {
    match statement {
        ParsedStatement::LiteralSelect(columns) => Ok(literal_result(columns)),
        ParsedStatement::ShowCatalogs => Ok(Planned::Rows {
            columns: vec![varchar_column("Catalog")],
            rows: catalogs
                .iter()
                .map(|name| vec![serde_json::json!(name)])
                .collect(),
        }),
        ParsedStatement::ShowSchemas => Ok(Planned::Rows {
            columns: vec![varchar_column("Schema")],
            rows: vec![
                vec![serde_json::json!("information_schema")],
                vec![serde_json::json!("runtime")],
            ],
        }),
        ParsedStatement::ShowSession => {
            let mut properties: Vec<(&String, &String)> =
                handle.session().system_properties.iter().collect();
            properties.sort();
            Ok(Planned::Rows {
                columns: vec![varchar_column("Name"), varchar_column("Value")],
                rows: properties
                    .into_iter()
                    .map(|(name, value)| {
                        vec![serde_json::json!(name), serde_json::json!(value)]
                    })
                    .collect(),
            })
        }
        ParsedStatement::SetSession { name, value } => {
            handle.add_set_session_property(name.clone(), value.clone());
            handle.set_update_type("SET SESSION");
            Ok(Planned::NoOutput)
        }
        ParsedStatement::ResetSession { name } => {
            handle.add_reset_session_property(name.clone());
            handle.set_update_type("RESET SESSION");
            Ok(Planned::NoOutput)
        }
        ParsedStatement::Update { update_type } => {
            handle.set_update_type(update_type.clone());
            handle.set_update_count(0);
            Ok(Planned::NoOutput)
        }
        ParsedStatement::DistributedSelect => Err(ExecutionFailure::new(
            ErrorCode::NOT_SUPPORTED,
            "Table scans require a worker fleet; only literal queries and \
             metadata statements run on the coordinator",
        )),
    }
}

fn literal_result(columns: &[LiteralColumn]) -> Planned {
    Planned::Rows {
        columns: columns
            .iter()
            .map(|column| OutputColumn {
                name: column.name.clone(),
                type_name: column.value.type_name().to_string(),
            })
            .collect(),
        rows: vec![columns.iter().map(|c| c.value.to_json()).collect()],
    }
}

fn varchar_column(name: &str) -> OutputColumn {
    OutputColumn {
        name: name.to_string(),
        type_name: "varchar".to_string(),
    }
}

fn execution_delay(handle: &Arc<QueryHandle>) -> Duration {
    handle
        .session()
        .system_property(EXECUTION_DELAY_PROPERTY)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

/// Sleep `delay`, waking early if the query reaches a done state.
/// Returns false when the query ended first.
async fn delay_or_done(handle: &Arc<QueryHandle>, delay: Duration) -> bool {
    let mut state_rx = handle.state_machine().subscribe();
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        if state_rx.borrow_and_update().is_done() {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return true,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}
