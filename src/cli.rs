//! # QuarryDB CLI
//!
//! Submits one statement to a coordinator, follows the streaming
//! protocol until the terminal response, and prints the rows.
//! Exits 0 on success, 1 on any failure.

use std::io::Read;
use std::process::ExitCode;

use quarry_db::protocol::QueryResults;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (server, sql) = match parse_args(args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("usage: quarrydb-cli [--server URL] [SQL]");
            return ExitCode::FAILURE;
        }
    };

    match run_statement(&server, &sql).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<(String, String), String> {
    let mut server = DEFAULT_SERVER.to_string();
    let mut sql_parts = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--server" {
            server = iter.next().ok_or("--server requires a URL")?;
        } else {
            sql_parts.push(arg);
        }
    }

    let sql = if sql_parts.is_empty() {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("failed to read stdin: {}", e))?;
        buffer
    } else {
        sql_parts.join(" ")
    };
    if sql.trim().is_empty() {
        return Err("no SQL statement given".to_string());
    }
    Ok((server, sql))
}

async fn run_statement(server: &str, sql: &str) -> Result<(), String> {
    let client = reqwest::Client::new();
    let user = std::env::var("USER").unwrap_or_else(|_| "quarry".to_string());

    let response = client
        .post(format!("{}/v1/statement", server))
        .header("X-USER", user)
        .header("X-SOURCE", "quarrydb-cli")
        .body(sql.to_string())
        .send()
        .await
        .map_err(|e| format!("submission failed: {}", e))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("submission rejected ({}): {}", status, body));
    }
    let mut results: QueryResults = response
        .json()
        .await
        .map_err(|e| format!("malformed response: {}", e))?;

    let mut header_printed = false;
    loop {
        if let (false, Some(columns)) = (header_printed, &results.columns) {
            let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            println!("{}", names.join("\t"));
            header_printed = true;
        }
        if let Some(rows) = &results.data {
            for row in rows {
                let rendered: Vec<String> = row.iter().map(render_value).collect();
                println!("{}", rendered.join("\t"));
            }
        }
        if let Some(error) = &results.error {
            return Err(format!("query failed: {} ({})", error.message, error.error_name));
        }

        let next = match &results.next_uri {
            Some(next) => next.clone(),
            None => return Ok(()),
        };
        results = client
            .get(format!("{}{}?maxWait=1s", server, next))
            .send()
            .await
            .map_err(|e| format!("poll failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("malformed response: {}", e))?;
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
