//! SQL statement classification.
//!
//! The coordinator does not analyze SQL beyond what it needs to route a
//! statement through the lifecycle: syntax validation via `sqlparser`,
//! the query/update distinction, the update-type label for DDL/DML, and
//! literal projections for statements the local execution collaborator
//! can evaluate itself. Everything deeper belongs to the (external)
//! analyzer and planner.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{SelectItem, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{ErrorCode, ExecutionFailure};

/// A statement reduced to what the coordinator core acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStatement {
    /// `SELECT <literals>` with no FROM clause; evaluated locally.
    LiteralSelect(Vec<LiteralColumn>),
    /// A SELECT that needs the distributed planner.
    DistributedSelect,
    ShowCatalogs,
    ShowSchemas,
    ShowSession,
    SetSession { name: String, value: String },
    ResetSession { name: String },
    /// DDL/DML; the label becomes the response `updateType`.
    Update { update_type: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralColumn {
    pub name: String,
    pub value: LiteralValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Bigint(i64),
    Double(f64),
    Varchar(String),
    Boolean(bool),
    Null,
}

impl LiteralValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            LiteralValue::Bigint(_) => "bigint",
            LiteralValue::Double(_) => "double",
            LiteralValue::Varchar(_) => "varchar",
            LiteralValue::Boolean(_) => "boolean",
            LiteralValue::Null => "unknown",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            LiteralValue::Bigint(v) => serde_json::json!(v),
            LiteralValue::Double(v) => serde_json::json!(v),
            LiteralValue::Varchar(v) => serde_json::json!(v),
            LiteralValue::Boolean(v) => serde_json::json!(v),
            LiteralValue::Null => serde_json::Value::Null,
        }
    }
}

static ERROR_POSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Line: (\d+), Column:? (\d+)").expect("static regex"));

pub struct StatementParser {
    dialect: GenericDialect,
}

impl Default for StatementParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementParser {
    pub fn new() -> Self {
        Self {
            dialect: GenericDialect {},
        }
    }

    /// Classify one statement. Syntax problems come back as a
    /// SYNTAX_ERROR failure ready to be recorded on the handle.
    pub fn parse(&self, sql: &str) -> Result<ParsedStatement, ExecutionFailure> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(ExecutionFailure::new(
                ErrorCode::SYNTAX_ERROR,
                "statement is empty",
            ));
        }

        // Metadata and session-control forms are dispatched on keywords;
        // dialects disagree on whether they are parseable at all.
        let upper = trimmed.to_uppercase();
        if upper == "SHOW CATALOGS" {
            return Ok(ParsedStatement::ShowCatalogs);
        }
        if upper == "SHOW SCHEMAS" {
            return Ok(ParsedStatement::ShowSchemas);
        }
        if upper == "SHOW SESSION" {
            return Ok(ParsedStatement::ShowSession);
        }
        if let Some(rest) = strip_keyword_prefix(trimmed, &["SET", "SESSION"]) {
            return parse_set_session(rest);
        }
        if let Some(rest) = strip_keyword_prefix(trimmed, &["RESET", "SESSION"]) {
            return parse_reset_session(rest);
        }

        let statements = Parser::parse_sql(&self.dialect, trimmed)
            .map_err(|e| syntax_failure(&e.to_string()))?;

        let statement = match statements.len() {
            0 => return Err(syntax_failure("statement is empty")),
            1 => &statements[0],
            _ => {
                return Err(ExecutionFailure::new(
                    ErrorCode::NOT_SUPPORTED,
                    "expected a single statement",
                ))
            }
        };

        match statement {
            Statement::Query(query) => Ok(classify_query(query)),
            _ => Ok(ParsedStatement::Update {
                update_type: update_type_label(&upper),
            }),
        }
    }
}

fn syntax_failure(message: &str) -> ExecutionFailure {
    let failure = ExecutionFailure::new(ErrorCode::SYNTAX_ERROR, message);
    if let Some(captures) = ERROR_POSITION.captures(message) {
        let line = captures[1].parse().unwrap_or(1);
        let column = captures[2].parse().unwrap_or(1);
        return failure.with_location(line, column);
    }
    failure
}

/// Strip a leading keyword sequence, case-insensitively. Returns the
/// remainder when every keyword matched in order.
fn strip_keyword_prefix<'a>(sql: &'a str, keywords: &[&str]) -> Option<&'a str> {
    let mut rest = sql;
    for keyword in keywords {
        let trimmed = rest.trim_start();
        let head = match trimmed.get(..keyword.len()) {
            Some(head) => head,
            None => return None,
        };
        if !head.eq_ignore_ascii_case(keyword) {
            return None;
        }
        let after = &trimmed[keyword.len()..];
        if !after.is_empty() && !after.starts_with(char::is_whitespace) {
            return None;
        }
        rest = after;
    }
    Some(rest.trim())
}

fn parse_set_session(rest: &str) -> Result<ParsedStatement, ExecutionFailure> {
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| syntax_failure("SET SESSION requires <name> = <value>"))?;
    let name = name.trim();
    let value = value.trim().trim_matches('\'');
    if name.is_empty() || value.is_empty() {
        return Err(syntax_failure("SET SESSION requires <name> = <value>"));
    }
    Ok(ParsedStatement::SetSession {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_reset_session(rest: &str) -> Result<ParsedStatement, ExecutionFailure> {
    let name = rest.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(syntax_failure("RESET SESSION requires a property name"));
    }
    Ok(ParsedStatement::ResetSession {
        name: name.to_string(),
    })
}

fn classify_query(query: &sqlparser::ast::Query) -> ParsedStatement {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return ParsedStatement::DistributedSelect,
    };
    if !select.from.is_empty() {
        return ParsedStatement::DistributedSelect;
    }

    let mut columns = Vec::with_capacity(select.projection.len());
    for (index, item) in select.projection.iter().enumerate() {
        let (name, expr_text) = match item {
            SelectItem::UnnamedExpr(expr) => (format!("_col{}", index), expr.to_string()),
            SelectItem::ExprWithAlias { expr, alias } => (alias.value.clone(), expr.to_string()),
            _ => return ParsedStatement::DistributedSelect,
        };
        match parse_literal(&expr_text) {
            Some(value) => columns.push(LiteralColumn { name, value }),
            None => return ParsedStatement::DistributedSelect,
        }
    }
    ParsedStatement::LiteralSelect(columns)
}

/// Interpret the rendered form of a projection expression as a literal.
fn parse_literal(text: &str) -> Option<LiteralValue> {
    if text.eq_ignore_ascii_case("NULL") {
        return Some(LiteralValue::Null);
    }
    if text.eq_ignore_ascii_case("TRUE") {
        return Some(LiteralValue::Boolean(true));
    }
    if text.eq_ignore_ascii_case("FALSE") {
        return Some(LiteralValue::Boolean(false));
    }
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Some(LiteralValue::Varchar(
            text[1..text.len() - 1].replace("''", "'"),
        ));
    }
    if let Ok(v) = text.parse::<i64>() {
        return Some(LiteralValue::Bigint(v));
    }
    if let Ok(v) = text.parse::<f64>() {
        return Some(LiteralValue::Double(v));
    }
    None
}

fn update_type_label(upper_sql: &str) -> String {
    const LABELS: &[&str] = &[
        "CREATE TABLE",
        "CREATE VIEW",
        "CREATE SCHEMA",
        "CREATE INDEX",
        "DROP TABLE",
        "DROP VIEW",
        "DROP SCHEMA",
        "ALTER TABLE",
        "INSERT",
        "UPDATE",
        "DELETE",
        "TRUNCATE",
    ];
    for label in LABELS {
        if upper_sql.starts_with(label) {
            return (*label).to_string();
        }
    }
    upper_sql
        .split_whitespace()
        .next()
        .unwrap_or("UPDATE")
        .to_string()
}
