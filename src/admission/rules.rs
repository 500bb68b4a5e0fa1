//! Admission routing rules.
//!
//! Rules are evaluated in declaration order; the first rule whose user
//! regex, source regex, and every session-property regex match wins and
//! names the ordered queue chain the query enters (outermost first).
//! Patterns are anchored: they must match the whole value.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::admission::queue::QueryQueue;
use crate::error::{CoordError, Result};
use crate::session::Session;

/// On-disk shape of `query.queue-config-file`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfigFile {
    pub queues: HashMap<String, QueueSpec>,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    pub max_concurrent: usize,
    pub max_queued: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub session: HashMap<String, String>,
    pub queues: Vec<String>,
}

impl QueueConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CoordError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// A single permissive queue for coordinators with no queue file.
    pub fn permissive() -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            "global".to_string(),
            QueueSpec {
                max_concurrent: 1000,
                max_queued: 5000,
            },
        );
        Self {
            queues,
            rules: vec![RuleSpec {
                user: None,
                source: None,
                session: HashMap::new(),
                queues: vec!["global".to_string()],
            }],
        }
    }
}

#[derive(Debug)]
pub struct QueueRule {
    user: Option<Regex>,
    source: Option<Regex>,
    session: Vec<(String, Regex)>,
    queues: Vec<Arc<QueryQueue>>,
}

impl QueueRule {
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(user) = &self.user {
            if !user.is_match(&session.user) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            match &session.source {
                Some(value) if source.is_match(value) => {}
                _ => return false,
            }
        }
        for (name, pattern) in &self.session {
            match session.system_property(name) {
                Some(value) if pattern.is_match(value) => {}
                _ => return false,
            }
        }
        true
    }

    pub fn queues(&self) -> &[Arc<QueryQueue>] {
        &self.queues
    }
}

/// Build shared queues and compiled rules, failing fast on a rule that
/// references an undefined queue, an empty queue list, or a bad regex.
pub fn build_rules(
    config: &QueueConfigFile,
) -> Result<(HashMap<String, Arc<QueryQueue>>, Vec<QueueRule>)> {
    let mut queues = HashMap::new();
    for (name, spec) in &config.queues {
        if spec.max_concurrent == 0 {
            return Err(CoordError::Configuration(format!(
                "queue {} has maxConcurrent 0",
                name
            )));
        }
        queues.insert(
            name.clone(),
            QueryQueue::new(name.clone(), spec.max_queued, spec.max_concurrent),
        );
    }

    let mut rules = Vec::with_capacity(config.rules.len());
    for (index, spec) in config.rules.iter().enumerate() {
        if spec.queues.is_empty() {
            return Err(CoordError::Configuration(format!(
                "rule {} names no queues",
                index
            )));
        }
        let mut rule_queues = Vec::with_capacity(spec.queues.len());
        for name in &spec.queues {
            let queue = queues.get(name).ok_or_else(|| {
                CoordError::Configuration(format!(
                    "rule {} references undefined queue {}",
                    index, name
                ))
            })?;
            rule_queues.push(queue.clone());
        }
        let mut session = Vec::with_capacity(spec.session.len());
        for (name, pattern) in &spec.session {
            let regex = anchored(pattern).map_err(|e| {
                CoordError::Configuration(format!("rule {} has bad {} regex: {}", index, name, e))
            })?;
            session.push((name.clone(), regex));
        }
        rules.push(QueueRule {
            user: compile(index, "user", spec.user.as_deref())?,
            source: compile(index, "source", spec.source.as_deref())?,
            session,
            queues: rule_queues,
        });
    }
    Ok((queues, rules))
}

fn compile(rule: usize, field: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None => Ok(None),
        Some(pattern) => anchored(pattern).map(Some).map_err(|e| {
            CoordError::Configuration(format!("rule {} has bad {} regex: {}", rule, field, e))
        }),
    }
}

fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> QueueConfigFile {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_build_and_match() {
        let config = config(
            r#"{
                "queues": {
                    "admin": {"maxConcurrent": 10, "maxQueued": 10},
                    "global": {"maxConcurrent": 2, "maxQueued": 5}
                },
                "rules": [
                    {"user": "admin", "queues": ["admin"]},
                    {"source": "etl-.*", "session": {"pipeline": "nightly"}, "queues": ["global", "admin"]},
                    {"queues": ["global"]}
                ]
            }"#,
        );
        let (queues, rules) = build_rules(&config).unwrap();
        assert_eq!(queues.len(), 2);
        assert_eq!(rules.len(), 3);

        let admin = Session::builder("admin").build();
        assert!(rules[0].matches(&admin));

        // "admin2" must not match the anchored user regex.
        let admin2 = Session::builder("admin2").build();
        assert!(!rules[0].matches(&admin2));
        assert!(rules[2].matches(&admin2));

        let etl = Session::builder("bob")
            .source("etl-orders")
            .property("pipeline", "nightly")
            .build();
        assert!(!rules[0].matches(&etl));
        assert!(rules[1].matches(&etl));

        // Missing session property means no match.
        let plain = Session::builder("bob").source("etl-orders").build();
        assert!(!rules[1].matches(&plain));
        assert!(rules[2].matches(&plain));
    }

    #[tokio::test]
    async fn test_undefined_queue_fails_fast() {
        let config = config(
            r#"{
                "queues": {"global": {"maxConcurrent": 1, "maxQueued": 1}},
                "rules": [{"queues": ["missing"]}]
            }"#,
        );
        let err = build_rules(&config).unwrap_err();
        assert!(err.to_string().contains("undefined queue"));
    }

    #[tokio::test]
    async fn test_empty_queue_list_fails_fast() {
        let config = config(
            r#"{
                "queues": {"global": {"maxConcurrent": 1, "maxQueued": 1}},
                "rules": [{"queues": []}]
            }"#,
        );
        assert!(build_rules(&config).is_err());
    }

    #[tokio::test]
    async fn test_bad_regex_fails_fast() {
        let config = config(
            r#"{
                "queues": {"global": {"maxConcurrent": 1, "maxQueued": 1}},
                "rules": [{"user": "(", "queues": ["global"]}]
            }"#,
        );
        assert!(build_rules(&config).is_err());
    }

    #[tokio::test]
    async fn test_permissive_default() {
        let (queues, rules) = build_rules(&QueueConfigFile::permissive()).unwrap();
        assert!(queues.contains_key("global"));
        assert!(rules[0].matches(&Session::builder("anyone").build()));
    }
}
