//! Client session captured at statement submission.
//!
//! A [`Session`] is an immutable snapshot for the lifetime of a query:
//! identity, catalog/schema context, locale settings, and the property
//! maps (system properties plus per-connector overrides). Queries that
//! want to mutate session state do so through set/reset directives on
//! their handle, which the protocol layer relays to the client; the
//! client folds them into the headers of its next submission.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user: String,
    pub source: Option<String>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub time_zone: String,
    pub language: Option<String>,
    /// Engine-level properties, e.g. `execution_delay`.
    pub system_properties: HashMap<String, String>,
    /// Connector overrides keyed by catalog name; addressed on the wire
    /// as `catalog.property=value`.
    pub catalog_properties: HashMap<String, HashMap<String, String>>,
    pub prepared_statements: HashMap<String, String>,
    pub start_time: DateTime<Utc>,
}

impl Session {
    pub fn builder(user: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(user)
    }

    pub fn system_property(&self, name: &str) -> Option<&str> {
        self.system_properties.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SessionBuilder {
    user: String,
    source: Option<String>,
    catalog: Option<String>,
    schema: Option<String>,
    time_zone: Option<String>,
    language: Option<String>,
    system_properties: HashMap<String, String>,
    catalog_properties: HashMap<String, HashMap<String, String>>,
    prepared_statements: HashMap<String, String>,
}

impl SessionBuilder {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            source: None,
            catalog: None,
            schema: None,
            time_zone: None,
            language: None,
            system_properties: HashMap::new(),
            catalog_properties: HashMap::new(),
            prepared_statements: HashMap::new(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = Some(time_zone.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set a property by its wire name: a bare name is a system
    /// property, `catalog.name` is a connector override.
    pub fn property(mut self, name: &str, value: impl Into<String>) -> Self {
        match name.split_once('.') {
            Some((catalog, property)) if !catalog.is_empty() && !property.is_empty() => {
                self.catalog_properties
                    .entry(catalog.to_string())
                    .or_default()
                    .insert(property.to_string(), value.into());
            }
            _ => {
                self.system_properties.insert(name.to_string(), value.into());
            }
        }
        self
    }

    pub fn prepared_statement(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.prepared_statements.insert(name.into(), sql.into());
        self
    }

    pub fn build(self) -> Session {
        Session {
            user: self.user,
            source: self.source,
            catalog: self.catalog,
            schema: self.schema,
            time_zone: self.time_zone.unwrap_or_else(|| "UTC".to_string()),
            language: self.language,
            system_properties: self.system_properties,
            catalog_properties: self.catalog_properties,
            prepared_statements: self.prepared_statements,
            start_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let session = Session::builder("alice").build();
        assert_eq!(session.user, "alice");
        assert_eq!(session.time_zone, "UTC");
        assert!(session.catalog.is_none());
        assert!(session.system_properties.is_empty());
    }

    #[test]
    fn test_property_routing() {
        let session = Session::builder("alice")
            .property("hive.cache_enabled", "false")
            .property("distributed_joins", "true")
            .build();

        // A dotted name routes to the catalog override map.
        assert_eq!(
            session.catalog_properties["hive"]["cache_enabled"],
            "false"
        );
        assert_eq!(session.system_property("distributed_joins"), Some("true"));
    }

    #[test]
    fn test_prepared_statements_carried() {
        let session = Session::builder("alice")
            .prepared_statement("q1", "SELECT 1")
            .build();
        assert_eq!(session.prepared_statements["q1"], "SELECT 1");
    }
}
