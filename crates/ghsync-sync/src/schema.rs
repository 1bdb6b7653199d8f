//! Target schema introspection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ghsync_core::{PropertySchema, PropertyType, TargetSchema};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info};

use crate::target::{TargetApi, TargetError};

const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Error)]
pub enum SchemaUnavailableError {
    #[error("cannot read database {database_id}: {source}")]
    Unreadable {
        database_id: String,
        #[source]
        source: TargetError,
    },
    #[error("database {0} has no property map")]
    Malformed(String),
    #[error("database {0} has no title property")]
    NoTitleProperty(String),
}

/// Build a [`TargetSchema`] from a `GET /databases/{id}` response.
pub fn parse_schema(database_id: &str, raw: &JsonValue) -> Result<TargetSchema, SchemaUnavailableError> {
    let properties = raw
        .get("properties")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| SchemaUnavailableError::Malformed(database_id.to_string()))?;

    let mut parsed = BTreeMap::new();
    for (name, definition) in properties {
        let Some(wire_type) = definition.get("type").and_then(JsonValue::as_str) else {
            debug!(property = %name, "property without a type; ignoring");
            continue;
        };
        let kind = PropertyType::from_wire(wire_type);
        let options = match kind {
            PropertyType::Select | PropertyType::Status | PropertyType::MultiSelect => {
                option_names(definition, wire_type)
            }
            _ => Vec::new(),
        };
        parsed.insert(name.clone(), PropertySchema { kind, options });
    }

    TargetSchema::from_properties(database_id, parsed)
        .ok_or_else(|| SchemaUnavailableError::NoTitleProperty(database_id.to_string()))
}

fn option_names(definition: &JsonValue, wire_type: &str) -> Vec<String> {
    definition
        .get(wire_type)
        .and_then(|d| d.get("options"))
        .and_then(JsonValue::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|o| o.get("name").and_then(JsonValue::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Schemas fetched during one run, keyed by database id. Never refreshed.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: HashMap<String, Arc<TargetSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &mut self,
        api: &dyn TargetApi,
        database_id: &str,
    ) -> Result<Arc<TargetSchema>, SchemaUnavailableError> {
        if let Some(schema) = self.entries.get(database_id) {
            return Ok(Arc::clone(schema));
        }

        let raw = api
            .retrieve_database(database_id)
            .await
            .map_err(|source| SchemaUnavailableError::Unreadable {
                database_id: database_id.to_string(),
                source,
            })?;
        let schema = Arc::new(parse_schema(database_id, &raw)?);
        info!(
            database_id,
            properties = schema.len(),
            title = schema.title_property(),
            "loaded target schema"
        );
        self.entries.insert(database_id.to_string(), Arc::clone(&schema));
        Ok(schema)
    }
}

/// Closest property name by Jaro-Winkler similarity, if any is close enough.
pub fn closest_property<'a>(schema: &'a TargetSchema, wanted: &str) -> Option<&'a str> {
    let wanted = wanted.to_lowercase();
    schema
        .property_names()
        .map(|name| (name, jaro_winkler(&wanted, &name.to_lowercase())))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(name, _)| name)
}

pub fn suggestion_suffix(schema: &TargetSchema, wanted: &str) -> String {
    closest_property(schema, wanted)
        .map(|name| format!(" (did you mean `{name}`?)"))
        .unwrap_or_default()
}
