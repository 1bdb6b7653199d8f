//! External id → target page id resolution.

use std::collections::{BTreeMap, HashMap, HashSet};

use ghsync_core::PropertyType;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::coerce::parse_number;
use crate::target::{page_id_of, TargetApi, TargetError};

/// Known `external id → page id` mappings for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageIndex {
    pages: HashMap<String, String>,
}

impl PageIndex {
    pub fn get(&self, external_id: &str) -> Option<&str> {
        self.pages.get(external_id).map(String::as_str)
    }

    pub fn insert(&mut self, external_id: impl Into<String>, page_id: impl Into<String>) {
        self.pages.insert(external_id.into(), page_id.into());
    }

    pub fn remove(&mut self, external_id: &str) -> Option<String> {
        self.pages.remove(external_id)
    }

    pub fn to_sorted(&self) -> BTreeMap<String, String> {
        self.pages.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// How an external id is looked up for a given identifier property type.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityFilter {
    /// Server-side equality filter.
    Query(JsonValue),
    /// The id cannot possibly be stored in this property; no remote call needed.
    NoMatch,
    /// No equality filter exists for this type; fall back to scanning the database.
    Unfilterable,
}

impl IdentityFilter {
    pub fn for_property(property: &str, kind: &PropertyType, external_id: &str) -> Self {
        match kind {
            PropertyType::RichText => {
                Self::Query(json!({ "property": property, "rich_text": { "equals": external_id } }))
            }
            PropertyType::Title => {
                Self::Query(json!({ "property": property, "title": { "equals": external_id } }))
            }
            PropertyType::Url => {
                Self::Query(json!({ "property": property, "url": { "equals": external_id } }))
            }
            PropertyType::Number => match parse_number(external_id) {
                Some(number) => {
                    Self::Query(json!({ "property": property, "number": { "equals": number } }))
                }
                None => Self::NoMatch,
            },
            _ => Self::Unfilterable,
        }
    }
}

/// Resolves external ids against one database, remembering every page it
/// finds or creates for the rest of the run.
#[derive(Debug)]
pub struct IdentityResolver {
    database_id: String,
    property: String,
    property_type: PropertyType,
    index: PageIndex,
    scanned: bool,
}

impl IdentityResolver {
    pub fn new(
        database_id: impl Into<String>,
        property: impl Into<String>,
        property_type: PropertyType,
        index: PageIndex,
    ) -> Self {
        Self {
            database_id: database_id.into(),
            property: property.into(),
            property_type,
            index,
            scanned: false,
        }
    }

    pub async fn resolve(
        &mut self,
        api: &dyn TargetApi,
        external_id: &str,
    ) -> Result<Option<String>, TargetError> {
        if let Some(page_id) = self.index.get(external_id) {
            return Ok(Some(page_id.to_string()));
        }

        match IdentityFilter::for_property(&self.property, &self.property_type, external_id) {
            IdentityFilter::NoMatch => {
                debug!(external_id, property = %self.property, "id cannot match property type");
                Ok(None)
            }
            IdentityFilter::Query(filter) => {
                let page = api
                    .query_database(&self.database_id, Some(filter), None)
                    .await?;
                let mut found = page.results.iter().filter_map(page_id_of);
                let Some(first) = found.next() else {
                    return Ok(None);
                };
                let others = found.count();
                if others > 0 {
                    warn!(
                        external_id,
                        database_id = %self.database_id,
                        matches = others + 1,
                        "ambiguous identity; updating the first match"
                    );
                }
                let first = first.to_string();
                self.index.insert(external_id, first.clone());
                Ok(Some(first))
            }
            IdentityFilter::Unfilterable => {
                if !self.scanned {
                    self.scan(api).await?;
                }
                Ok(self.index.get(external_id).map(str::to_string))
            }
        }
    }

    /// Whether `external_id` resolves without a remote call.
    pub fn is_known(&self, external_id: &str) -> bool {
        self.index.get(external_id).is_some()
    }

    pub fn remember(&mut self, external_id: &str, page_id: &str) {
        self.index.insert(external_id, page_id);
    }

    /// Drop a mapping whose page turned out to be gone.
    pub fn forget(&mut self, external_id: &str) {
        if let Some(page_id) = self.index.remove(external_id) {
            debug!(external_id, %page_id, "evicted stale page index entry");
        }
    }

    pub fn into_index(self) -> PageIndex {
        self.index
    }

    /// Page through the whole database once, indexing every page by the value
    /// of the identifier property.
    async fn scan(&mut self, api: &dyn TargetApi) -> Result<(), TargetError> {
        let mut cursor = None;
        let mut pages = 0usize;
        let mut seen = HashSet::new();
        loop {
            let batch = api.query_database(&self.database_id, None, cursor).await?;
            for page in &batch.results {
                let (Some(page_id), Some(value)) = (
                    page_id_of(page),
                    page.get("properties")
                        .and_then(|p| p.get(&self.property))
                        .and_then(identifier_value),
                ) else {
                    continue;
                };
                pages += 1;
                // live pages replace persisted entries; duplicates keep the first
                if seen.insert(value.clone()) {
                    self.index.insert(value, page_id);
                }
            }
            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        self.scanned = true;
        info!(
            database_id = %self.database_id,
            property = %self.property,
            pages,
            "indexed database by scanning"
        );
        Ok(())
    }
}

/// Plain string value of a page property as Notion returns it.
fn identifier_value(property: &JsonValue) -> Option<String> {
    let kind = property.get("type").and_then(JsonValue::as_str)?;
    let value = property.get(kind)?;
    let text = match kind {
        "title" | "rich_text" => value.as_array().map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| {
                    b.get("plain_text")
                        .or_else(|| b.get("text").and_then(|t| t.get("content")))
                        .and_then(JsonValue::as_str)
                })
                .collect::<String>()
        }),
        "number" => value.as_number().map(ToString::to_string),
        "url" => value.as_str().map(str::to_string),
        "select" => value.get("name").and_then(JsonValue::as_str).map(str::to_string),
        "formula" => match value.get("type").and_then(JsonValue::as_str) {
            Some("string") => value.get("string").and_then(JsonValue::as_str).map(str::to_string),
            Some("number") => value
                .get("number")
                .and_then(JsonValue::as_number)
                .map(ToString::to_string),
            _ => None,
        },
        "unique_id" => {
            let number = value.get("number").and_then(JsonValue::as_i64)?;
            Some(match value.get("prefix").and_then(JsonValue::as_str) {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}-{number}"),
                _ => number.to_string(),
            })
        }
        _ => None,
    };
    text.filter(|t| !t.is_empty())
}
