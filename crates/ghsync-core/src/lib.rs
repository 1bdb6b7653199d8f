//! Core domain model for GitHub → Notion reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghsync-core";

/// Character limit applied to bodies and descriptions when a record is normalized.
pub const BODY_LIMIT: usize = 1900;
/// Character limit of a single Notion title/rich_text content block.
pub const TEXT_LIMIT: usize = 2000;
/// Character limit of a select/multi-select option name.
pub const OPTION_NAME_LIMIT: usize = 100;
pub const TRUNCATION_MARKER: &str = "...";

/// Truncate `value` to at most `limit` characters, appending [`TRUNCATION_MARKER`]
/// when anything was cut. The output never exceeds `limit`, so a second pass is a no-op.
pub fn truncate_text(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let keep = limit.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = value.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    PullRequest,
    Milestone,
    Project,
    WorkflowRun,
    Discussion,
    Repository,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::PullRequest => "pull_request",
            Self::Milestone => "milestone",
            Self::Project => "project",
            Self::WorkflowRun => "workflow_run",
            Self::Discussion => "discussion",
            Self::Repository => "repository",
        }
    }

    /// Human label used for the `Type` column and title fallbacks.
    pub fn label(self) -> &'static str {
        match self {
            Self::Issue => "Issue",
            Self::PullRequest => "Pull Request",
            Self::Milestone => "Milestone",
            Self::Project => "Project",
            Self::WorkflowRun => "Workflow Run",
            Self::Discussion => "Discussion",
            Self::Repository => "Repository",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named moment in a record's lifecycle. A missing key means "not applicable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Moment {
    Created,
    Updated,
    Closed,
    Merged,
    Due,
    Started,
    Pushed,
}

impl Moment {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "closed" => Some(Self::Closed),
            "merged" => Some(Self::Merged),
            "due" => Some(Self::Due),
            "started" => Some(Self::Started),
            "pushed" => Some(Self::Pushed),
            _ => None,
        }
    }
}

/// Canonical in-memory representation of one source record to be mirrored.
///
/// Built fresh from one source API record per pass and never mutated after the
/// normalizer hands it over; `external_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntity {
    pub external_id: String,
    pub kind: EntityKind,
    pub title: String,
    pub status: Option<String>,
    pub tags: Vec<String>,
    pub url: Option<String>,
    pub people: Vec<String>,
    pub timestamps: BTreeMap<Moment, String>,
    pub extra: BTreeMap<String, JsonValue>,
}

impl NormalizedEntity {
    pub fn new(kind: EntityKind, external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            kind,
            title: title.into(),
            status: None,
            tags: Vec::new(),
            url: None,
            people: Vec::new(),
            timestamps: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// Replace tags, dropping blanks and duplicates while keeping first-seen order.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = dedup_non_empty(tags);
        self
    }

    pub fn with_people<I, S>(mut self, people: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.people = dedup_non_empty(people);
        self
    }

    pub fn with_moment(mut self, moment: Moment, value: Option<String>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.timestamps.insert(moment, value);
        }
        self
    }

    pub fn with_extra(mut self, key: &str, value: JsonValue) -> Self {
        if !value.is_null() {
            self.extra.insert(key.to_string(), value);
        }
        self
    }

    pub fn moment(&self, moment: Moment) -> Option<&str> {
        self.timestamps.get(&moment).map(String::as_str)
    }
}

fn dedup_non_empty<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.into().trim().to_string();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

/// Declared type of a target database property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Title,
    RichText,
    Select,
    Status,
    MultiSelect,
    Url,
    Number,
    Date,
    People,
    Relation,
    Other(String),
}

impl PropertyType {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "title" => Self::Title,
            "rich_text" => Self::RichText,
            "select" => Self::Select,
            "status" => Self::Status,
            "multi_select" => Self::MultiSelect,
            "url" => Self::Url,
            "number" => Self::Number,
            "date" => Self::Date,
            "people" => Self::People,
            "relation" => Self::Relation,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::Title => "title",
            Self::RichText => "rich_text",
            Self::Select => "select",
            Self::Status => "status",
            Self::MultiSelect => "multi_select",
            Self::Url => "url",
            Self::Number => "number",
            Self::Date => "date",
            Self::People => "people",
            Self::Relation => "relation",
            Self::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    pub kind: PropertyType,
    /// Allowed option names for select/status/multi_select; empty means unrestricted.
    #[serde(default)]
    pub options: Vec<String>,
}

impl PropertySchema {
    pub fn of(kind: PropertyType) -> Self {
        Self {
            kind,
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(kind: PropertyType, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows_option(&self, name: &str) -> bool {
        self.options.is_empty() || self.options.iter().any(|o| o == name)
    }
}

/// Introspected property schema of one target database. Read-only for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSchema {
    pub database_id: String,
    title_property: String,
    properties: BTreeMap<String, PropertySchema>,
}

impl TargetSchema {
    /// Returns `None` when no title-typed property exists.
    pub fn from_properties(
        database_id: impl Into<String>,
        properties: BTreeMap<String, PropertySchema>,
    ) -> Option<Self> {
        let title_property = properties
            .iter()
            .find(|(_, schema)| schema.kind == PropertyType::Title)
            .map(|(name, _)| name.clone())?;
        Some(Self {
            database_id: database_id.into(),
            title_property,
            properties,
        })
    }

    pub fn title_property(&self) -> &str {
        &self.title_property
    }

    pub fn get(&self, name: &str) -> Option<&PropertySchema> {
        self.properties.get(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DryRun,
    EmptyProperties,
}

/// Terminal outcome of reconciling one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Created { page_id: String },
    Updated { page_id: String },
    Skipped { reason: SkipReason },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub identifier: String,
    pub message: String,
}

/// Aggregate outcome of one reconciliation run. Append-only while the run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub run_id: Uuid,
    pub database_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}

impl ReconciliationSummary {
    pub fn new(database_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            database_id: database_id.into(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, identifier: &str, outcome: &ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Created { .. } => self.created += 1,
            ItemOutcome::Updated { .. } => self.updated += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Failed { message } => {
                self.failed += 1;
                self.failures.push(ItemFailure {
                    identifier: identifier.to_string(),
                    message: message.clone(),
                });
            }
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncation_is_applied_once() {
        let long = "x".repeat(2500);
        let once = truncate_text(&long, TEXT_LIMIT);
        assert_eq!(once.chars().count(), TEXT_LIMIT);
        assert!(once.ends_with(TRUNCATION_MARKER));
        assert_eq!(truncate_text(&once, TEXT_LIMIT), once);
        // a shorter downstream limit never sees an already-short body
        let body = truncate_text(&long, BODY_LIMIT);
        assert_eq!(truncate_text(&body, TEXT_LIMIT), body);
        assert_eq!(body.matches(TRUNCATION_MARKER).count(), 1);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "é".repeat(10);
        assert_eq!(truncate_text(&text, 10), text);
        assert_eq!(truncate_text(&text, 5), "éé...");
    }

    #[test]
    fn tags_are_deduplicated_and_blank_free() {
        let entity = NormalizedEntity::new(EntityKind::Issue, "I_1", "t")
            .with_tags(["bug", "", "bug", " triage "]);
        assert_eq!(entity.tags, vec!["bug".to_string(), "triage".to_string()]);
    }

    #[test]
    fn absent_moments_are_not_recorded() {
        let entity = NormalizedEntity::new(EntityKind::Issue, "I_1", "t")
            .with_moment(Moment::Created, Some("2024-01-01T00:00:00Z".into()))
            .with_moment(Moment::Closed, None);
        assert_eq!(entity.moment(Moment::Created), Some("2024-01-01T00:00:00Z"));
        assert!(entity.moment(Moment::Closed).is_none());
        assert!(!entity.with_extra("body", json!(null)).extra.contains_key("body"));
    }

    #[test]
    fn schema_requires_a_title_property() {
        let mut props = BTreeMap::new();
        props.insert("GitHub ID".to_string(), PropertySchema::of(PropertyType::RichText));
        assert!(TargetSchema::from_properties("db", props.clone()).is_none());

        props.insert("Name".to_string(), PropertySchema::of(PropertyType::Title));
        let schema = TargetSchema::from_properties("db", props).unwrap();
        assert_eq!(schema.title_property(), "Name");
        assert_eq!(
            PropertyType::from_wire("formula"),
            PropertyType::Other("formula".into())
        );
    }

    #[test]
    fn summary_counts_every_outcome() {
        let mut summary = ReconciliationSummary::new("db", false);
        summary.record("a", &ItemOutcome::Created { page_id: "p1".into() });
        summary.record("b", &ItemOutcome::Updated { page_id: "p2".into() });
        summary.record("c", &ItemOutcome::Skipped { reason: SkipReason::DryRun });
        summary.record("d", &ItemOutcome::Failed { message: "boom".into() });
        let summary = summary.finish();

        assert_eq!(summary.processed, 4);
        assert_eq!((summary.created, summary.updated, summary.skipped, summary.failed), (1, 1, 1, 1));
        assert_eq!(summary.failures[0].identifier, "d");
        assert!(summary.has_failures());
        assert!(summary.finished_at.is_some());
    }
}
