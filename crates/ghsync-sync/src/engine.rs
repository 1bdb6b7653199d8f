//! The reconciliation engine: upserts normalized records into one database.
//!
//! Each item runs through the same steps in order:
//!
//! 1. build the property payload against the target schema, skipping items
//!    whose payload comes out empty;
//! 2. stop at a `dry-run` skip when no writes are allowed;
//! 3. resolve the existing page by external id, then update it or create a
//!    new page bound to the database.
//!
//! Failures in any step are recorded against that item only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use ghsync_adapters::Candidate;
use ghsync_core::{
    EntityKind, ItemOutcome, NormalizedEntity, PropertyType, ReconciliationSummary, SkipReason,
    TargetSchema,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::coerce::{coerce, parse_number, FieldValue};
use crate::config::ConfigError;
use crate::layout::{FieldSource, LayoutOverrides, PropertyLayout};
use crate::resolve::{IdentityResolver, PageIndex};
use crate::schema::{suggestion_suffix, SchemaCache};
use crate::target::{PropertyMap, TargetApi, TargetError};
use crate::SyncError;

pub struct ReconciliationEngine<'a> {
    api: &'a dyn TargetApi,
    id_property: String,
    layouts: LayoutOverrides,
    schemas: SchemaCache,
    indexes: HashMap<String, PageIndex>,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(api: &'a dyn TargetApi, id_property: impl Into<String>) -> Self {
        Self {
            api,
            id_property: id_property.into(),
            layouts: LayoutOverrides::default(),
            schemas: SchemaCache::new(),
            indexes: HashMap::new(),
        }
    }

    pub fn with_layouts(mut self, layouts: LayoutOverrides) -> Self {
        self.layouts = layouts;
        self
    }

    /// Preload known page ids for a database, e.g. from a persisted index.
    pub fn seed_index(&mut self, database_id: &str, entries: BTreeMap<String, String>) {
        let index = self.indexes.entry(database_id.to_string()).or_default();
        for (external_id, page_id) in entries {
            index.insert(external_id, page_id);
        }
    }

    pub fn index_entries(&self, database_id: &str) -> BTreeMap<String, String> {
        self.indexes
            .get(database_id)
            .map(PageIndex::to_sorted)
            .unwrap_or_default()
    }

    /// Load and validate the database schema. Fatal problems surface here,
    /// before any item is touched.
    pub async fn prepare(&mut self, database_id: &str) -> Result<Arc<TargetSchema>, SyncError> {
        let schema = self.schemas.get(self.api, database_id).await?;
        if schema.get(&self.id_property).is_none() {
            return Err(ConfigError::MissingIdentifierProperty {
                database_id: database_id.to_string(),
                property: self.id_property.clone(),
                suggestion: suggestion_suffix(&schema, &self.id_property),
            }
            .into());
        }
        Ok(schema)
    }

    pub async fn reconcile(
        &mut self,
        candidates: Vec<Candidate>,
        database_id: &str,
        dry_run: bool,
    ) -> Result<ReconciliationSummary, SyncError> {
        let (summary, _) = self
            .reconcile_with_outcomes(candidates, database_id, dry_run)
            .await?;
        Ok(summary)
    }

    /// Like [`reconcile`](Self::reconcile), also returning each item's outcome
    /// in input order.
    pub async fn reconcile_with_outcomes(
        &mut self,
        candidates: Vec<Candidate>,
        database_id: &str,
        dry_run: bool,
    ) -> Result<(ReconciliationSummary, Vec<(String, ItemOutcome)>), SyncError> {
        let schema = self.prepare(database_id).await?;
        let id_type = schema
            .get(&self.id_property)
            .map(|p| p.kind.clone())
            .unwrap_or(PropertyType::RichText);

        let unmatchable = unmatchable_ids(&id_type, &candidates);
        if unmatchable > 0 {
            warn!(
                database_id,
                property = %self.id_property,
                unmatchable,
                "identifier property is number-typed; non-numeric ids never match and create a new page each run"
            );
        }

        let index = self.indexes.remove(database_id).unwrap_or_default();
        let mut resolver = IdentityResolver::new(database_id, self.id_property.clone(), id_type, index);
        let mut payloads = PayloadBuilder::new(&schema, &self.id_property, &self.layouts);
        let mut summary = ReconciliationSummary::new(database_id, dry_run);
        let mut outcomes = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let (identifier, outcome) = match candidate {
                Err(rejected) => (
                    rejected.identifier,
                    ItemOutcome::Failed {
                        message: rejected.message,
                    },
                ),
                Ok(entity) => {
                    let span = info_span!(
                        "reconcile_item",
                        external_id = %entity.external_id,
                        kind = %entity.kind
                    );
                    let outcome = reconcile_entity(
                        self.api,
                        &mut resolver,
                        &mut payloads,
                        database_id,
                        &entity,
                        dry_run,
                    )
                    .instrument(span)
                    .await;
                    (entity.external_id, outcome)
                }
            };
            summary.record(&identifier, &outcome);
            outcomes.push((identifier, outcome));
        }

        drop(payloads);
        self.indexes
            .insert(database_id.to_string(), resolver.into_index());

        let summary = summary.finish();
        info!(
            database_id,
            dry_run,
            processed = summary.processed,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "reconciliation finished"
        );
        Ok((summary, outcomes))
    }
}

/// Candidates whose id can never be stored in a number-typed identifier property.
fn unmatchable_ids(id_type: &PropertyType, candidates: &[Candidate]) -> usize {
    if *id_type != PropertyType::Number {
        return 0;
    }
    candidates
        .iter()
        .filter_map(|c| c.as_ref().ok())
        .filter(|entity| parse_number(&entity.external_id).is_none())
        .count()
}

async fn reconcile_entity(
    api: &dyn TargetApi,
    resolver: &mut IdentityResolver,
    payloads: &mut PayloadBuilder<'_>,
    database_id: &str,
    entity: &NormalizedEntity,
    dry_run: bool,
) -> ItemOutcome {
    let properties = payloads.build(entity);
    if properties.is_empty() {
        info!("skipping: no property maps onto the target schema");
        return ItemOutcome::Skipped {
            reason: SkipReason::EmptyProperties,
        };
    }
    if dry_run {
        info!(properties = properties.len(), "dry-run: would create or update");
        return ItemOutcome::Skipped {
            reason: SkipReason::DryRun,
        };
    }

    match upsert(api, resolver, database_id, &entity.external_id, &properties).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "item failed");
            ItemOutcome::Failed {
                message: err.to_string(),
            }
        }
    }
}

async fn upsert(
    api: &dyn TargetApi,
    resolver: &mut IdentityResolver,
    database_id: &str,
    external_id: &str,
    properties: &PropertyMap,
) -> Result<ItemOutcome, TargetError> {
    let known = resolver.is_known(external_id);
    let mut existing = resolver.resolve(api, external_id).await?;

    // an indexed page may have been deleted or archived since it was recorded
    if known {
        if let Some(page_id) = existing.take() {
            match api.update_page(&page_id, properties).await {
                Ok(()) => {
                    debug!(%page_id, "updated page");
                    return Ok(ItemOutcome::Updated { page_id });
                }
                Err(err) if err.is_missing_page() => {
                    warn!(%page_id, error = %err, "indexed page is gone; resolving again");
                    resolver.forget(external_id);
                    existing = resolver.resolve(api, external_id).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    match existing {
        Some(page_id) => {
            api.update_page(&page_id, properties).await?;
            debug!(%page_id, "updated page");
            Ok(ItemOutcome::Updated { page_id })
        }
        None => {
            let page_id = api.create_page(database_id, properties).await?;
            resolver.remember(external_id, &page_id);
            debug!(%page_id, "created page");
            Ok(ItemOutcome::Created { page_id })
        }
    }
}

/// Turns entities into property payloads for one schema.
struct PayloadBuilder<'s> {
    schema: &'s TargetSchema,
    id_property: &'s str,
    overrides: &'s LayoutOverrides,
    layouts: HashMap<EntityKind, PropertyLayout>,
    reported_missing: HashSet<String>,
}

impl<'s> PayloadBuilder<'s> {
    fn new(schema: &'s TargetSchema, id_property: &'s str, overrides: &'s LayoutOverrides) -> Self {
        Self {
            schema,
            id_property,
            overrides,
            layouts: HashMap::new(),
            reported_missing: HashSet::new(),
        }
    }

    fn build(&mut self, entity: &NormalizedEntity) -> PropertyMap {
        let schema = self.schema;
        let mut properties = PropertyMap::new();

        let title_property = schema.title_property();
        if let Some(title_schema) = schema.get(title_property) {
            if let Some(payload) = coerce(&FieldValue::Text(Some(entity.title.clone())), title_schema) {
                properties.insert(title_property.to_string(), payload.to_json());
            }
        }

        let (overrides, id_property) = (self.overrides, self.id_property);
        let layout = self
            .layouts
            .entry(entity.kind)
            .or_insert_with(|| overrides.layout_for(entity.kind, id_property));

        for (name, source) in layout.entries() {
            // the title column only takes the identifier when they share a property
            if name == title_property && *source != FieldSource::Identifier {
                continue;
            }
            let Some(property_schema) = schema.get(name) else {
                if self.reported_missing.insert(name.to_string()) {
                    debug!(
                        property = name,
                        suggestion = %suggestion_suffix(schema, name),
                        "layout property not in target schema; skipping"
                    );
                }
                continue;
            };
            match coerce(&source.value_of(entity), property_schema) {
                Some(payload) => {
                    properties.insert(name.to_string(), payload.to_json());
                }
                None => debug!(
                    property = name,
                    declared = property_schema.kind.as_wire(),
                    "value omitted for property type"
                ),
            }
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ghsync_adapters::{JobKind, RawRecord, RejectedRecord};
    use serde_json::{json, Value as JsonValue};

    use super::*;
    use crate::target::QueryPage;

    const DB: &str = "db-1";
    const SCAN_PAGE_SIZE: usize = 2;

    /// In-memory Notion database that counts every call.
    struct FakeNotion {
        schema: JsonValue,
        pages: Mutex<Vec<JsonValue>>,
        creates: AtomicUsize,
        updates: AtomicUsize,
        queries: AtomicUsize,
        updated_ids: Mutex<Vec<String>>,
        gone: Mutex<Vec<String>>,
    }

    impl FakeNotion {
        fn new(properties: JsonValue) -> Self {
            Self {
                schema: json!({ "object": "database", "properties": properties }),
                pages: Mutex::new(Vec::new()),
                creates: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
                updated_ids: Mutex::new(Vec::new()),
                gone: Mutex::new(Vec::new()),
            }
        }

        fn standard() -> Self {
            Self::new(json!({
                "Name": {"type": "title", "title": {}},
                "GitHub ID": {"type": "rich_text", "rich_text": {}},
                "Status": {"type": "status", "status": {"options": [{"name": "Open"}, {"name": "Closed"}]}},
                "Labels": {"type": "multi_select", "multi_select": {"options": []}},
                "GitHub URL": {"type": "url", "url": {}}
            }))
        }

        fn with_pages(self, pages: Vec<JsonValue>) -> Self {
            *self.pages.lock().unwrap() = pages;
            self
        }

        /// Updates to `page_id` answer 404, as for a page deleted in Notion.
        fn with_deleted_page(self, page_id: &str) -> Self {
            self.gone.lock().unwrap().push(page_id.to_string());
            self
        }

        fn created_properties(&self) -> Vec<JsonValue> {
            self.pages
                .lock()
                .unwrap()
                .iter()
                .map(|p| p["properties"].clone())
                .collect()
        }
    }

    fn stored_text(property: &JsonValue) -> Option<String> {
        for key in ["rich_text", "title"] {
            if let Some(block) = property.get(key).and_then(|v| v.get(0)) {
                return block
                    .get("plain_text")
                    .or_else(|| block.get("text").and_then(|t| t.get("content")))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
            }
        }
        property.get("url").and_then(JsonValue::as_str).map(str::to_string)
    }

    #[async_trait]
    impl TargetApi for FakeNotion {
        async fn retrieve_database(&self, _database_id: &str) -> Result<JsonValue, TargetError> {
            Ok(self.schema.clone())
        }

        async fn query_database(
            &self,
            _database_id: &str,
            filter: Option<JsonValue>,
            start_cursor: Option<String>,
        ) -> Result<QueryPage, TargetError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let pages = self.pages.lock().unwrap().clone();
            match filter {
                Some(filter) => {
                    let property = filter["property"].as_str().unwrap_or_default();
                    let wanted = ["rich_text", "title", "url"]
                        .iter()
                        .find_map(|k| filter.get(k))
                        .and_then(|f| f["equals"].as_str())
                        .map(str::to_string);
                    let results = pages
                        .into_iter()
                        .filter(|p| stored_text(&p["properties"][property]) == wanted)
                        .collect();
                    Ok(QueryPage {
                        results,
                        next_cursor: None,
                    })
                }
                None => {
                    let start: usize = start_cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
                    let end = (start + SCAN_PAGE_SIZE).min(pages.len());
                    Ok(QueryPage {
                        results: pages[start..end].to_vec(),
                        next_cursor: (end < pages.len()).then(|| end.to_string()),
                    })
                }
            }
        }

        async fn create_page(
            &self,
            _database_id: &str,
            properties: &PropertyMap,
        ) -> Result<String, TargetError> {
            if stored_text(&properties["Name"]).as_deref() == Some("boom") {
                return Err(TargetError::Status {
                    status: 400,
                    url: "https://notion.test/v1/pages".into(),
                    body: r#"{"code":"validation_error"}"#.into(),
                });
            }
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            let page_id = format!("page-{n}");
            self.pages
                .lock()
                .unwrap()
                .push(json!({ "id": page_id, "properties": properties }));
            Ok(page_id)
        }

        async fn update_page(&self, page_id: &str, _properties: &PropertyMap) -> Result<(), TargetError> {
            if self.gone.lock().unwrap().iter().any(|g| g == page_id) {
                return Err(TargetError::Status {
                    status: 404,
                    url: format!("https://notion.test/v1/pages/{page_id}"),
                    body: r#"{"code":"object_not_found"}"#.into(),
                });
            }
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.updated_ids.lock().unwrap().push(page_id.to_string());
            Ok(())
        }
    }

    fn issue(id: &str, title: &str) -> NormalizedEntity {
        NormalizedEntity::new(EntityKind::Issue, id, title)
            .with_status("Open")
            .with_tags(["bug", "task"])
    }

    fn batch(ids: &[&str]) -> Vec<Candidate> {
        ids.iter().map(|id| Ok(issue(id, &format!("Issue {id}")))).collect()
    }

    #[tokio::test]
    async fn second_run_updates_what_the_first_created() {
        let api = FakeNotion::standard();

        let first = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1", "I_2", "I_3"]), DB, false)
            .await
            .expect("first run");
        assert_eq!((first.created, first.updated), (3, 0));

        let second = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1", "I_2", "I_3"]), DB, false)
            .await
            .expect("second run");
        assert_eq!((second.created, second.updated), (0, 3));
        assert_eq!(api.creates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dry_run_never_writes() {
        let api = FakeNotion::standard();
        let summary = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1", "I_2", "I_3"]), DB, true)
            .await
            .expect("dry run");

        assert!(summary.dry_run);
        assert_eq!((summary.processed, summary.skipped), (3, 3));
        assert_eq!(api.creates.load(Ordering::SeqCst), 0);
        assert_eq!(api.updates.load(Ordering::SeqCst), 0);
        assert_eq!(api.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_bad_item_does_not_stop_the_batch() {
        let api = FakeNotion::standard();
        let candidates = vec![
            Ok(issue("I_1", "first")),
            Err(RejectedRecord {
                identifier: "I_2".into(),
                message: "missing field `title`".into(),
            }),
            Ok(issue("I_3", "boom")),
            Ok(issue("I_4", "fourth")),
        ];

        let summary = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(candidates, DB, false)
            .await
            .expect("run completes");

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 2);
        let failed: Vec<&str> = summary.failures.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(failed, vec!["I_2", "I_3"]);
        assert!(summary.failures[1].message.contains("400"));
    }

    #[tokio::test]
    async fn issue_record_creates_one_page() {
        let api = FakeNotion::standard();
        let adapter = ghsync_adapters::adapter_for_job(JobKind::Issues);
        let raw = RawRecord::new(
            EntityKind::Issue,
            json!({
                "id": "I_1",
                "number": 42,
                "title": "Bug: fix regression",
                "state": "open",
                "labels": [{"name": "task"}]
            }),
        );
        let candidates = ghsync_adapters::normalize_batch(adapter.as_ref(), &[raw]);

        let summary = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(candidates, DB, false)
            .await
            .expect("run");

        assert_eq!(summary.created, 1);
        let created = api.created_properties();
        assert_eq!(created.len(), 1);
        let props = &created[0];
        assert_eq!(props["Name"]["title"][0]["text"]["content"], "Bug: fix regression");
        assert_eq!(props["GitHub ID"]["rich_text"][0]["text"]["content"], "I_1");
        assert_eq!(props["Status"], json!({"status": {"name": "Open"}}));
    }

    #[tokio::test]
    async fn labels_follow_the_schema() {
        let without_labels = FakeNotion::new(json!({
            "Name": {"type": "title", "title": {}},
            "GitHub ID": {"type": "rich_text", "rich_text": {}}
        }));
        ReconciliationEngine::new(&without_labels, "GitHub ID")
            .reconcile(batch(&["I_1"]), DB, false)
            .await
            .expect("run");
        assert!(without_labels.created_properties()[0].get("Labels").is_none());

        let with_labels = FakeNotion::standard();
        ReconciliationEngine::new(&with_labels, "GitHub ID")
            .reconcile(batch(&["I_1"]), DB, false)
            .await
            .expect("run");
        assert_eq!(
            with_labels.created_properties()[0]["Labels"],
            json!({"multi_select": [{"name": "bug"}, {"name": "task"}]})
        );
    }

    #[tokio::test]
    async fn status_outside_options_is_left_out() {
        let api = FakeNotion::standard();
        let merged = NormalizedEntity::new(EntityKind::PullRequest, "PR_1", "Merge me").with_status("Merged");
        ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(vec![Ok(merged)], DB, false)
            .await
            .expect("run");

        let props = &api.created_properties()[0];
        assert!(props.get("Status").is_none());
        assert!(props.get("Name").is_some());
    }

    #[tokio::test]
    async fn numeric_identifier_property_skips_lookup_for_non_numbers() {
        let api = FakeNotion::new(json!({
            "Name": {"type": "title", "title": {}},
            "GitHub ID": {"type": "number", "number": {}}
        }));
        let summary = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1"]), DB, false)
            .await
            .expect("run");

        assert_eq!(summary.created, 1);
        assert_eq!(api.queries.load(Ordering::SeqCst), 0);
        assert_eq!(api.created_properties()[0]["GitHub ID"], json!({"number": null}));
    }

    #[tokio::test]
    async fn duplicate_identifiers_update_the_first_page() {
        let stored = |id: &str| {
            json!({"id": id, "properties": {
                "GitHub ID": {"type": "rich_text", "rich_text": [{"plain_text": "I_1"}]}
            }})
        };
        let api = FakeNotion::standard().with_pages(vec![stored("page-a"), stored("page-b")]);

        let summary = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1"]), DB, false)
            .await
            .expect("run");

        assert_eq!(summary.updated, 1);
        assert_eq!(*api.updated_ids.lock().unwrap(), vec!["page-a".to_string()]);
    }

    #[tokio::test]
    async fn unfilterable_identifier_scans_once() {
        let formula = |page: &str, value: &str| {
            json!({"id": page, "properties": {
                "Key": {"type": "formula", "formula": {"type": "string", "string": value}}
            }})
        };
        let api = FakeNotion::new(json!({
            "Name": {"type": "title", "title": {}},
            "Key": {"type": "formula", "formula": {}}
        }))
        .with_pages(vec![
            formula("page-1", "I_1"),
            formula("page-2", "I_2"),
            formula("page-3", "I_3"),
        ]);

        let summary = ReconciliationEngine::new(&api, "Key")
            .reconcile(batch(&["I_3", "I_1", "I_9"]), DB, false)
            .await
            .expect("run");

        assert_eq!((summary.updated, summary.created), (2, 1));
        assert_eq!(
            *api.updated_ids.lock().unwrap(),
            vec!["page-3".to_string(), "page-1".to_string()]
        );
        // two scan pages, no further queries
        assert_eq!(api.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_payload_is_reported_before_dry_run() {
        let api = FakeNotion::new(json!({
            "Name": {"type": "title", "title": {}},
            "Key": {"type": "formula", "formula": {}}
        }));
        let (summary, outcomes) = ReconciliationEngine::new(&api, "Key")
            .reconcile_with_outcomes(vec![Ok(issue("I_1", ""))], DB, true)
            .await
            .expect("run");

        assert_eq!(summary.skipped, 1);
        assert_eq!(
            outcomes[0].1,
            ItemOutcome::Skipped {
                reason: SkipReason::EmptyProperties
            }
        );
    }

    #[tokio::test]
    async fn missing_identifier_property_is_fatal() {
        let api = FakeNotion::new(json!({
            "Name": {"type": "title", "title": {}},
            "Github Id": {"type": "rich_text", "rich_text": {}}
        }));
        let err = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1"]), DB, false)
            .await
            .expect_err("fatal");

        assert!(matches!(
            err,
            SyncError::Config(ConfigError::MissingIdentifierProperty { .. })
        ));
        assert!(err.to_string().contains("did you mean `Github Id`"));
        assert_eq!(api.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn seeded_index_avoids_lookups() {
        let api = FakeNotion::standard();
        let mut engine = ReconciliationEngine::new(&api, "GitHub ID");
        engine.seed_index(DB, BTreeMap::from([("I_1".to_string(), "page-77".to_string())]));

        let summary = engine.reconcile(batch(&["I_1", "I_2"]), DB, false).await.expect("run");

        assert_eq!((summary.updated, summary.created), (1, 1));
        assert_eq!(api.queries.load(Ordering::SeqCst), 1);
        let index = engine.index_entries(DB);
        assert_eq!(index.get("I_1").map(String::as_str), Some("page-77"));
        assert_eq!(index.get("I_2").map(String::as_str), Some("page-1"));
    }

    #[tokio::test]
    async fn deleted_indexed_page_is_recreated_and_replaced_in_the_index() {
        let api = FakeNotion::standard().with_deleted_page("page-deleted");
        let mut engine = ReconciliationEngine::new(&api, "GitHub ID");
        engine.seed_index(DB, BTreeMap::from([("I_1".to_string(), "page-deleted".to_string())]));

        let first = engine.reconcile(batch(&["I_1"]), DB, false).await.expect("run");
        assert_eq!((first.created, first.updated, first.failed), (1, 0, 0));
        let index = engine.index_entries(DB);
        assert_eq!(index.get("I_1").map(String::as_str), Some("page-1"));

        let mut next = ReconciliationEngine::new(&api, "GitHub ID");
        next.seed_index(DB, index);
        let second = next.reconcile(batch(&["I_1"]), DB, false).await.expect("run");
        assert_eq!((second.created, second.updated, second.failed), (0, 1, 0));
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleted_indexed_page_falls_back_to_the_live_match() {
        let api = FakeNotion::standard()
            .with_pages(vec![json!({"id": "page-live", "properties": {
                "GitHub ID": {"type": "rich_text", "rich_text": [{"plain_text": "I_1"}]}
            }})])
            .with_deleted_page("page-deleted");
        let mut engine = ReconciliationEngine::new(&api, "GitHub ID");
        engine.seed_index(DB, BTreeMap::from([("I_1".to_string(), "page-deleted".to_string())]));

        let summary = engine.reconcile(batch(&["I_1"]), DB, false).await.expect("run");

        assert_eq!((summary.updated, summary.created), (1, 0));
        assert_eq!(*api.updated_ids.lock().unwrap(), vec!["page-live".to_string()]);
        assert_eq!(
            engine.index_entries(DB).get("I_1").map(String::as_str),
            Some("page-live")
        );
    }

    #[tokio::test]
    async fn looked_up_page_that_is_gone_still_fails_the_item() {
        let api = FakeNotion::standard()
            .with_pages(vec![json!({"id": "page-gone", "properties": {
                "GitHub ID": {"type": "rich_text", "rich_text": [{"plain_text": "I_1"}]}
            }})])
            .with_deleted_page("page-gone");

        let summary = ReconciliationEngine::new(&api, "GitHub ID")
            .reconcile(batch(&["I_1"]), DB, false)
            .await
            .expect("run");

        assert_eq!((summary.failed, summary.created), (1, 0));
        assert!(summary.failures[0].message.contains("404"));
    }

    #[test]
    fn counts_ids_a_number_property_cannot_hold() {
        let candidates = vec![
            Ok(issue("I_kwDO", "node id")),
            Ok(issue("42", "numeric")),
            Err(RejectedRecord {
                identifier: "x".into(),
                message: "bad".into(),
            }),
        ];
        assert_eq!(unmatchable_ids(&PropertyType::Number, &candidates), 1);
        assert_eq!(unmatchable_ids(&PropertyType::RichText, &candidates), 0);
    }
}
