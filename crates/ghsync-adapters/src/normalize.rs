//! Pure per-kind normalizers: raw GitHub JSON → [`NormalizedEntity`].

use chrono::{DateTime, SecondsFormat};
use ghsync_core::{truncate_text, EntityKind, Moment, NormalizedEntity, BODY_LIMIT};
use serde_json::{json, Value as JsonValue};

use crate::NormalizeError;

pub type Normalizer = fn(&JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError>;

/// Strategy lookup: the normalizer responsible for one entity kind.
pub fn normalizer_for(kind: EntityKind) -> Normalizer {
    match kind {
        EntityKind::Issue => normalize_issue,
        EntityKind::PullRequest => normalize_pull_request,
        EntityKind::Milestone => normalize_milestone,
        EntityKind::Project => normalize_project,
        EntityKind::WorkflowRun => normalize_workflow_run,
        EntityKind::Discussion => normalize_discussion,
        EntityKind::Repository => normalize_repository,
    }
}

/// Returns `Ok(None)` for pull requests surfaced by the issues listing.
pub fn normalize_issue(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    if is_pull_request_marker(raw) {
        return Ok(None);
    }
    let entity = NormalizedEntity::new(EntityKind::Issue, external_id(raw)?, required_str(raw, "title")?)
        .with_status(issue_status(json_str(raw, &["state"])))
        .with_tags(names(raw, "labels", "name"))
        .with_url(json_string(raw, &["html_url"]))
        .with_people(names(raw, "assignees", "login"))
        .with_moment(Moment::Created, timestamp(raw, "created_at"))
        .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
        .with_moment(Moment::Closed, timestamp(raw, "closed_at"))
        .with_extra("number", raw.get("number").cloned().unwrap_or(JsonValue::Null))
        .with_extra("author", opt_json(json_str(raw, &["user", "login"])))
        .with_extra("body", body(raw, "body"));
    Ok(Some(entity))
}

pub fn normalize_pull_request(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    let author = json_string(raw, &["user", "login"]);
    let reviewers = names(raw, "requested_reviewers", "login");
    let mut people: Vec<String> = author.iter().cloned().collect();
    people.extend(reviewers.iter().cloned());

    let entity = NormalizedEntity::new(
        EntityKind::PullRequest,
        external_id(raw)?,
        required_str(raw, "title")?,
    )
    .with_status(pull_request_status(
        json_str(raw, &["merged_at"]),
        json_str(raw, &["state"]),
    ))
    .with_tags(names(raw, "labels", "name"))
    .with_url(json_string(raw, &["html_url"]))
    .with_people(people)
    .with_moment(Moment::Created, timestamp(raw, "created_at"))
    .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
    .with_moment(Moment::Closed, timestamp(raw, "closed_at"))
    .with_moment(Moment::Merged, timestamp(raw, "merged_at"))
    .with_extra("number", raw.get("number").cloned().unwrap_or(JsonValue::Null))
    .with_extra("author", opt_json(author.as_deref()))
    .with_extra("reviewers", json!(reviewers))
    .with_extra("draft", raw.get("draft").cloned().unwrap_or(JsonValue::Null))
    .with_extra("branch", opt_json(json_str(raw, &["head", "ref"])))
    .with_extra("base_branch", opt_json(json_str(raw, &["base", "ref"])))
    .with_extra("body", body(raw, "body"));
    Ok(Some(entity))
}

pub fn normalize_milestone(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    let entity = NormalizedEntity::new(EntityKind::Milestone, external_id(raw)?, required_str(raw, "title")?)
        .with_status(lifecycle_status(json_str(raw, &["state"])))
        .with_url(json_string(raw, &["html_url"]))
        .with_people(json_string(raw, &["creator", "login"]))
        .with_moment(Moment::Created, timestamp(raw, "created_at"))
        .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
        .with_moment(Moment::Closed, timestamp(raw, "closed_at"))
        .with_moment(Moment::Due, timestamp(raw, "due_on"))
        .with_extra("type", json!(EntityKind::Milestone.label()))
        .with_extra("number", raw.get("number").cloned().unwrap_or(JsonValue::Null))
        .with_extra("open_issues", raw.get("open_issues").cloned().unwrap_or(JsonValue::Null))
        .with_extra("closed_issues", raw.get("closed_issues").cloned().unwrap_or(JsonValue::Null))
        .with_extra("description", body(raw, "description"));
    Ok(Some(entity))
}

pub fn normalize_project(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    let entity = NormalizedEntity::new(EntityKind::Project, external_id(raw)?, required_str(raw, "name")?)
        .with_status(lifecycle_status(json_str(raw, &["state"])))
        .with_url(json_string(raw, &["html_url"]))
        .with_people(json_string(raw, &["creator", "login"]))
        .with_moment(Moment::Created, timestamp(raw, "created_at"))
        .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
        .with_extra("type", json!(EntityKind::Project.label()))
        .with_extra("number", raw.get("number").cloned().unwrap_or(JsonValue::Null))
        .with_extra("description", body(raw, "body"));
    Ok(Some(entity))
}

pub fn normalize_workflow_run(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    let name = json_str(raw, &["name"]).filter(|n| !n.is_empty()).unwrap_or("Workflow");
    let run_number = raw.get("run_number").and_then(JsonValue::as_i64);
    let title = match run_number {
        Some(number) => format!("{name} #{number}"),
        None => name.to_string(),
    };
    let conclusion = json_str(raw, &["conclusion"]);
    let status = json_str(raw, &["status"]);

    let entity = NormalizedEntity::new(EntityKind::WorkflowRun, external_id(raw)?, title)
        .with_status(run_status(conclusion, status))
        .with_url(json_string(raw, &["html_url"]))
        .with_people(json_string(raw, &["actor", "login"]))
        .with_moment(Moment::Created, timestamp(raw, "created_at"))
        .with_moment(Moment::Started, timestamp(raw, "run_started_at"))
        .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
        .with_extra(
            "conclusion",
            json!(title_case(
                conclusion.filter(|c| !c.is_empty()).or(status).unwrap_or("unknown")
            )),
        )
        .with_extra("workflow_status", opt_json(status.map(title_case).as_deref()))
        .with_extra("event", opt_json(json_str(raw, &["event"])))
        .with_extra("branch", opt_json(json_str(raw, &["head_branch"])))
        .with_extra("commit", opt_json(json_str(raw, &["head_sha"])))
        .with_extra("run_number", run_number.map(JsonValue::from).unwrap_or(JsonValue::Null))
        .with_extra("actor", opt_json(json_str(raw, &["actor", "login"])));
    Ok(Some(entity))
}

/// Discussions carry no lifecycle status; the category is the only tag.
pub fn normalize_discussion(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    let category = json_string(raw, &["category", "name"]);
    let entity = NormalizedEntity::new(EntityKind::Discussion, external_id(raw)?, required_str(raw, "title")?)
        .with_tags(category.clone())
        .with_url(json_string(raw, &["html_url"]))
        .with_people(json_string(raw, &["user", "login"]))
        .with_moment(Moment::Created, timestamp(raw, "created_at"))
        .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
        .with_extra("number", raw.get("number").cloned().unwrap_or(JsonValue::Null))
        .with_extra("category", opt_json(category.as_deref()))
        .with_extra("author", opt_json(json_str(raw, &["user", "login"])))
        .with_extra("body", body(raw, "body"));
    Ok(Some(entity))
}

pub fn normalize_repository(raw: &JsonValue) -> Result<Option<NormalizedEntity>, NormalizeError> {
    ensure_object(raw)?;
    let name = json_string(raw, &["name"])
        .or_else(|| json_string(raw, &["full_name"]))
        .ok_or(NormalizeError::MissingField("name"))?;
    let topics = raw
        .get("topics")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let entity = NormalizedEntity::new(EntityKind::Repository, external_id(raw)?, name)
        .with_tags(topics)
        .with_url(json_string(raw, &["html_url"]))
        .with_people(json_string(raw, &["owner", "login"]))
        .with_moment(Moment::Created, timestamp(raw, "created_at"))
        .with_moment(Moment::Updated, timestamp(raw, "updated_at"))
        .with_moment(Moment::Pushed, timestamp(raw, "pushed_at"))
        .with_extra("full_name", opt_json(json_str(raw, &["full_name"])))
        .with_extra("language", opt_json(json_str(raw, &["language"])))
        .with_extra("visibility", opt_json(json_str(raw, &["visibility"])))
        .with_extra("stars", raw.get("stargazers_count").cloned().unwrap_or(JsonValue::Null))
        .with_extra("description", body(raw, "description"));
    Ok(Some(entity))
}

pub fn issue_status(state: Option<&str>) -> &'static str {
    if state == Some("closed") {
        "Closed"
    } else {
        "Open"
    }
}

/// A merge timestamp wins over any `state` value.
pub fn pull_request_status(merged_at: Option<&str>, state: Option<&str>) -> &'static str {
    if merged_at.is_some_and(|m| !m.is_empty()) {
        "Merged"
    } else if state == Some("closed") {
        "Closed"
    } else {
        "Open"
    }
}

/// Milestones and projects: `Closed`, else the capitalised raw state, else `Open`.
pub fn lifecycle_status(state: Option<&str>) -> String {
    match state.map(str::trim).filter(|s| !s.is_empty()) {
        Some("closed") => "Closed".to_string(),
        Some(other) => capitalize(other),
        None => "Open".to_string(),
    }
}

pub fn run_status(conclusion: Option<&str>, status: Option<&str>) -> String {
    let conclusion = conclusion.filter(|c| !c.is_empty());
    let status = status.filter(|s| !s.is_empty());
    match conclusion {
        Some("success") => "Success".to_string(),
        Some("failure" | "timed_out" | "startup_failure") => "Failure".to_string(),
        Some(other) => title_case(other),
        None => match status {
            Some("queued" | "in_progress") => "In Progress".to_string(),
            Some(other) => title_case(other),
            None => "Unknown".to_string(),
        },
    }
}

/// `action_required` → `Action Required`.
pub fn title_case(input: &str) -> String {
    input
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn capitalize(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Permanent `node_id` when present, otherwise the numeric or string `id`.
pub fn external_id(raw: &JsonValue) -> Result<String, NormalizeError> {
    if let Some(node_id) = json_str(raw, &["node_id"]).filter(|n| !n.is_empty()) {
        return Ok(node_id.to_string());
    }
    match raw.get("id") {
        Some(JsonValue::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(JsonValue::Number(id)) => Ok(id.to_string()),
        _ => Err(NormalizeError::MissingField("id")),
    }
}

pub fn is_pull_request_marker(raw: &JsonValue) -> bool {
    raw.get("pull_request").is_some_and(|v| !v.is_null())
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_str(raw: &JsonValue, key: &'static str) -> Result<String, NormalizeError> {
    json_string(raw, &[key]).ok_or(NormalizeError::MissingField(key))
}

fn ensure_object(raw: &JsonValue) -> Result<(), NormalizeError> {
    if raw.is_object() {
        Ok(())
    } else {
        Err(NormalizeError::NotAnObject)
    }
}

/// `field` of every object in the array under `key`.
fn names(raw: &JsonValue, key: &str, field: &str) -> Vec<String> {
    raw.get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(JsonValue::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// RFC 3339 timestamps normalised to UTC seconds; unparsable values pass through.
fn timestamp(raw: &JsonValue, key: &str) -> Option<String> {
    let value = json_string(raw, &[key])?;
    Some(match DateTime::parse_from_rfc3339(&value) {
        Ok(parsed) => parsed
            .with_timezone(&chrono::Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => value,
    })
}

fn body(raw: &JsonValue, key: &str) -> JsonValue {
    match json_str(raw, &[key]).filter(|b| !b.trim().is_empty()) {
        Some(text) => JsonValue::String(truncate_text(text, BODY_LIMIT)),
        None => JsonValue::Null,
    }
}

fn opt_json(value: Option<&str>) -> JsonValue {
    value
        .filter(|v| !v.is_empty())
        .map(|v| JsonValue::String(v.to_string()))
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_always_wins_over_state() {
        for state in [Some("open"), Some("closed"), None] {
            assert_eq!(pull_request_status(Some("2024-02-01T10:00:00Z"), state), "Merged");
        }
        assert_eq!(pull_request_status(None, Some("closed")), "Closed");
        assert_eq!(pull_request_status(Some(""), Some("open")), "Open");
    }

    #[test]
    fn run_status_mapping() {
        assert_eq!(run_status(Some("success"), Some("completed")), "Success");
        assert_eq!(run_status(Some("timed_out"), Some("completed")), "Failure");
        assert_eq!(run_status(Some("startup_failure"), None), "Failure");
        assert_eq!(run_status(Some("cancelled"), Some("completed")), "Cancelled");
        assert_eq!(run_status(Some("skipped"), None), "Skipped");
        assert_eq!(run_status(None, Some("queued")), "In Progress");
        assert_eq!(run_status(Some(""), Some("in_progress")), "In Progress");
        assert_eq!(run_status(Some("action_required"), None), "Action Required");
        assert_eq!(run_status(None, Some("waiting")), "Waiting");
        assert_eq!(run_status(None, None), "Unknown");
    }

    #[test]
    fn lifecycle_status_capitalises_unknown_states() {
        assert_eq!(lifecycle_status(Some("closed")), "Closed");
        assert_eq!(lifecycle_status(Some("open")), "Open");
        assert_eq!(lifecycle_status(Some("ARCHIVED")), "Archived");
        assert_eq!(lifecycle_status(None), "Open");
    }

    #[test]
    fn issue_listing_excludes_pull_requests() {
        let raw = json!({
            "id": 7, "title": "PR in disguise", "state": "open",
            "pull_request": {"url": "https://api.github.com/repos/a/b/pulls/7"}
        });
        assert!(normalize_issue(&raw).unwrap().is_none());
    }

    #[test]
    fn issue_without_title_is_rejected() {
        let raw = json!({"id": 9, "state": "open"});
        assert_eq!(
            normalize_issue(&raw).unwrap_err(),
            NormalizeError::MissingField("title")
        );
    }

    #[test]
    fn node_id_is_preferred_over_numeric_id() {
        assert_eq!(external_id(&json!({"id": 42, "node_id": "I_kwDO"})).unwrap(), "I_kwDO");
        assert_eq!(external_id(&json!({"id": 42})).unwrap(), "42");
        assert_eq!(external_id(&json!({"id": "I_1"})).unwrap(), "I_1");
        assert!(external_id(&json!({"title": "x"})).is_err());
    }

    #[test]
    fn long_bodies_are_truncated_once() {
        let raw = json!({"id": "I_2", "title": "t", "body": "b".repeat(5000)});
        let entity = normalize_issue(&raw).unwrap().unwrap();
        let body = entity.extra["body"].as_str().unwrap();
        assert_eq!(body.chars().count(), BODY_LIMIT);
        assert!(body.ends_with("..."));
    }

    #[test]
    fn discussion_tags_come_from_category_only() {
        let raw = json!({
            "node_id": "D_1", "title": "Ideas", "state": "open",
            "category": {"name": "Q&A"},
            "labels": [{"name": "ignored"}]
        });
        let entity = normalize_discussion(&raw).unwrap().unwrap();
        assert_eq!(entity.tags, vec!["Q&A".to_string()]);
        assert!(entity.status.is_none());
    }

    #[test]
    fn timestamps_are_normalised_to_utc() {
        let raw = json!({
            "id": 1, "title": "t",
            "created_at": "2024-03-01T12:00:00+02:00",
            "closed_at": null
        });
        let entity = normalize_issue(&raw).unwrap().unwrap();
        assert_eq!(entity.moment(Moment::Created), Some("2024-03-01T10:00:00Z"));
        assert!(entity.moment(Moment::Closed).is_none());
    }
}
