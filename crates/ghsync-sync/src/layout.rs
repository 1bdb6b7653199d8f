//! Which target property each piece of a normalized record feeds.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use ghsync_core::{EntityKind, Moment, NormalizedEntity};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::coerce::FieldValue;
use crate::config::ConfigError;

/// Where a property's value comes from.
///
/// Written in layout files as `identifier`, `status`, `tags`, `url`, `people`,
/// `moment:<name>`, `extra:<key>` (text), `number:<key>` or `constant:<text>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldSource {
    Identifier,
    Status,
    Tags,
    Url,
    People,
    Moment(Moment),
    Extra(String),
    ExtraNumber(String),
    Constant(String),
}

impl FieldSource {
    pub fn value_of(&self, entity: &NormalizedEntity) -> FieldValue {
        match self {
            Self::Identifier => FieldValue::Identifier(entity.external_id.clone()),
            Self::Status => FieldValue::Status(entity.status.clone()),
            Self::Tags => FieldValue::Tags(entity.tags.clone()),
            Self::Url => FieldValue::Url(entity.url.clone()),
            Self::People => FieldValue::People(entity.people.clone()),
            Self::Moment(moment) => FieldValue::Date(entity.moment(*moment).map(str::to_string)),
            Self::Extra(key) => FieldValue::Text(entity.extra.get(key).and_then(extra_text)),
            Self::ExtraNumber(key) => FieldValue::Number(entity.extra.get(key).cloned()),
            Self::Constant(text) => FieldValue::Text(Some(text.clone())),
        }
    }
}

fn extra_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(extra_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        other => Some(other.to_string()),
    }
}

impl TryFrom<String> for FieldSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for FieldSource {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (head, arg) = match input.split_once(':') {
            Some((head, arg)) => (head, Some(arg.trim())),
            None => (input, None),
        };
        let source = match (head, arg) {
            ("identifier", None) => Self::Identifier,
            ("status", None) => Self::Status,
            ("tags", None) => Self::Tags,
            ("url", None) => Self::Url,
            ("people", None) => Self::People,
            ("moment", Some(name)) => {
                Self::Moment(Moment::parse(name).ok_or_else(|| format!("unknown moment `{name}`"))?)
            }
            ("extra", Some(key)) if !key.is_empty() => Self::Extra(key.to_string()),
            ("number", Some(key)) if !key.is_empty() => Self::ExtraNumber(key.to_string()),
            ("constant", Some(text)) => Self::Constant(text.to_string()),
            _ => return Err(format!("unknown field source `{input}`")),
        };
        Ok(source)
    }
}

impl fmt::Display for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier => f.write_str("identifier"),
            Self::Status => f.write_str("status"),
            Self::Tags => f.write_str("tags"),
            Self::Url => f.write_str("url"),
            Self::People => f.write_str("people"),
            Self::Moment(moment) => write!(f, "moment:{}", moment_name(*moment)),
            Self::Extra(key) => write!(f, "extra:{key}"),
            Self::ExtraNumber(key) => write!(f, "number:{key}"),
            Self::Constant(text) => write!(f, "constant:{text}"),
        }
    }
}

impl From<FieldSource> for String {
    fn from(source: FieldSource) -> Self {
        source.to_string()
    }
}

fn moment_name(moment: Moment) -> &'static str {
    match moment {
        Moment::Created => "created",
        Moment::Updated => "updated",
        Moment::Closed => "closed",
        Moment::Merged => "merged",
        Moment::Due => "due",
        Moment::Started => "started",
        Moment::Pushed => "pushed",
    }
}

/// Ordered `(property name, source)` pairs for one entity kind. The title
/// property never appears here; it is discovered from the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyLayout {
    entries: Vec<(String, FieldSource)>,
}

impl PropertyLayout {
    pub fn default_for(kind: EntityKind, id_property: &str) -> Self {
        use FieldSource as S;
        use Moment as M;

        let extra = |k: &str| S::Extra(k.to_string());
        let number = |k: &str| S::ExtraNumber(k.to_string());

        let mut entries: Vec<(&str, FieldSource)> = vec![(id_property, S::Identifier), ("GitHub URL", S::Url)];
        match kind {
            EntityKind::Issue => entries.extend([
                ("Status", S::Status),
                ("Labels", S::Tags),
                ("Assignees", S::People),
                ("Author", extra("author")),
                ("Number", number("number")),
                ("Created", S::Moment(M::Created)),
                ("Updated", S::Moment(M::Updated)),
                ("Closed", S::Moment(M::Closed)),
            ]),
            EntityKind::PullRequest => entries.extend([
                ("Status", S::Status),
                ("Labels", S::Tags),
                ("Author", extra("author")),
                ("Reviewers", extra("reviewers")),
                ("Branch", extra("branch")),
                ("Number", number("number")),
                ("Created", S::Moment(M::Created)),
                ("Updated", S::Moment(M::Updated)),
                ("Closed", S::Moment(M::Closed)),
                ("Merged", S::Moment(M::Merged)),
            ]),
            EntityKind::Milestone => entries.extend([
                ("Status", S::Status),
                ("Type", extra("type")),
                ("Due Date", S::Moment(M::Due)),
                ("Description", extra("description")),
                ("Open Issues", number("open_issues")),
                ("Closed Issues", number("closed_issues")),
                ("Created", S::Moment(M::Created)),
                ("Updated", S::Moment(M::Updated)),
                ("Closed", S::Moment(M::Closed)),
            ]),
            EntityKind::Project => entries.extend([
                ("Status", S::Status),
                ("Type", extra("type")),
                ("Description", extra("description")),
                ("Created", S::Moment(M::Created)),
                ("Updated", S::Moment(M::Updated)),
            ]),
            EntityKind::WorkflowRun => entries.extend([
                ("Status", S::Status),
                ("Conclusion", extra("conclusion")),
                ("Event", extra("event")),
                ("Branch", extra("branch")),
                ("Commit", extra("commit")),
                ("Run Number", number("run_number")),
                ("Actor", extra("actor")),
                ("Created", S::Moment(M::Started)),
                ("Updated", S::Moment(M::Updated)),
            ]),
            EntityKind::Discussion => entries.extend([
                ("Category", extra("category")),
                ("Labels", S::Tags),
                ("Author", extra("author")),
                ("Number", number("number")),
                ("Created", S::Moment(M::Created)),
                ("Updated", S::Moment(M::Updated)),
            ]),
            EntityKind::Repository => entries.extend([
                ("Description", extra("description")),
                ("Topics", S::Tags),
                ("Owner", S::People),
                ("Language", extra("language")),
                ("Stars", number("stars")),
                ("Last Push", S::Moment(M::Pushed)),
                ("Created", S::Moment(M::Created)),
                ("Updated", S::Moment(M::Updated)),
            ]),
        }

        Self {
            entries: entries
                .into_iter()
                .map(|(name, source)| (name.to_string(), source))
                .collect(),
        }
    }

    /// Rename the property fed by each overridden source, or append a new
    /// entry when the source is not in the layout yet.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<FieldSource, String>) {
        for (source, property) in overrides {
            match self.entries.iter_mut().find(|(_, s)| s == source) {
                Some(entry) => entry.0 = property.clone(),
                None => self.entries.push((property.clone(), source.clone())),
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &FieldSource)> {
        self.entries.iter().map(|(name, source)| (name.as_str(), source))
    }
}

impl PartialOrd for FieldSource {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldSource {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

/// Per-kind property renames, loaded from YAML:
///
/// ```yaml
/// pull_request:
///   status: State
///   "moment:merged": Completed
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct LayoutOverrides {
    kinds: BTreeMap<EntityKind, BTreeMap<FieldSource, String>>,
}

impl LayoutOverrides {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn layout_for(&self, kind: EntityKind, id_property: &str) -> PropertyLayout {
        let mut layout = PropertyLayout::default_for(kind, id_property);
        if let Some(overrides) = self.kinds.get(&kind) {
            layout.apply_overrides(overrides);
        }
        layout
    }
}
