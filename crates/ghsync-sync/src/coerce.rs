//! Schema-adaptive property coercion.
//!
//! A [`FieldValue`] is what a normalized record offers for one property; the
//! schema decides which wire shape, if any, it becomes.

use ghsync_core::{truncate_text, PropertySchema, PropertyType, OPTION_NAME_LIMIT, TEXT_LIMIT};
use serde_json::{json, Number, Value as JsonValue};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// External identifier written into the identifier property.
    Identifier(String),
    Text(Option<String>),
    Url(Option<String>),
    Status(Option<String>),
    Tags(Vec<String>),
    People(Vec<String>),
    Number(Option<JsonValue>),
    Date(Option<String>),
}

impl FieldValue {
    /// Property types this field is meant for. `rich_text` is always accepted
    /// as a plain-text fallback on top of these.
    pub fn prefers(&self, kind: &PropertyType) -> bool {
        use PropertyType as P;
        match self {
            Self::Identifier(_) => matches!(kind, P::RichText | P::Title | P::Number | P::Url),
            Self::Text(_) => matches!(kind, P::RichText | P::Title | P::Select),
            Self::Url(_) => matches!(kind, P::Url | P::RichText),
            Self::Status(_) => matches!(kind, P::Status | P::Select | P::RichText),
            Self::Tags(_) | Self::People(_) => matches!(kind, P::MultiSelect | P::RichText),
            Self::Number(_) => matches!(kind, P::Number | P::RichText),
            Self::Date(_) => matches!(kind, P::Date | P::RichText),
        }
    }

    /// Plain-text rendering used for title/rich_text/select targets.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            Self::Identifier(value) => Some(value.clone()),
            Self::Text(value) | Self::Url(value) | Self::Status(value) | Self::Date(value) => {
                value.clone()
            }
            Self::Tags(values) | Self::People(values) => {
                if values.is_empty() {
                    None
                } else {
                    Some(values.join(", "))
                }
            }
            Self::Number(value) => match value {
                Some(JsonValue::String(s)) => Some(s.clone()),
                Some(JsonValue::Null) | None => None,
                Some(other) => Some(other.to_string()),
            },
        };
        text.filter(|text| !text.is_empty())
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Self::Number(Some(JsonValue::Number(n))) => Some(n.clone()),
            Self::Number(Some(JsonValue::String(s))) => parse_number(s),
            Self::Identifier(s) => parse_number(s),
            _ => None,
        }
    }

    fn as_names(&self) -> Vec<String> {
        match self {
            Self::Tags(values) | Self::People(values) => values.clone(),
            other => other.as_text().into_iter().collect(),
        }
    }
}

/// Parse a numeric string as an integer when it is one, otherwise as a float.
pub fn parse_number(input: &str) -> Option<Number> {
    let input = input.trim();
    if let Ok(int) = input.parse::<i64>() {
        return Some(Number::from(int));
    }
    input
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
}

/// Typed payload for one target property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyPayload {
    Title(String),
    RichText(String),
    Select(String),
    Status(String),
    MultiSelect(Vec<String>),
    /// `None` clears the stored value.
    Number(Option<Number>),
    Date(Option<String>),
    Url(Option<String>),
}

impl PropertyPayload {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Title(text) => json!({ "title": text_blocks(text) }),
            Self::RichText(text) => json!({ "rich_text": text_blocks(text) }),
            Self::Select(name) => json!({ "select": { "name": name } }),
            Self::Status(name) => json!({ "status": { "name": name } }),
            Self::MultiSelect(names) => json!({
                "multi_select": names.iter().map(|n| json!({ "name": n })).collect::<Vec<_>>()
            }),
            Self::Number(value) => json!({ "number": value }),
            Self::Date(Some(start)) => json!({ "date": { "start": start } }),
            Self::Date(None) => json!({ "date": null }),
            Self::Url(value) => json!({ "url": value }),
        }
    }
}

fn text_blocks(text: &str) -> Vec<JsonValue> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "type": "text", "text": { "content": text } })]
    }
}

/// Coerce one field into the declared property type. `None` means the
/// property is omitted from the payload.
pub fn coerce(value: &FieldValue, schema: &PropertySchema) -> Option<PropertyPayload> {
    if !value.prefers(&schema.kind) && schema.kind != PropertyType::RichText {
        return None;
    }

    match &schema.kind {
        PropertyType::Title => value
            .as_text()
            .map(|text| PropertyPayload::Title(truncate_text(&text, TEXT_LIMIT))),
        PropertyType::RichText => Some(PropertyPayload::RichText(
            value
                .as_text()
                .map(|text| truncate_text(&text, TEXT_LIMIT))
                .unwrap_or_default(),
        )),
        PropertyType::Select => option_name(value, schema).map(PropertyPayload::Select),
        PropertyType::Status => option_name(value, schema).map(PropertyPayload::Status),
        PropertyType::MultiSelect => {
            let mut names: Vec<String> = Vec::new();
            for name in value.as_names() {
                let name = truncate_text(name.trim(), OPTION_NAME_LIMIT);
                // option names cannot contain commas
                let name = name.replace(',', " ");
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
            Some(PropertyPayload::MultiSelect(names))
        }
        PropertyType::Number => Some(PropertyPayload::Number(value.as_number())),
        PropertyType::Date => Some(PropertyPayload::Date(value.as_text())),
        PropertyType::Url => Some(PropertyPayload::Url(value.as_text())),
        PropertyType::People | PropertyType::Relation | PropertyType::Other(_) => None,
    }
}

/// Select/status option: empty values and names outside a declared option set are omitted.
fn option_name(value: &FieldValue, schema: &PropertySchema) -> Option<String> {
    let name = truncate_text(value.as_text()?.trim(), OPTION_NAME_LIMIT);
    if name.is_empty() || !schema.allows_option(&name) {
        return None;
    }
    Some(name)
}
