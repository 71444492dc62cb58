//! Field kinds and values.
//!
//! Every field collected by a kickoff form or a task output is one of a
//! closed set of kinds. A kind knows how to turn raw JSON input into a typed
//! [`FieldValue`], and a value knows how to format itself for descriptions.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::UserId;

/// Kind of a template field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Single line of text
    String,
    /// Multi-line text
    Text,
    Number,
    Date,
    Url,
    /// Any subset of the selections
    Checkbox { selections: Vec<String> },
    /// Exactly one of the selections
    Radio { selections: Vec<String> },
    /// Exactly one of the selections
    Dropdown { selections: Vec<String> },
    /// Uploaded file references
    File,
    /// A directory user
    User,
}

impl FieldKind {
    /// Parse raw input into a typed value.
    ///
    /// Empty input (`null`, `""`, `[]`) parses to `Ok(None)`; required-ness is
    /// checked by the caller. The error string describes why the input was
    /// rejected and is attributed to the field by the caller.
    pub fn parse(&self, raw: &Value) -> Result<Option<FieldValue>, String> {
        if is_empty_input(raw) {
            return Ok(None);
        }

        let value = match self {
            Self::String | Self::Text => FieldValue::Text(expect_str(raw)?.to_string()),
            Self::Url => {
                let url = expect_str(raw)?.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(format!("'{url}' is not an http(s) URL"));
                }
                FieldValue::Url(url.to_string())
            }
            Self::Number => FieldValue::Number(parse_number(raw)?),
            Self::Date => FieldValue::Date(parse_date(raw)?),
            Self::Checkbox { selections } => {
                let chosen: Vec<String> = match raw {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| expect_str(item).map(str::to_string))
                        .collect::<Result<_, _>>()?,
                    other => vec![expect_str(other)?.to_string()],
                };
                for choice in &chosen {
                    ensure_selection(selections, choice)?;
                }
                FieldValue::Choices(chosen)
            }
            Self::Radio { selections } | Self::Dropdown { selections } => {
                let choice = expect_str(raw)?;
                ensure_selection(selections, choice)?;
                FieldValue::Choice(choice.to_string())
            }
            Self::File => match raw {
                Value::Array(items) => FieldValue::Files(
                    items
                        .iter()
                        .map(|item| expect_str(item).map(str::to_string))
                        .collect::<Result<_, _>>()?,
                ),
                other => FieldValue::Files(vec![expect_str(other)?.to_string()]),
            },
            Self::User => {
                let id = match raw {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                FieldValue::User(id.ok_or_else(|| format!("'{raw}' is not a user id"))?)
            }
        };

        Ok(Some(value))
    }

    /// Whether the ordering comparators apply to values of this kind.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Number | Self::Date)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Url => "url",
            Self::Checkbox { .. } => "checkbox",
            Self::Radio { .. } => "radio",
            Self::Dropdown { .. } => "dropdown",
            Self::File => "file",
            Self::User => "user",
        }
    }
}

fn is_empty_input(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn expect_str(raw: &Value) -> Result<&str, String> {
    raw.as_str()
        .ok_or_else(|| format!("expected a string, got {raw}"))
}

fn ensure_selection(selections: &[String], choice: &str) -> Result<(), String> {
    if selections.iter().any(|s| s == choice) {
        Ok(())
    } else {
        Err(format!("'{choice}' is not one of the allowed selections"))
    }
}

pub(crate) fn parse_number(raw: &Value) -> Result<f64, String> {
    match raw {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("'{n}' is not a number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number")),
        other => Err(format!("'{other}' is not a number")),
    }
}

/// Accepts RFC 3339 timestamps, `YYYY-MM-DD` dates (midnight UTC) and unix
/// timestamps in seconds.
pub(crate) fn parse_date(raw: &Value) -> Result<DateTime<Utc>, String> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .ok_or_else(|| format!("'{n}' is not a valid timestamp")),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
                .ok_or_else(|| format!("'{s}' is not a valid date"))
        }
        other => Err(format!("'{other}' is not a valid date")),
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
    Url(String),
    Choice(String),
    Choices(Vec<String>),
    Files(Vec<String>),
    User(UserId),
}

impl FieldValue {
    pub fn as_user(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) | Self::Url(s) | Self::Choice(s) => write!(f, "{s}"),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Date(dt) => write!(f, "{}", dt.format("%b %d, %Y %H:%M UTC")),
            Self::Choices(items) | Self::Files(items) => write!(f, "{}", items.join(", ")),
            Self::User(id) => write!(f, "user #{id}"),
        }
    }
}

/// A field declared on a kickoff form or task output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTemplate {
    pub api_name: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub is_required: bool,
}

impl FieldTemplate {
    pub fn new(api_name: impl Into<String>, kind: FieldKind) -> Self {
        let api_name = api_name.into();
        Self {
            name: api_name.clone(),
            api_name,
            kind,
            is_required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }
}

/// Where a field value was collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldOrigin {
    Kickoff,
    Task { api_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub api_name: String,
    pub origin: FieldOrigin,
    pub value: Option<FieldValue>,
}

/// Field values of a workflow keyed by api-name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet(BTreeMap<String, FieldEntry>);

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: FieldEntry) {
        self.0.insert(entry.api_name.clone(), entry);
    }

    pub fn get(&self, api_name: &str) -> Option<&FieldEntry> {
        self.0.get(api_name)
    }

    /// The value of a field, `None` when the field is unknown or empty.
    pub fn value(&self, api_name: &str) -> Option<&FieldValue> {
        self.0.get(api_name).and_then(|entry| entry.value.as_ref())
    }

    /// Merge `other` into this set, returning the api-names whose value changed.
    pub fn merge(&mut self, other: FieldSet) -> Vec<String> {
        let mut changed = Vec::new();
        for (api_name, entry) in other.0 {
            let differs = self
                .0
                .get(&api_name)
                .map(|current| current.value != entry.value)
                .unwrap_or(true);
            if differs {
                changed.push(api_name.clone());
            }
            self.0.insert(api_name, entry);
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldEntry> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
