//! Cached item types and shape validation
//!
//! Values that enter from outside the coordinator's control (query-cache
//! reads, durable snapshots, caller writes) pass through [`validate_value`]
//! or [`validate_item`] first. Anything that is not exactly the expected
//! shape is rejected.

use crate::cache::key::{CacheKey, Namespace};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub key: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            url: url.into(),
            category: None,
            alt_text: None,
            width: None,
            height: None,
            tags: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// Anything the coordinator caches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedItem {
    Record(ImageRecord),
    Url(String),
}

impl CachedItem {
    pub fn as_record(&self) -> Option<&ImageRecord> {
        match self {
            CachedItem::Record(r) => Some(r),
            CachedItem::Url(_) => None,
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            CachedItem::Url(u) => Some(u),
            CachedItem::Record(_) => None,
        }
    }

    pub fn into_record(self) -> Option<ImageRecord> {
        match self {
            CachedItem::Record(r) => Some(r),
            CachedItem::Url(_) => None,
        }
    }

    pub fn into_url(self) -> Option<String> {
        match self {
            CachedItem::Url(u) => Some(u),
            CachedItem::Record(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CachedItem::Record(_) => "record",
            CachedItem::Url(_) => "url",
        }
    }
}

impl From<ImageRecord> for CachedItem {
    fn from(r: ImageRecord) -> Self {
        CachedItem::Record(r)
    }
}

/// Outcome of a shape check
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Valid(T),
    Invalid(String),
}

impl<T> Validation<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    /// `Some` for valid values, dropping the rejection reason
    pub fn ok(self) -> Option<T> {
        match self {
            Validation::Valid(v) => Some(v),
            Validation::Invalid(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Validation::Valid(v) => Ok(v),
            Validation::Invalid(reason) => Err(reason),
        }
    }
}

fn non_empty_str<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a str, String> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) => Err(format!("field '{}' is empty", field)),
        Some(other) => Err(format!("field '{}' must be a string, got {}", field, type_name(other))),
        None => Err(format!("missing required field '{}'", field)),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check a raw JSON value against the image record shape
pub fn validate_record(value: &Value) -> Validation<ImageRecord> {
    let Some(obj) = value.as_object() else {
        return Validation::Invalid(format!("expected object, got {}", type_name(value)));
    };

    for field in ["id", "key", "url"] {
        if let Err(reason) = non_empty_str(obj, field) {
            return Validation::Invalid(reason);
        }
    }

    match serde_json::from_value::<ImageRecord>(value.clone()) {
        Ok(record) => Validation::Valid(record),
        Err(e) => Validation::Invalid(format!("optional field has wrong type: {}", e)),
    }
}

/// Check a URL string
pub fn validate_url(url: &str) -> Validation<String> {
    if url.trim().is_empty() {
        Validation::Invalid("url is empty".to_string())
    } else {
        Validation::Valid(url.to_string())
    }
}

/// Check a raw JSON value against what `key`'s namespace expects.
///
/// URL namespaces accept a bare string or a `{url, ...}` object.
pub fn validate_value(key: &CacheKey, value: &Value) -> Validation<CachedItem> {
    match key.namespace {
        Namespace::Image => match validate_record(value) {
            Validation::Valid(r) => Validation::Valid(CachedItem::Record(r)),
            Validation::Invalid(reason) => Validation::Invalid(reason),
        },
        _ => {
            let url = match value {
                Value::String(s) => s.as_str(),
                Value::Object(obj) => match obj.get("url") {
                    Some(Value::String(s)) => s.as_str(),
                    Some(other) => {
                        return Validation::Invalid(format!(
                            "field 'url' must be a string, got {}",
                            type_name(other)
                        ))
                    }
                    None => return Validation::Invalid("missing required field 'url'".to_string()),
                },
                other => {
                    return Validation::Invalid(format!(
                        "expected string or object, got {}",
                        type_name(other)
                    ))
                }
            };
            match validate_url(url) {
                Validation::Valid(u) => Validation::Valid(CachedItem::Url(u)),
                Validation::Invalid(reason) => Validation::Invalid(reason),
            }
        }
    }
}

/// Check a typed item against the key it is about to be stored under
pub fn validate_item(key: &CacheKey, item: &CachedItem) -> Validation<()> {
    match (key.namespace.holds_url(), item) {
        (false, CachedItem::Record(record)) => {
            for (field, value) in [("id", &record.id), ("key", &record.key), ("url", &record.url)] {
                if value.trim().is_empty() {
                    return Validation::Invalid(format!("field '{}' is empty", field));
                }
            }
            Validation::Valid(())
        }
        (true, CachedItem::Url(url)) => match validate_url(url) {
            Validation::Valid(_) => Validation::Valid(()),
            Validation::Invalid(reason) => Validation::Invalid(reason),
        },
        _ => Validation::Invalid(format!(
            "{} item cannot be stored under '{}'",
            item.kind(),
            key
        )),
    }
}
