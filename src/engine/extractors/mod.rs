//! Record extraction.
//!
//! Maps a decoded JSON payload onto the flat [`ExtractedRecord`] schema by
//! reading a fixed set of dotted field paths. Missing or mistyped fields are
//! recorded as unknown (`None`) rather than failing the whole payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// Output unit of the engine.
///
/// Every field is always present in the serialized shape; unknown values
/// serialize as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRecord {
    pub product_id: Option<u64>,
    pub shop_id: Option<u64>,
    pub name: Option<String>,
    pub price: Option<Number>,
    pub stock: Option<u64>,
    pub rating_star: Option<f64>,
    pub sold_count: Option<u64>,
    pub description: Option<String>,
    pub images: Option<Vec<String>>,
    pub source_url: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Dotted paths read from the payload for each record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPaths {
    pub product_id: String,
    pub shop_id: String,
    pub name: String,
    pub price: String,
    pub stock: String,
    pub rating_star: String,
    pub sold_count: String,
    pub description: String,
    pub images: String,
}

impl Default for FieldPaths {
    fn default() -> Self {
        Self {
            product_id: "item.itemid".into(),
            shop_id: "item.shopid".into(),
            name: "item.name".into(),
            price: "item.price".into(),
            stock: "item.stock".into(),
            rating_star: "item.item_rating.rating_star".into(),
            sold_count: "item.sold".into(),
            description: "item.description".into(),
            images: "item.images".into(),
        }
    }
}

/// Turns decoded payload text into [`ExtractedRecord`]s.
#[derive(Debug, Clone)]
pub struct RecordExtractor {
    paths: FieldPaths,
    required_root: Option<String>,
}

impl RecordExtractor {
    pub fn new(paths: FieldPaths) -> Self {
        Self {
            paths,
            required_root: Some("item".into()),
        }
    }

    /// Require an object at `root` before a payload counts as a record.
    /// `None` accepts any JSON object.
    pub fn with_required_root(mut self, root: Option<String>) -> Self {
        self.required_root = root.filter(|r| !r.is_empty());
        self
    }

    pub fn paths(&self) -> &FieldPaths {
        &self.paths
    }

    pub fn extract(&self, payload: &str) -> Result<ExtractedRecord, ExtractionError> {
        self.extract_with_source(payload, None)
    }

    pub fn extract_with_source(
        &self,
        payload: &str,
        source_url: Option<&str>,
    ) -> Result<ExtractedRecord, ExtractionError> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|err| ExtractionError::MalformedPayload(err.to_string()))?;
        self.extract_value(&value, source_url)
    }

    pub fn extract_value(
        &self,
        value: &Value,
        source_url: Option<&str>,
    ) -> Result<ExtractedRecord, ExtractionError> {
        if !value.is_object() {
            return Err(ExtractionError::MalformedPayload(format!(
                "expected a JSON object, found {}",
                json_kind(value)
            )));
        }
        if let Some(root) = self.required_root.as_deref()
            && !lookup(value, root).is_some_and(Value::is_object)
        {
            return Err(ExtractionError::MalformedPayload(format!(
                "missing `{root}` object"
            )));
        }

        let paths = &self.paths;
        Ok(ExtractedRecord {
            product_id: lookup(value, &paths.product_id).and_then(as_u64),
            shop_id: lookup(value, &paths.shop_id).and_then(as_u64),
            name: lookup(value, &paths.name).and_then(as_string),
            price: lookup(value, &paths.price).and_then(as_number),
            stock: lookup(value, &paths.stock).and_then(as_u64),
            rating_star: lookup(value, &paths.rating_star).and_then(as_f64),
            sold_count: lookup(value, &paths.sold_count).and_then(as_u64),
            description: lookup(value, &paths.description).and_then(as_string),
            images: lookup(value, &paths.images).and_then(as_image_list),
            source_url: source_url.map(str::to_string),
            extracted_at: Utc::now(),
        })
    }
}

impl Default for RecordExtractor {
    fn default() -> Self {
        Self::new(FieldPaths::default())
    }
}

/// Resolve a dotted path. Numeric segments index into arrays; `null` counts
/// as missing.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!current.is_null()).then_some(current)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => serde_json::from_str::<Number>(s.trim()).ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Image lists come either as bare ids or as `{ "image": id }` objects.
fn as_image_list(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map.get("image").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
    )
}
