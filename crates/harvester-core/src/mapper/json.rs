//! Configurable JSON-pointer mapper.

use super::tags::normalize_tags;
use super::{ChildDraft, EntityDraft, EntityMapper, TagDraft};
use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where the mapper finds each field in a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonMapperConfig {
    #[serde(default = "default_id_pointer")]
    pub id_pointer: String,
    #[serde(default = "default_name_pointer")]
    pub name_pointer: String,
    #[serde(default = "default_description_pointer")]
    pub description_pointer: Option<String>,
    #[serde(default = "default_nsfw_pointer")]
    pub nsfw_pointer: Option<String>,
    /// Single-letter rating code (`g`, `s`, `q`, `e`).
    #[serde(default)]
    pub rating_pointer: Option<String>,
    #[serde(default = "default_version_pointer")]
    pub version_pointer: Option<String>,
    /// Kind used when `kind_pointer` is unset or absent in the record.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub kind_pointer: Option<String>,
    /// Fields copied into the payload; empty keeps the whole record.
    #[serde(default)]
    pub payload_pointers: Vec<String>,
    #[serde(default = "default_tag_fields")]
    pub tags: Vec<TagField>,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

/// A tag source inside the record.
///
/// The value may be an array of strings, an array of objects (read via
/// `name_pointer`), or one space-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagField {
    pub pointer: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub name_pointer: Option<String>,
}

/// A nested child collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub kind: String,
    pub array_pointer: String,
    #[serde(default = "default_id_pointer")]
    pub id_pointer: String,
    /// Used when `id_pointer` is missing, e.g. `/hashes/SHA256` for artifacts.
    #[serde(default)]
    pub fallback_id_pointer: Option<String>,
    #[serde(default)]
    pub label_pointer: Option<String>,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

fn default_id_pointer() -> String {
    "/id".to_string()
}

fn default_name_pointer() -> String {
    "/name".to_string()
}

fn default_description_pointer() -> Option<String> {
    Some("/description".to_string())
}

fn default_nsfw_pointer() -> Option<String> {
    Some("/nsfw".to_string())
}

fn default_version_pointer() -> Option<String> {
    Some("/updated_at".to_string())
}

fn default_kind() -> String {
    "item".to_string()
}

fn default_tag_fields() -> Vec<TagField> {
    vec![TagField {
        pointer: "/tags".to_string(),
        category: None,
        name_pointer: None,
    }]
}

impl Default for JsonMapperConfig {
    fn default() -> Self {
        Self {
            id_pointer: default_id_pointer(),
            name_pointer: default_name_pointer(),
            description_pointer: default_description_pointer(),
            nsfw_pointer: default_nsfw_pointer(),
            rating_pointer: None,
            version_pointer: default_version_pointer(),
            kind: default_kind(),
            kind_pointer: None,
            payload_pointers: Vec::new(),
            tags: default_tag_fields(),
            children: Vec::new(),
        }
    }
}

/// Expand a rating code to its word form. Unknown codes pass through lower-cased.
pub fn normalize_rating(code: &str) -> String {
    match code.trim().to_lowercase().as_str() {
        "g" | "general" => "general".to_string(),
        "s" | "sensitive" => "sensitive".to_string(),
        "q" | "questionable" => "questionable".to_string(),
        "e" | "explicit" => "explicit".to_string(),
        other => other.to_string(),
    }
}

/// Read a scalar as a string. Numbers are rendered in decimal.
fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pointer_str(record: &Value, pointer: Option<&str>) -> Option<String> {
    pointer.and_then(|p| scalar_string(record.pointer(p)))
}

/// `/stats/downloadCount` -> `stats.downloadCount`
fn pointer_key(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}

/// Mapper driven by [`JsonMapperConfig`].
#[derive(Debug, Clone, Default)]
pub struct JsonMapper {
    config: JsonMapperConfig,
}

impl JsonMapper {
    pub fn new(config: JsonMapperConfig) -> Self {
        Self { config }
    }

    fn payload(&self, record: &Value) -> Value {
        if self.config.payload_pointers.is_empty() {
            return strip_child_arrays(record, &self.config.children);
        }
        let mut payload = Map::new();
        for pointer in &self.config.payload_pointers {
            if let Some(value) = record.pointer(pointer) {
                payload.insert(pointer_key(pointer), value.clone());
            }
        }
        Value::Object(payload)
    }

    fn tags(&self, record: &Value) -> Vec<TagDraft> {
        let mut tags = Vec::new();
        for field in &self.config.tags {
            let push = |tags: &mut Vec<TagDraft>, name: &str| {
                tags.push(TagDraft {
                    name: name.to_string(),
                    category: field.category.clone(),
                })
            };
            match record.pointer(&field.pointer) {
                Some(Value::Array(items)) => {
                    for item in items {
                        let name = match (&field.name_pointer, item) {
                            (Some(p), _) => item.pointer(p).and_then(Value::as_str),
                            (None, Value::String(s)) => Some(s.as_str()),
                            _ => None,
                        };
                        if let Some(name) = name {
                            push(&mut tags, name);
                        }
                    }
                }
                Some(Value::String(joined)) => {
                    for name in joined.split_whitespace() {
                        push(&mut tags, name);
                    }
                }
                _ => {}
            }
        }
        if let Some(rating) = pointer_str(record, self.config.rating_pointer.as_deref()) {
            tags.push(TagDraft {
                name: normalize_rating(&rating),
                category: Some("rating".to_string()),
            });
        }
        normalize_tags(tags)
    }

    fn nsfw(&self, record: &Value) -> bool {
        if let Some(flag) = self
            .config
            .nsfw_pointer
            .as_deref()
            .and_then(|p| record.pointer(p))
            .and_then(Value::as_bool)
        {
            return flag;
        }
        pointer_str(record, self.config.rating_pointer.as_deref())
            .map(|code| matches!(normalize_rating(&code).as_str(), "questionable" | "explicit"))
            .unwrap_or(false)
    }
}

fn strip_child_arrays(element: &Value, specs: &[ChildSpec]) -> Value {
    let mut payload = element.clone();
    if let Value::Object(obj) = &mut payload {
        for spec in specs {
            let key = spec.array_pointer.trim_start_matches('/');
            if !key.contains('/') {
                obj.remove(key);
            }
        }
    }
    payload
}

fn map_children(
    parent: &Value,
    parent_id: &str,
    specs: &[ChildSpec],
) -> Result<Vec<ChildDraft>> {
    let mut children = Vec::new();
    for spec in specs {
        let Some(items) = parent.pointer(&spec.array_pointer).and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let external_id = scalar_string(item.pointer(&spec.id_pointer))
                .or_else(|| pointer_str(item, spec.fallback_id_pointer.as_deref()))
                .ok_or_else(|| {
                    HarvestError::mapping(
                        Some(parent_id),
                        format!("{} child has no id at {}", spec.kind, spec.id_pointer),
                    )
                })?;
            children.push(ChildDraft {
                kind: spec.kind.clone(),
                label: pointer_str(item, spec.label_pointer.as_deref()),
                payload: strip_child_arrays(item, &spec.children),
                children: map_children(item, parent_id, &spec.children)?,
                external_id,
            });
        }
    }
    Ok(children)
}

impl EntityMapper for JsonMapper {
    fn external_id(&self, record: &Value) -> Result<String> {
        scalar_string(record.pointer(&self.config.id_pointer)).ok_or_else(|| {
            HarvestError::mapping(None, format!("missing id at {}", self.config.id_pointer))
        })
    }

    fn map(&self, record: &Value) -> Result<EntityDraft> {
        let external_id = self.external_id(record)?;
        let name = pointer_str(record, Some(self.config.name_pointer.as_str())).ok_or_else(|| {
            HarvestError::mapping(
                Some(&external_id),
                format!("missing name at {}", self.config.name_pointer),
            )
        })?;
        let kind = pointer_str(record, self.config.kind_pointer.as_deref())
            .unwrap_or_else(|| self.config.kind.clone());

        Ok(EntityDraft {
            kind,
            name,
            description: pointer_str(record, self.config.description_pointer.as_deref()),
            nsfw: self.nsfw(record),
            version_stamp: pointer_str(record, self.config.version_pointer.as_deref()),
            payload: self.payload(record),
            children: map_children(record, &external_id, &self.config.children)?,
            tags: self.tags(record),
            external_id,
        })
    }
}
