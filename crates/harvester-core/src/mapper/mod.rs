//! Mapping from raw upstream records to entity drafts.

mod json;
pub mod tags;

pub use json::{ChildSpec, JsonMapper, JsonMapperConfig, TagField};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The projection of one upstream record that the upsert engine stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub external_id: String,
    pub kind: String,
    pub name: String,
    pub description: Option<String>,
    pub nsfw: bool,
    /// Upstream version or update stamp, compared verbatim.
    pub version_stamp: Option<String>,
    pub payload: Value,
    pub children: Vec<ChildDraft>,
    pub tags: Vec<TagDraft>,
}

impl EntityDraft {
    pub fn new(external_id: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            kind: kind.into(),
            name: name.into(),
            description: None,
            nsfw: false,
            version_stamp: None,
            payload: Value::Null,
            children: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// A child entity (version, artifact, image), unique by kind and id under its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildDraft {
    pub kind: String,
    pub external_id: String,
    pub label: Option<String>,
    pub payload: Value,
    pub children: Vec<ChildDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDraft {
    pub name: String,
    pub category: Option<String>,
}

/// Turns raw records of one source into entity drafts.
pub trait EntityMapper: Send + Sync {
    /// Extract only the external id, used for logging failed records.
    fn external_id(&self, record: &Value) -> Result<String>;

    fn map(&self, record: &Value) -> Result<EntityDraft>;
}
