//! Catalog store and the idempotent upsert engine.

mod sqlite;

pub use sqlite::SqliteCatalogStore;
pub(crate) use sqlite::{format_timestamp, lock_conn, open_database, parse_timestamp};

use crate::error::Result;
use crate::mapper::EntityDraft;
use crate::models::{TagPolicy, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// An ingested entity as persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEntity {
    pub id: String,
    pub source_id: String,
    pub external_id: String,
    pub kind: String,
    pub name: String,
    pub description: Option<String>,
    pub nsfw: bool,
    pub version_stamp: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Linked tag names, sorted.
    pub tags: Vec<String>,
    pub children: Vec<StoredChild>,
}

/// A child row. `parent_key` is empty for direct children of the entity and
/// `kind/external_id` of the enclosing child for nested ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChild {
    pub kind: String,
    pub external_id: String,
    pub parent_key: String,
    pub label: Option<String>,
    pub payload: Value,
}

/// Persistent catalog of ingested entities.
pub trait CatalogStore: Send + Sync {
    /// Create or update the entity keyed by `(source_id, draft.external_id)`
    /// together with its children and tag links, in one transaction.
    fn upsert_entity(
        &self,
        source_id: &str,
        draft: &EntityDraft,
        tag_policy: TagPolicy,
    ) -> Result<UpsertOutcome>;

    fn get_entity(&self, source_id: &str, external_id: &str) -> Result<Option<StoredEntity>>;

    fn count_entities(&self, source_id: &str) -> Result<u64>;
}
