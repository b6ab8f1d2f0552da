//! SQLite catalog store.
//!
//! Each upsert runs in one `BEGIN IMMEDIATE` transaction covering the entity,
//! its children and its tag links. `(source_id, external_id)` is a unique key,
//! so an insert that loses a race against another connection fails on the
//! constraint and is retried through the update path.

use super::{CatalogStore, StoredChild, StoredEntity};
use crate::config::StoreConfig;
use crate::error::{HarvestError, Result};
use crate::mapper::tags::normalize_tags;
use crate::mapper::{ChildDraft, EntityDraft, TagDraft};
use crate::models::{TagPolicy, UpsertOutcome};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Open a database file with WAL, a busy timeout and foreign keys enabled.
pub(crate) fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::Io {
                message: format!("Failed to create database directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let conn = Connection::open(path).map_err(|e| HarvestError::Database {
        message: format!("Failed to open database {}: {}", path.display(), e),
        source: Some(e),
    })?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(StoreConfig::BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
    )
    .map_err(|e| HarvestError::Database {
        message: format!("Failed to set pragmas: {}", e),
        source: Some(e),
    })
}

pub(crate) fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| HarvestError::Database {
        message: format!("Failed to lock database: {}", e),
        source: None,
    })
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarvestError::Database {
            message: format!("Invalid timestamp '{}': {}", raw, e),
            source: None,
        })
}

fn same_json(stored: &str, draft: &Value) -> bool {
    serde_json::from_str::<Value>(stored)
        .map(|value| &value == draft)
        .unwrap_or(false)
}

struct EntityRow {
    id: String,
    kind: String,
    name: String,
    description: Option<String>,
    nsfw: bool,
    version_stamp: Option<String>,
    payload: String,
}

impl EntityRow {
    fn differs_from(&self, draft: &EntityDraft) -> bool {
        self.kind != draft.kind
            || self.name != draft.name
            || self.description != draft.description
            || self.nsfw != draft.nsfw
            || self.version_stamp != draft.version_stamp
            || !same_json(&self.payload, &draft.payload)
    }
}

/// SQLite-backed [`CatalogStore`].
pub struct SqliteCatalogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalogStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(db_path.as_ref())?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = lock_conn(&self.conn)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                nsfw INTEGER NOT NULL DEFAULT 0,
                version_stamp TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (source_id, external_id)
            );

            -- Nested children are flattened; parent_key scopes them under their parent child.
            CREATE TABLE IF NOT EXISTS entity_children (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                parent_key TEXT NOT NULL DEFAULT '',
                external_id TEXT NOT NULL,
                label TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (entity_id, kind, parent_key, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_entity_children_entity
                ON entity_children(entity_id);

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                category TEXT
            );

            CREATE TABLE IF NOT EXISTS entity_tags (
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (entity_id, tag_id)
            );
            "#,
        )
        .map_err(|e| HarvestError::Database {
            message: format!("Failed to initialize catalog schema: {}", e),
            source: Some(e),
        })
    }

    fn upsert_once(
        &self,
        source_id: &str,
        draft: &EntityDraft,
        tag_policy: TagPolicy,
    ) -> Result<UpsertOutcome> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = format_timestamp(Utc::now());
        let payload = serde_json::to_string(&draft.payload)?;

        let existing = tx
            .query_row(
                "SELECT id, kind, name, description, nsfw, version_stamp, payload
                 FROM entities WHERE source_id = ?1 AND external_id = ?2",
                params![source_id, draft.external_id],
                |row| {
                    Ok(EntityRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        nsfw: row.get(4)?,
                        version_stamp: row.get(5)?,
                        payload: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let (entity_id, created, mut changed) = match existing {
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO entities
                        (id, source_id, external_id, kind, name, description, nsfw,
                         version_stamp, payload, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        id,
                        source_id,
                        draft.external_id,
                        draft.kind,
                        draft.name,
                        draft.description,
                        draft.nsfw,
                        draft.version_stamp,
                        payload,
                        now
                    ],
                )?;
                (id, true, true)
            }
            Some(row) => {
                let differs = row.differs_from(draft);
                if differs {
                    tx.execute(
                        "UPDATE entities SET kind = ?2, name = ?3, description = ?4, nsfw = ?5,
                            version_stamp = ?6, payload = ?7, updated_at = ?8
                         WHERE id = ?1",
                        params![
                            row.id,
                            draft.kind,
                            draft.name,
                            draft.description,
                            draft.nsfw,
                            draft.version_stamp,
                            payload,
                            now
                        ],
                    )?;
                }
                (row.id, false, differs)
            }
        };

        changed |= sync_children(&tx, &entity_id, "", &draft.children, &now)?;
        changed |= sync_tags(&tx, &entity_id, &draft.tags, tag_policy)?;

        if changed && !created {
            tx.execute(
                "UPDATE entities SET updated_at = ?2 WHERE id = ?1",
                params![entity_id, now],
            )?;
        }
        tx.commit()?;

        Ok(if created {
            UpsertOutcome::Created
        } else if changed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::NoOp
        })
    }
}

/// Resolve-or-create each child under `parent_key`, then recurse. Returns
/// whether anything was inserted or modified. Children are never deleted.
///
/// A later sibling with the same `(kind, external_id)` as an earlier one is
/// skipped; the first occurrence wins.
fn sync_children(
    conn: &Connection,
    entity_id: &str,
    parent_key: &str,
    children: &[ChildDraft],
    now: &str,
) -> Result<bool> {
    let mut changed = false;
    let mut seen = HashSet::new();

    for child in children {
        if !seen.insert((child.kind.as_str(), child.external_id.as_str())) {
            warn!(
                "Entity {}: dropping duplicate {} child {} under '{}'",
                entity_id, child.kind, child.external_id, parent_key
            );
            continue;
        }
        let payload = serde_json::to_string(&child.payload)?;
        let existing: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT id, label, payload FROM entity_children
                 WHERE entity_id = ?1 AND kind = ?2 AND parent_key = ?3 AND external_id = ?4",
                params![entity_id, child.kind, parent_key, child.external_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO entity_children
                        (id, entity_id, kind, parent_key, external_id, label, payload,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        entity_id,
                        child.kind,
                        parent_key,
                        child.external_id,
                        child.label,
                        payload,
                        now
                    ],
                )?;
                changed = true;
            }
            Some((id, label, stored)) => {
                if label != child.label || !same_json(&stored, &child.payload) {
                    conn.execute(
                        "UPDATE entity_children SET label = ?2, payload = ?3, updated_at = ?4
                         WHERE id = ?1",
                        params![id, child.label, payload, now],
                    )?;
                    changed = true;
                }
            }
        }

        let own_key = format!("{}/{}", child.kind, child.external_id);
        let nested_key = if parent_key.is_empty() {
            own_key
        } else {
            format!("{}/{}", parent_key, own_key)
        };
        changed |= sync_children(conn, entity_id, &nested_key, &child.children, now)?;
    }

    Ok(changed)
}

/// Link tags to the entity. Under `Reconcile`, links not in `tags` are removed.
fn sync_tags(
    conn: &Connection,
    entity_id: &str,
    tags: &[TagDraft],
    policy: TagPolicy,
) -> Result<bool> {
    let desired = normalize_tags(tags.iter().cloned());
    let mut changed = false;
    let mut desired_ids = HashSet::new();

    for tag in &desired {
        conn.execute(
            "INSERT OR IGNORE INTO tags (name, category) VALUES (?1, ?2)",
            params![tag.name, tag.category],
        )?;
        if tag.category.is_some() {
            conn.execute(
                "UPDATE tags SET category = ?2 WHERE name = ?1 AND category IS NULL",
                params![tag.name, tag.category],
            )?;
        }
        let tag_id: i64 = conn.query_row(
            "SELECT id FROM tags WHERE name = ?1",
            params![tag.name],
            |row| row.get(0),
        )?;
        desired_ids.insert(tag_id);

        let linked = conn.execute(
            "INSERT OR IGNORE INTO entity_tags (entity_id, tag_id) VALUES (?1, ?2)",
            params![entity_id, tag_id],
        )?;
        changed |= linked > 0;
    }

    if policy == TagPolicy::Reconcile {
        let current: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT tag_id FROM entity_tags WHERE entity_id = ?1")?;
            let rows = stmt.query_map(params![entity_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for stale in current.into_iter().filter(|id| !desired_ids.contains(id)) {
            conn.execute(
                "DELETE FROM entity_tags WHERE entity_id = ?1 AND tag_id = ?2",
                params![entity_id, stale],
            )?;
            changed = true;
        }
    }

    Ok(changed)
}

impl CatalogStore for SqliteCatalogStore {
    fn upsert_entity(
        &self,
        source_id: &str,
        draft: &EntityDraft,
        tag_policy: TagPolicy,
    ) -> Result<UpsertOutcome> {
        match self.upsert_once(source_id, draft, tag_policy) {
            Err(e) if e.is_constraint_violation() => {
                debug!(
                    "Insert of {}/{} hit a unique constraint, retrying as update",
                    source_id, draft.external_id
                );
                self.upsert_once(source_id, draft, tag_policy)
            }
            other => other,
        }
    }

    fn get_entity(&self, source_id: &str, external_id: &str) -> Result<Option<StoredEntity>> {
        let conn = lock_conn(&self.conn)?;

        let row = conn
            .query_row(
                "SELECT id, kind, name, description, nsfw, version_stamp, payload,
                        created_at, updated_at
                 FROM entities WHERE source_id = ?1 AND external_id = ?2",
                params![source_id, external_id],
                |row| {
                    Ok((
                        EntityRow {
                            id: row.get(0)?,
                            kind: row.get(1)?,
                            name: row.get(2)?,
                            description: row.get(3)?,
                            nsfw: row.get(4)?,
                            version_stamp: row.get(5)?,
                            payload: row.get(6)?,
                        },
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((row, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let tags: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT t.name FROM entity_tags et JOIN tags t ON t.id = et.tag_id
                 WHERE et.entity_id = ?1 ORDER BY t.name",
            )?;
            let rows = stmt.query_map(params![row.id], |r| r.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let raw_children: Vec<(String, String, String, Option<String>, String)> = {
            let mut stmt = conn.prepare(
                "SELECT kind, external_id, parent_key, label, payload FROM entity_children
                 WHERE entity_id = ?1 ORDER BY parent_key, kind, external_id",
            )?;
            let rows = stmt.query_map(params![row.id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        let children = raw_children
            .into_iter()
            .map(|(kind, external_id, parent_key, label, payload)| {
                Ok(StoredChild {
                    kind,
                    external_id,
                    parent_key,
                    label,
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(StoredEntity {
            payload: serde_json::from_str(&row.payload)?,
            id: row.id,
            source_id: source_id.to_string(),
            external_id: external_id.to_string(),
            kind: row.kind,
            name: row.name,
            description: row.description,
            nsfw: row.nsfw,
            version_stamp: row.version_stamp,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            tags,
            children,
        }))
    }

    fn count_entities(&self, source_id: &str) -> Result<u64> {
        let conn = lock_conn(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE source_id = ?1",
            params![source_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
