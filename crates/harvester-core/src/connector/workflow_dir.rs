//! Local workflow directory connector.
//!
//! Scans base directories for workflow graph files and serves them in pages of
//! the sorted file list. The page token is the offset into that list. A file
//! that cannot be read or parsed becomes a [`RawRecord::Invalid`] instead of
//! failing the page.

use super::{Filters, Page, RawRecord, SourceConnector};
use crate::config::IngestConfig;
use crate::error::{HarvestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Configuration for [`WorkflowDirConnector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDirConfig {
    pub base_dirs: Vec<PathBuf>,
    /// File extensions to include, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Case-insensitive path substrings to skip.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_extensions() -> Vec<String> {
    IngestConfig::DEFAULT_WORKFLOW_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_page_size() -> usize {
    IngestConfig::DEFAULT_PAGE_SIZE as usize
}

impl WorkflowDirConfig {
    pub fn new(base_dirs: Vec<PathBuf>) -> Self {
        Self {
            base_dirs,
            extensions: default_extensions(),
            exclude: Vec::new(),
            page_size: default_page_size(),
        }
    }
}

/// Connector over workflow files on disk.
pub struct WorkflowDirConnector {
    name: String,
    config: WorkflowDirConfig,
}

impl WorkflowDirConnector {
    pub fn new(name: impl Into<String>, config: WorkflowDirConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Find workflow files under the configured directories, sorted and deduplicated.
fn discover(config: &WorkflowDirConfig) -> Vec<PathBuf> {
    let excludes: Vec<String> = config.exclude.iter().map(|e| e.to_lowercase()).collect();
    let mut files = Vec::new();

    for base in &config.base_dirs {
        if !base.is_dir() {
            debug!("Skipping missing workflow directory {}", base.display());
            continue;
        }
        for entry in WalkDir::new(base)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let matches_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| {
                    config
                        .extensions
                        .iter()
                        .any(|wanted| wanted.eq_ignore_ascii_case(ext))
                })
                .unwrap_or(false);
            if !matches_ext {
                continue;
            }
            let lowered = path.to_string_lossy().to_lowercase();
            if excludes.iter().any(|ex| lowered.contains(ex.as_str())) {
                continue;
            }
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    files.dedup();
    files
}

/// Count graph nodes: a `nodes` array (UI format) or numeric top-level keys (API format).
fn count_nodes(graph: &Value) -> usize {
    if let Some(nodes) = graph.get("nodes").and_then(Value::as_array) {
        return nodes.len();
    }
    graph
        .as_object()
        .map(|obj| obj.keys().filter(|k| k.parse::<u64>().is_ok()).count())
        .unwrap_or(0)
}

fn parse_workflow(path: &Path) -> RawRecord {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            return RawRecord::Invalid {
                external_id: file_name,
                message: format!("Failed to read {}: {}", path.display(), e),
            }
        }
    };
    let graph: Value = match serde_json::from_str(&contents) {
        Ok(graph) => graph,
        Err(e) => {
            return RawRecord::Invalid {
                external_id: file_name,
                message: format!("Invalid workflow JSON in {}: {}", path.display(), e),
            }
        }
    };

    let name = graph
        .pointer("/extra/ds/workflow_name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        });

    let updated_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

    RawRecord::Item(json!({
        "id": file_name,
        "name": name,
        "path": path.to_string_lossy(),
        "node_count": count_nodes(&graph),
        "updated_at": updated_at,
        "graph": graph,
    }))
}

#[async_trait]
impl SourceConnector for WorkflowDirConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, token: Option<&str>, _filters: &Filters) -> Result<Page> {
        let offset: usize = match token {
            None => 0,
            Some(raw) => raw.parse().map_err(|_| HarvestError::Validation {
                field: "page_token".into(),
                message: format!("{} is not a file offset", raw),
            })?,
        };
        let config = self.config.clone();
        let page_size = config.page_size.max(1);

        let (records, total) = tokio::task::spawn_blocking(move || {
            let files = discover(&config);
            let total = files.len();
            let records: Vec<RawRecord> = files
                .iter()
                .skip(offset)
                .take(page_size)
                .map(|path| parse_workflow(path))
                .collect();
            (records, total)
        })
        .await
        .map_err(|e| HarvestError::Other(format!("Workflow scan task failed: {}", e)))?;

        let invalid = records
            .iter()
            .filter(|r| matches!(r, RawRecord::Invalid { .. }))
            .count();
        if invalid > 0 {
            warn!("{}: {} unreadable workflow file(s) at offset {}", self.name, invalid, offset);
        }

        let end = offset + records.len();
        let is_last = end >= total;
        Ok(Page {
            token: offset.to_string(),
            records,
            next_token: (!is_last).then(|| end.to_string()),
            is_last,
        })
    }
}
