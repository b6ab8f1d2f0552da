//! Upstream source connectors.
//!
//! A connector fetches one page of raw records at a time. It knows nothing about
//! runs, retries or persistence; the walker drives it through the resilience
//! policy and the pipeline maps and stores what it returns.

mod http;
mod workflow_dir;

pub use http::{HttpConnectorConfig, HttpPageConnector};
pub use workflow_dir::{WorkflowDirConfig, WorkflowDirConnector};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Query filters forwarded to the upstream on every page request.
pub type Filters = BTreeMap<String, String>;

/// One record as delivered by a connector.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// A parsed upstream item.
    Item(Value),
    /// An item the connector saw but could not read. Counted as a per-record error.
    Invalid {
        external_id: Option<String>,
        message: String,
    },
}

/// One page of upstream results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Concrete token of this page, recorded as the run cursor.
    pub token: String,
    pub records: Vec<RawRecord>,
    pub next_token: Option<String>,
    /// The upstream declared this to be the final page.
    pub is_last: bool,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A paginated upstream source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Connector name for logs.
    fn name(&self) -> &str;

    /// Fetch the page identified by `token`, or the first page when `None`.
    async fn fetch_page(&self, token: Option<&str>, filters: &Filters) -> Result<Page>;
}

/// Connector selection in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorConfig {
    Http(HttpConnectorConfig),
    WorkflowDir(WorkflowDirConfig),
}

impl ConnectorConfig {
    /// Build the connector described by this config.
    pub fn build(&self, source_name: &str) -> Result<Arc<dyn SourceConnector>> {
        Ok(match self {
            ConnectorConfig::Http(config) => {
                Arc::new(HttpPageConnector::new(source_name, config.clone())?)
            }
            ConnectorConfig::WorkflowDir(config) => {
                Arc::new(WorkflowDirConnector::new(source_name, config.clone()))
            }
        })
    }
}
