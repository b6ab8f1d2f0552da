//! Page-number paginated JSON HTTP connector.
//!
//! Requests `base_url?{page_param}=N&{limit_param}=M&<filters>` and extracts the
//! item array and optional total page count with JSON pointers. The page token
//! is the page number as a decimal string.

use super::{Filters, Page, RawRecord, SourceConnector};
use crate::config::{IngestConfig, NetworkConfig};
use crate::error::{HarvestError, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Longest slice of an error body kept in `Upstream` messages.
const ERROR_BODY_LIMIT: usize = 512;

/// Configuration for [`HttpPageConnector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConnectorConfig {
    pub base_url: String,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_limit_param")]
    pub limit_param: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_first_page")]
    pub first_page: u64,
    /// Pointer to the item array; empty means the body itself is the array.
    #[serde(default)]
    pub items_pointer: String,
    /// Pointer to the total page count, e.g. `/metadata/totalPages`.
    #[serde(default)]
    pub total_pages_pointer: Option<String>,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

fn default_page_size() -> u32 {
    IngestConfig::DEFAULT_PAGE_SIZE
}

fn default_first_page() -> u64 {
    1
}

impl HttpConnectorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            page_param: default_page_param(),
            limit_param: default_limit_param(),
            page_size: default_page_size(),
            first_page: default_first_page(),
            items_pointer: String::new(),
            total_pages_pointer: None,
            api_key_env: None,
            timeout_secs: None,
        }
    }
}

/// Connector for page-number paginated JSON APIs.
pub struct HttpPageConnector {
    name: String,
    config: HttpConnectorConfig,
    base_url: Url,
    client: Client,
    timeout: Duration,
    api_key: Option<String>,
}

impl HttpPageConnector {
    pub fn new(name: impl Into<String>, config: HttpConnectorConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| HarvestError::Config {
            message: format!("Invalid base_url {}: {}", config.base_url, e),
        })?;
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(NetworkConfig::REQUEST_TIMEOUT);

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| HarvestError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        Ok(Self {
            name: name.into(),
            config,
            base_url,
            client,
            timeout,
            api_key,
        })
    }

    /// Map a reqwest failure, reporting timeouts with the configured limit.
    fn transport_error(&self, err: reqwest::Error) -> HarvestError {
        if err.is_timeout() {
            HarvestError::Timeout(self.timeout)
        } else {
            HarvestError::from(err)
        }
    }

    fn parse_token(&self, token: Option<&str>) -> Result<u64> {
        match token {
            None => Ok(self.config.first_page),
            Some(raw) => raw.parse().map_err(|_| HarvestError::Validation {
                field: "page_token".into(),
                message: format!("{} is not a page number", raw),
            }),
        }
    }

    /// Build the request URL for `page`.
    pub fn page_url(&self, page: u64, filters: &Filters) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.config.page_param, &page.to_string());
            query.append_pair(&self.config.limit_param, &self.config.page_size.to_string());
            for (key, value) in filters {
                query.append_pair(key, value);
            }
        }
        url
    }

    /// Turn a response body into a page.
    pub fn parse_body(&self, page: u64, body: Value) -> Result<Page> {
        let total_pages = self
            .config
            .total_pages_pointer
            .as_deref()
            .and_then(|pointer| body.pointer(pointer))
            .and_then(Value::as_u64);

        let items = match body.pointer(&self.config.items_pointer) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None if !self.config.items_pointer.is_empty() => Vec::new(),
            _ => {
                return Err(HarvestError::Json {
                    message: format!(
                        "{}: response has no item array at '{}'",
                        self.name, self.config.items_pointer
                    ),
                    source: None,
                })
            }
        };

        let is_last = match total_pages {
            Some(total) => page >= total,
            None => (items.len() as u64) < u64::from(self.config.page_size),
        };

        Ok(Page {
            token: page.to_string(),
            next_token: (!is_last).then(|| (page + 1).to_string()),
            is_last,
            records: items.into_iter().map(RawRecord::Item).collect(),
        })
    }
}

#[async_trait]
impl SourceConnector for HttpPageConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, token: Option<&str>, filters: &Filters) -> Result<Page> {
        let page = self.parse_token(token)?;
        let url = self.page_url(page, filters);
        debug!("{}: GET {}", self.name, url);

        let mut request = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(HarvestError::Upstream {
                source_name: self.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_body(page, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connector(config: HttpConnectorConfig) -> HttpPageConnector {
        HttpPageConnector::new("models", config).unwrap()
    }

    #[test]
    fn test_page_url_includes_filters() {
        let c = connector(HttpConnectorConfig::new("https://example.com/api/v1/models"));
        let mut filters = Filters::new();
        filters.insert("sort".into(), "Newest".into());

        let url = c.page_url(3, &filters);
        assert_eq!(
            url.as_str(),
            "https://example.com/api/v1/models?page=3&limit=100&sort=Newest"
        );
    }

    #[test]
    fn test_parse_body_with_total_pages() {
        let mut config = HttpConnectorConfig::new("https://example.com/api");
        config.items_pointer = "/items".into();
        config.total_pages_pointer = Some("/metadata/totalPages".into());
        let c = connector(config);

        let page = c
            .parse_body(1, json!({"items": [{"id": 1}, {"id": 2}], "metadata": {"totalPages": 2}}))
            .unwrap();
        assert_eq!(page.token, "1");
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_token.as_deref(), Some("2"));
        assert!(!page.is_last);

        let page = c
            .parse_body(2, json!({"items": [{"id": 3}], "metadata": {"totalPages": 2}}))
            .unwrap();
        assert!(page.is_last);
        assert!(page.next_token.is_none());
    }

    #[test]
    fn test_short_page_is_last_without_total() {
        let mut config = HttpConnectorConfig::new("https://example.com/posts.json");
        config.page_size = 2;
        let c = connector(config);

        let page = c.parse_body(1, json!([{"id": 1}])).unwrap();
        assert!(page.is_last);

        let page = c.parse_body(1, json!([{"id": 1}, {"id": 2}])).unwrap();
        assert!(!page.is_last);
    }

    #[test]
    fn test_missing_item_array_is_error() {
        let c = connector(HttpConnectorConfig::new("https://example.com/api"));
        let err = c.parse_body(1, json!({"error": "nope"})).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_bad_token_rejected() {
        let c = connector(HttpConnectorConfig::new("https://example.com/api"));
        assert!(c.parse_token(Some("abc")).is_err());
        assert_eq!(c.parse_token(None).unwrap(), 1);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpPageConnector::new("x", HttpConnectorConfig::new("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_body_timeout_reports_configured_limit() {
        use std::io::{Read, Write};

        // Sends headers and the start of a body, then stalls.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 64\r\n\r\n[",
            );
            let _ = stream.flush();
            std::thread::sleep(Duration::from_secs(3));
        });

        let mut config = HttpConnectorConfig::new(format!("http://{}/items", addr));
        config.timeout_secs = Some(1);
        let err = connector(config)
            .fetch_page(None, &Filters::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, HarvestError::Timeout(limit) if limit == Duration::from_secs(1)),
            "unexpected error: {:?}",
            err
        );
        assert!(err.is_retryable());
        server.join().unwrap();
    }
}
