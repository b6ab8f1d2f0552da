//! Pagination walker.
//!
//! Drives a [`SourceConnector`] page by page through the resilience policy.
//! Each call to [`PageWalker::next_page`] checks, in order: cancellation, the
//! page cap, then fetches. The walk ends after an empty page, after a page that
//! declares itself last or offers no next token, or once `max_pages` pages have
//! been fetched. A walker is finite and cannot be restarted; resuming means a
//! new walker seeded with a stored cursor.

use crate::cancel::CancellationToken;
use crate::connector::{Filters, Page, SourceConnector};
use crate::error::{HarvestError, Result};
use crate::resilience::ResiliencePolicy;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-walk settings.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Token of the first page to fetch; `None` starts at the beginning.
    pub start_token: Option<String>,
    pub max_pages: Option<u32>,
    /// Courtesy delay between consecutive page requests.
    pub page_delay: Duration,
    pub filters: Filters,
}

pub struct PageWalker {
    connector: Arc<dyn SourceConnector>,
    policy: Arc<ResiliencePolicy>,
    cancel: CancellationToken,
    options: WalkOptions,
    next_token: Option<String>,
    pages_fetched: u32,
    finished: bool,
}

impl PageWalker {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        policy: Arc<ResiliencePolicy>,
        cancel: CancellationToken,
        options: WalkOptions,
    ) -> Self {
        Self {
            connector,
            policy,
            cancel,
            next_token: options.start_token.clone(),
            options,
            pages_fetched: 0,
            finished: false,
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Fetch the next page, or `None` once the walk is exhausted.
    ///
    /// Returns [`HarvestError::Cancelled`] if cancellation was requested before
    /// or during the fetch.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.finished {
            return Ok(None);
        }
        self.cancel.check()?;

        if let Some(max) = self.options.max_pages {
            if self.pages_fetched >= max {
                debug!("{}: reached max_pages {}", self.connector.name(), max);
                self.finished = true;
                return Ok(None);
            }
        }

        if self.pages_fetched > 0 && !self.options.page_delay.is_zero() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(HarvestError::Cancelled),
                _ = tokio::time::sleep(self.options.page_delay) => {}
            }
        }

        let connector = &self.connector;
        let token = &self.next_token;
        let filters = &self.options.filters;
        let page = self
            .policy
            .call(&self.cancel, move || connector.fetch_page(token.as_deref(), filters))
            .await?;
        self.pages_fetched += 1;

        if page.is_empty() {
            debug!("{}: empty page {}, walk complete", self.connector.name(), page.token);
            self.finished = true;
            return Ok(None);
        }

        match (&page.next_token, page.is_last) {
            (Some(next), false) => self.next_token = Some(next.clone()),
            _ => {
                debug!("{}: last page {}", self.connector.name(), page.token);
                self.finished = true;
            }
        }
        Ok(Some(page))
    }

    /// Adapt the walker into a stream of pages. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page>> {
        stream::unfold(Some(self), |state| async move {
            let mut walker = state?;
            match walker.next_page().await {
                Ok(Some(page)) => Some((Ok(page), Some(walker))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::RawRecord;
    use crate::resilience::{CircuitBreakerConfig, RetryConfig};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves `pages[i]` for token `i`; a page with no records is empty.
    struct NumberedPages {
        sizes: Vec<usize>,
        last_is_declared: bool,
        requested: Mutex<Vec<Option<String>>>,
    }

    impl NumberedPages {
        fn new(sizes: Vec<usize>) -> Self {
            Self {
                sizes,
                last_is_declared: false,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for NumberedPages {
        fn name(&self) -> &str {
            "numbered"
        }

        async fn fetch_page(&self, token: Option<&str>, _filters: &Filters) -> Result<Page> {
            self.requested.lock().unwrap().push(token.map(str::to_string));
            let index: usize = token.map(|t| t.parse().unwrap()).unwrap_or(0);
            let size = self.sizes.get(index).copied().unwrap_or(0);
            let is_last = self.last_is_declared && index + 1 == self.sizes.len();
            Ok(Page {
                token: index.to_string(),
                records: (0..size)
                    .map(|i| RawRecord::Item(json!({"id": format!("{}-{}", index, i)})))
                    .collect(),
                next_token: Some((index + 1).to_string()),
                is_last,
            })
        }
    }

    fn policy() -> Arc<ResiliencePolicy> {
        Arc::new(ResiliencePolicy::new(
            "numbered",
            RetryConfig::new().with_max_attempts(1),
            CircuitBreakerConfig::default(),
        ))
    }

    fn walker(connector: Arc<NumberedPages>, options: WalkOptions) -> PageWalker {
        PageWalker::new(connector, policy(), CancellationToken::new(), options)
    }

    #[tokio::test]
    async fn test_stops_on_empty_page() {
        let connector = Arc::new(NumberedPages::new(vec![2, 3, 0, 5]));
        let pages: Vec<Page> = walker(connector.clone(), WalkOptions::default())
            .into_stream()
            .map(|p| p.unwrap())
            .collect()
            .await;

        assert_eq!(pages.len(), 2);
        assert_eq!(connector.requested.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stops_on_declared_last_page() {
        let mut source = NumberedPages::new(vec![1, 1]);
        source.last_is_declared = true;
        let connector = Arc::new(source);
        let mut walker = walker(connector.clone(), WalkOptions::default());

        assert!(walker.next_page().await.unwrap().is_some());
        assert!(walker.next_page().await.unwrap().unwrap().is_last);
        assert!(walker.next_page().await.unwrap().is_none());
        assert_eq!(connector.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_respects_max_pages() {
        let connector = Arc::new(NumberedPages::new(vec![1; 10]));
        let options = WalkOptions {
            max_pages: Some(3),
            ..Default::default()
        };
        let mut walker = walker(connector.clone(), options);
        let mut count = 0;
        while walker.next_page().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(walker.pages_fetched(), 3);
    }

    #[tokio::test]
    async fn test_starts_from_token() {
        let connector = Arc::new(NumberedPages::new(vec![1, 1, 1]));
        let options = WalkOptions {
            start_token: Some("2".into()),
            ..Default::default()
        };
        let mut walker = walker(connector.clone(), options);
        let page = walker.next_page().await.unwrap().unwrap();
        assert_eq!(page.token, "2");
        assert_eq!(
            connector.requested.lock().unwrap()[0].as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_cancel_before_fetch() {
        let connector = Arc::new(NumberedPages::new(vec![1, 1]));
        let cancel = CancellationToken::new();
        let mut walker = PageWalker::new(connector.clone(), policy(), cancel.clone(), WalkOptions::default());

        assert!(walker.next_page().await.unwrap().is_some());
        cancel.cancel();
        assert!(matches!(walker.next_page().await, Err(HarvestError::Cancelled)));
        assert_eq!(connector.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_page_delay() {
        let connector = Arc::new(NumberedPages::new(vec![1, 1]));
        let cancel = CancellationToken::new();
        let options = WalkOptions {
            page_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let mut walker = PageWalker::new(connector, policy(), cancel.clone(), options);
        walker.next_page().await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), walker.next_page()).await;
        assert!(matches!(result, Ok(Err(HarvestError::Cancelled))));
    }
}
