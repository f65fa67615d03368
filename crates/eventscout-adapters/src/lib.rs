//! Source adapter contract and the configuration-driven listing adapter.

mod config;
pub mod detail;
pub mod listing;
pub mod sanitize;

use std::time::Duration;

use async_trait::async_trait;
use eventscout_core::EventCandidate;
use eventscout_storage::{FetchError, FetchMode, PageSource};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub use config::{
    EmbeddedJsonRules, ExtractRules, FieldRule, HeadingBlockRules, ListingTarget, Pagination,
    SelectorRules, SourceConfig, SourceRegistry, SplitRule,
};
pub use detail::{merge_external, DetailParser, ParsedDetail};

pub const CRATE_NAME: &str = "eventscout-adapters";

/// Per-cycle settings shared by every adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub cycle: u64,
    /// Pause between consecutive listing pages of one source.
    pub page_delay: Duration,
}

impl AdapterContext {
    pub fn new(cycle: u64, page_delay: Duration) -> Self {
        Self { cycle, page_delay }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source {source_name} has no listing urls")]
    NoListingUrls { source_name: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn scrape(
        &self,
        pages: &dyn PageSource,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError>;
}

/// Adapter for one `sources.yaml` entry: fetches its listing pages and runs
/// the configured extraction over each.
#[derive(Debug, Clone)]
pub struct ListingAdapter {
    source: SourceConfig,
}

impl ListingAdapter {
    pub fn new(source: SourceConfig) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    fn page_delay(&self, ctx: &AdapterContext) -> Duration {
        self.source
            .page_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.page_delay)
    }

    async fn fetch_listing(&self, pages: &dyn PageSource, url: &str) -> Result<String, FetchError> {
        let body = pages.fetch_page(self.source.fetch_mode, url).await?;
        match self.source.browser_fallback_min_bytes {
            Some(min_bytes) if self.source.fetch_mode == FetchMode::Http && body.len() < min_bytes => {
                debug!(url, bytes = body.len(), "listing body too small; rendering in browser");
                match pages.fetch_page(FetchMode::Browser, url).await {
                    Ok(rendered) => Ok(rendered),
                    Err(err) => {
                        warn!(url, error = %err, "browser fallback failed; keeping http body");
                        Ok(body)
                    }
                }
            }
            _ => Ok(body),
        }
    }

    async fn scrape_targets(
        &self,
        pages: &dyn PageSource,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        if self.source.listing_urls.is_empty() {
            return Err(AdapterError::NoListingUrls {
                source_name: self.source.name.clone(),
            });
        }

        let mut events = Vec::new();
        let mut last_error = None;
        let mut fetched = 0usize;
        for (index, target) in self.source.listing_urls.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.page_delay(ctx)).await;
            }
            let html = match self.fetch_listing(pages, &target.url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(source = %self.source.name, url = %target.url, error = %err, "listing fetch failed");
                    last_error = Some(err);
                    continue;
                }
            };
            fetched += 1;
            let found = listing::parse_listing(&html, &self.source, target)?;
            debug!(url = %target.url, events = found.len(), "parsed listing page");
            events.extend(found);
        }

        match last_error {
            Some(err) if fetched == 0 => Err(err.into()),
            _ => Ok(events),
        }
    }

    async fn scrape_pages(
        &self,
        pages: &dyn PageSource,
        ctx: &AdapterContext,
        pagination: &Pagination,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let mut events = Vec::new();
        let mut empty_streak = 0;
        let last_page = pagination.first_page.saturating_add(pagination.max_pages.saturating_sub(1));

        for page in pagination.first_page..=last_page {
            if page > pagination.first_page {
                tokio::time::sleep(self.page_delay(ctx)).await;
            }
            let target = ListingTarget::new(pagination.page_url(page));
            let html = match self.fetch_listing(pages, &target.url).await {
                Ok(html) => html,
                Err(err) if page == pagination.first_page => return Err(err.into()),
                Err(err) => {
                    warn!(source = %self.source.name, page, error = %err, "stopping pagination");
                    break;
                }
            };

            let found = listing::parse_listing(&html, &self.source, &target)?;
            debug!(page, events = found.len(), "parsed listing page");
            if found.is_empty() {
                empty_streak += 1;
                if empty_streak >= pagination.stop_after_empty {
                    break;
                }
            } else {
                empty_streak = 0;
                events.extend(found);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl SourceAdapter for ListingAdapter {
    fn name(&self) -> &str {
        &self.source.name
    }

    async fn scrape(
        &self,
        pages: &dyn PageSource,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let span = info_span!("scrape", source = %self.source.name, cycle = ctx.cycle);
        async {
            let mut events = match &self.source.pagination {
                Some(pagination) => self.scrape_pages(pages, ctx, pagination).await?,
                None => self.scrape_targets(pages, ctx).await?,
            };

            let before = events.len();
            let mut seen = std::collections::HashSet::new();
            events.retain(|event| event.website.is_empty() || seen.insert(event.website.clone()));
            info!(
                events = events.len(),
                duplicates = before - events.len(),
                kind = self.source.extract.kind(),
                "source scraped"
            );
            Ok::<_, AdapterError>(events)
        }
        .instrument(span)
        .await
    }
}

pub fn adapter_for_source(source: &SourceConfig) -> Box<dyn SourceAdapter> {
    Box::new(ListingAdapter::new(source.clone()))
}

/// Adapters for the enabled sources, in registry order.
pub fn adapters_for_registry(registry: &SourceRegistry) -> Vec<Box<dyn SourceAdapter>> {
    registry.enabled().map(adapter_for_source).collect()
}
