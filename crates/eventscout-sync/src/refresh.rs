//! Incremental detail enrichment for already stored events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use eventscout_adapters::{merge_external, DetailParser, SourceRegistry};
use eventscout_core::{RefreshCandidate, ScrapedDetail};
use eventscout_storage::{DetailWrite, EventStore, FetchMode, PageSource};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::report::DetailRunSummary;

const PROGRESS_EVERY: usize = 10;

/// Receives each parsed detail as soon as it is ready.
#[async_trait]
pub trait DetailSink: Send {
    async fn accept(&mut self, detail: ScrapedDetail) -> Result<()>;
}

/// Persists details through the store's single-row upsert and tallies the
/// writes.
pub struct StoreSink {
    store: Arc<dyn EventStore>,
    inserted: usize,
    updated: usize,
}

impl StoreSink {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            inserted: 0,
            updated: 0,
        }
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn updated(&self) -> usize {
        self.updated
    }
}

#[async_trait]
impl DetailSink for StoreSink {
    async fn accept(&mut self, detail: ScrapedDetail) -> Result<()> {
        let write = self
            .store
            .upsert_detail(&detail)
            .await
            .with_context(|| format!("saving detail for event {}", detail.event_id))?;
        match write {
            DetailWrite::Inserted => self.inserted += 1,
            DetailWrite::Updated => self.updated += 1,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub candidates: usize,
    /// Candidates the loop got to before finishing or stopping.
    pub reached: usize,
    pub saved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshStats),
    /// The run deadline passed or a stop was requested; completed writes stay.
    DeadlineReached(RefreshStats),
}

impl RefreshOutcome {
    pub fn stats(&self) -> &RefreshStats {
        match self {
            RefreshOutcome::Completed(stats) | RefreshOutcome::DeadlineReached(stats) => stats,
        }
    }

    pub fn deadline_reached(&self) -> bool {
        matches!(self, RefreshOutcome::DeadlineReached(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub stale_after: chrono::Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub item_timeout: Duration,
    pub run_timeout: Duration,
    /// Pause before fetching an organizer page named by a detail parser.
    pub follow_up_delay: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::days(7),
            min_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(7),
            item_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60 * 60),
            follow_up_delay: Duration::from_secs(2),
        }
    }
}

pub struct DetailRefresher {
    store: Arc<dyn EventStore>,
    pages: Arc<dyn PageSource>,
    registry: SourceRegistry,
    settings: RefreshSettings,
}

impl DetailRefresher {
    pub fn new(
        store: Arc<dyn EventStore>,
        pages: Arc<dyn PageSource>,
        registry: SourceRegistry,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            store,
            pages,
            registry,
            settings,
        }
    }

    /// One run persisting through a [`StoreSink`].
    pub async fn run_once(
        &self,
        limit: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<(RefreshOutcome, DetailRunSummary)> {
        let mut sink = StoreSink::new(self.store.clone());
        let outcome = self.refresh(limit, &mut sink, cancel).await?;
        let summary = DetailRunSummary {
            inserted: sink.inserted(),
            updated: sink.updated(),
            failed: outcome.stats().failed,
        };
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            failed = summary.failed,
            deadline_reached = outcome.deadline_reached(),
            "detail run finished"
        );
        Ok((outcome, summary))
    }

    /// Fetches, parses and hands every stale candidate to `sink`, one at a
    /// time. A failing item is logged and counted; the loop moves on.
    pub async fn refresh(
        &self,
        limit: Option<u32>,
        sink: &mut dyn DetailSink,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome> {
        let candidates = self
            .store
            .refresh_candidates(self.settings.stale_after, limit.map(i64::from))
            .await
            .context("selecting detail refresh candidates")?;
        let deadline = Instant::now() + self.settings.run_timeout;

        self.refresh_candidates(candidates, sink, cancel, deadline)
            .instrument(info_span!("detail_refresh"))
            .await
    }

    async fn refresh_candidates(
        &self,
        candidates: Vec<RefreshCandidate>,
        sink: &mut dyn DetailSink,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<RefreshOutcome> {
        let mut stats = RefreshStats {
            candidates: candidates.len(),
            ..Default::default()
        };
        info!(candidates = stats.candidates, "detail refresh started");

        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 {
                let delay = jitter(self.settings.min_delay, self.settings.max_delay);
                if !self.pause(delay, cancel, deadline).await {
                    return Ok(self.stopped(stats));
                }
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                return Ok(self.stopped(stats));
            }
            stats.reached += 1;

            match self.refresh_one(candidate, cancel, deadline).await {
                Ok(detail) => match sink.accept(detail).await {
                    Ok(()) => stats.saved += 1,
                    Err(err) => {
                        warn!(event_id = candidate.event_id, error = %err, "saving detail failed");
                        stats.failed += 1;
                    }
                },
                Err(err) => {
                    warn!(
                        event_id = candidate.event_id,
                        platform = %candidate.platform,
                        url = %candidate.website,
                        error = %err,
                        "detail refresh failed"
                    );
                    stats.failed += 1;
                }
            }

            if stats.reached % PROGRESS_EVERY == 0 {
                info!(
                    processed = stats.reached,
                    total = stats.candidates,
                    saved = stats.saved,
                    failed = stats.failed,
                    "detail refresh progress"
                );
            }
        }

        info!(saved = stats.saved, failed = stats.failed, "detail refresh completed");
        Ok(RefreshOutcome::Completed(stats))
    }

    fn stopped(&self, stats: RefreshStats) -> RefreshOutcome {
        warn!(
            reached = stats.reached,
            candidates = stats.candidates,
            "detail refresh stopped before finishing"
        );
        RefreshOutcome::DeadlineReached(stats)
    }

    /// Sleeps for `delay`; false when the deadline or a stop request came first.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken, deadline: Instant) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn refresh_one(
        &self,
        candidate: &RefreshCandidate,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<ScrapedDetail> {
        let mode = self.registry.detail_fetch_mode(&candidate.platform);
        let parser = DetailParser::for_platform(&candidate.platform);
        debug!(event_id = candidate.event_id, parser = parser.name(), ?mode, "refreshing detail");

        let html = self.fetch(mode, &candidate.website, cancel, deadline).await?;
        let parsed = parser
            .parse(&html, candidate)
            .with_context(|| format!("parsing {}", candidate.website))?;
        let mut detail = parsed.detail;

        if let Some(url) = parsed.follow_up {
            if self.pause(self.settings.follow_up_delay, cancel, deadline).await {
                match self.fetch(FetchMode::Http, &url, cancel, deadline).await {
                    Ok(body) => {
                        if let Err(err) = merge_external(&mut detail, &body) {
                            warn!(url = %url, error = %err, "organizer page did not parse");
                        }
                    }
                    Err(err) => warn!(url = %url, error = %err, "organizer page fetch failed"),
                }
            }
        }
        Ok(detail)
    }

    /// One fetch bounded by the item timeout and the run deadline, whichever
    /// is tighter.
    async fn fetch(
        &self,
        mode: FetchMode,
        url: &str,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<String> {
        let item_deadline = deadline.min(Instant::now() + self.settings.item_timeout);
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("cancelled while fetching {url}")),
            result = tokio::time::timeout_at(item_deadline, self.pages.fetch_page(mode, url)) => match result {
                Ok(body) => body.with_context(|| format!("fetching {url}")),
                Err(_) => Err(anyhow!("timed out fetching {url}")),
            },
        }
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use eventscout_core::EventCandidate;
    use eventscout_storage::{FetchError, MemoryEventStore};

    #[derive(Default)]
    struct CannedPages {
        bodies: HashMap<String, String>,
    }

    impl CannedPages {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.bodies.insert(url.to_string(), body.to_string());
            self
        }
    }

    #[async_trait]
    impl PageSource for CannedPages {
        async fn fetch_page(&self, _mode: FetchMode, url: &str) -> Result<String, FetchError> {
            self.bodies.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 500,
                url: url.to_string(),
            })
        }
    }

    struct RecordingSink {
        saved: Vec<ScrapedDetail>,
        stop_after: Option<(usize, CancellationToken)>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                saved: Vec::new(),
                stop_after: None,
            }
        }
    }

    #[async_trait]
    impl DetailSink for RecordingSink {
        async fn accept(&mut self, detail: ScrapedDetail) -> Result<()> {
            self.saved.push(detail);
            if let Some((count, token)) = &self.stop_after {
                if self.saved.len() >= *count {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    fn quick_settings() -> RefreshSettings {
        RefreshSettings {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            follow_up_delay: Duration::ZERO,
            item_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn registry() -> SourceRegistry {
        SourceRegistry { sources: Vec::new() }
    }

    fn article(text: &str) -> String {
        format!("<html><body><article><p>{}</p></article></body></html>", text.repeat(20))
    }

    async fn seed(store: &MemoryEventStore, count: usize) -> Vec<String> {
        let urls: Vec<String> = (1..=count)
            .map(|i| format!("https://events.example/e/{i}"))
            .collect();
        let candidates = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let mut candidate = EventCandidate::new(format!("Event {}", i + 1), "community");
                candidate.website = url.clone();
                candidate
            })
            .collect();
        store.upsert_batch(candidates).await.unwrap();
        urls
    }

    #[tokio::test]
    async fn failing_item_does_not_lose_the_others() {
        let store = MemoryEventStore::new();
        let urls = seed(&store, 10).await;
        let mut pages = CannedPages::default();
        for (i, url) in urls.iter().enumerate() {
            if i != 4 {
                pages = pages.with(url, &article("Talks and demos. "));
            }
        }

        let refresher = DetailRefresher::new(
            Arc::new(store.clone()),
            Arc::new(pages),
            registry(),
            quick_settings(),
        );
        let (outcome, summary) = refresher
            .run_once(None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RefreshOutcome::Completed(RefreshStats {
                candidates: 10,
                reached: 10,
                saved: 9,
                failed: 1,
            })
        );
        assert_eq!(summary, DetailRunSummary { inserted: 9, updated: 0, failed: 1 });

        for event in store.events().await {
            let detail = store.get_detail(event.id).await.unwrap();
            if event.website == urls[4] {
                assert!(detail.is_none());
            } else {
                let detail = detail.expect("detail saved");
                assert!(detail.full_description.contains("Talks and demos."));
                assert_eq!(detail.registration_url, event.website);
            }
        }

        let (_, again) = refresher
            .run_once(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, DetailRunSummary { inserted: 0, updated: 0, failed: 1 });
    }

    #[tokio::test]
    async fn candidate_limit_caps_the_run() {
        let store = MemoryEventStore::new();
        let urls = seed(&store, 5).await;
        let pages = urls
            .iter()
            .fold(CannedPages::default(), |pages, url| pages.with(url, &article("Hands-on labs. ")));
        let refresher = DetailRefresher::new(
            Arc::new(store),
            Arc::new(pages),
            registry(),
            quick_settings(),
        );

        let (outcome, summary) = refresher
            .run_once(Some(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stats().candidates, 2);
        assert_eq!(summary.inserted, 2);
    }

    #[tokio::test]
    async fn stop_request_ends_the_run_with_a_deadline_outcome() {
        let store = MemoryEventStore::new();
        let urls = seed(&store, 10).await;
        let pages = urls
            .iter()
            .fold(CannedPages::default(), |pages, url| pages.with(url, &article("Agenda. ")));
        let refresher = DetailRefresher::new(
            Arc::new(store.clone()),
            Arc::new(pages),
            registry(),
            quick_settings(),
        );

        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::new();
        sink.stop_after = Some((3, cancel.clone()));
        let outcome = refresher.refresh(None, &mut sink, &cancel).await.unwrap();

        assert!(outcome.deadline_reached());
        assert_eq!(outcome.stats().reached, 3);
        assert_eq!(outcome.stats().candidates, 10);
        assert_eq!(sink.saved.len(), 3);
    }

    #[tokio::test]
    async fn run_timeout_stops_between_items() {
        let store = MemoryEventStore::new();
        let urls = seed(&store, 4).await;
        let pages = urls
            .iter()
            .fold(CannedPages::default(), |pages, url| pages.with(url, &article("Agenda. ")));
        let refresher = DetailRefresher::new(
            Arc::new(store.clone()),
            Arc::new(pages),
            registry(),
            RefreshSettings {
                min_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(200),
                run_timeout: Duration::from_millis(100),
                ..quick_settings()
            },
        );

        let mut sink = RecordingSink::new();
        let outcome = refresher
            .refresh(None, &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.deadline_reached());
        assert_eq!(outcome.stats().reached, 1);
        assert_eq!(sink.saved.len(), 1);
    }

    #[tokio::test]
    async fn hitex_detail_merges_the_organizer_page() {
        let store = MemoryEventStore::new();
        let mut candidate = EventCandidate::new("AgriTech Expo", "hitex");
        candidate.website = "https://hitex.co.in/events/agritech.html".to_string();
        store.upsert_batch(vec![candidate]).await.unwrap();

        let listing = r#"<html><body>
            <a class="btn" href="https://agritech-expo.example/">Website</a>
            </body></html>"#;
        let organizer = format!(
            "<html><body><section class=\"about-event\">{}</section></body></html>",
            "India's largest agriculture technology show. ".repeat(5)
        );
        let pages = CannedPages::default()
            .with("https://hitex.co.in/events/agritech.html", listing)
            .with("https://agritech-expo.example/", &organizer);
        let refresher = DetailRefresher::new(
            Arc::new(store.clone()),
            Arc::new(pages),
            registry(),
            quick_settings(),
        );

        let mut sink = RecordingSink::new();
        let outcome = refresher
            .refresh(None, &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stats().saved, 1);
        let detail = &sink.saved[0];
        assert!(detail.full_description.contains("agriculture technology"));
        assert!(!detail.organizer.is_empty());
    }

    #[test]
    fn jitter_stays_in_range() {
        let min = Duration::from_millis(30);
        let max = Duration::from_millis(70);
        for _ in 0..100 {
            let delay = jitter(min, max);
            assert!(delay >= min && delay <= max);
        }
        assert_eq!(jitter(max, max), max);
    }
}
