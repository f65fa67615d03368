//! Crawl and detail-refresh orchestration.

mod config;
pub mod filter;
pub mod refresh;
pub mod report;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eventscout_adapters::{adapters_for_registry, SourceRegistry};
use eventscout_core::filters::ClassificationRules;
use eventscout_storage::{BrowserRenderer, EventStore, HttpFetcher, PageFetcher, PageSource};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::{SyncConfig, DEFAULT_DATABASE_URL};
pub use filter::{EventFilter, FilterOutcome};
pub use refresh::{
    DetailRefresher, DetailSink, RefreshOutcome, RefreshSettings, RefreshStats, StoreSink,
};
pub use report::{CycleReport, DetailRunSummary, ScraperStatus};
pub use scheduler::{Scheduler, SchedulerSettings};

pub const CRATE_NAME: &str = "eventscout-sync";

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if registry.enabled().next().is_none() {
        warn!(path = %path.display(), "no enabled sources");
    }
    Ok(registry)
}

/// HTTP fetcher plus, when `CHROME_BIN` is set, the headless renderer.
pub fn build_page_fetcher(config: &SyncConfig) -> Result<PageFetcher> {
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    let browser = config.chrome_bin.as_ref().map(|binary| {
        BrowserRenderer::new(binary, config.fetch_timeout).with_user_agent(config.user_agent.clone())
    });
    if browser.is_none() {
        warn!("CHROME_BIN not set; browser-mode sources will fail");
    }
    Ok(PageFetcher::new(http, browser))
}

/// Everything both long-running loops share.
pub struct SyncServices {
    pub config: SyncConfig,
    pub registry: SourceRegistry,
    pub rules: ClassificationRules,
    pub pages: Arc<dyn PageSource>,
    pub store: Arc<dyn EventStore>,
}

impl SyncServices {
    pub async fn load(config: SyncConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        let registry = load_source_registry(&config.sources_path()).await?;
        let rules = ClassificationRules::from_workspace_root(&config.workspace_root)
            .context("loading classification rules")?;
        let pages: Arc<dyn PageSource> = Arc::new(build_page_fetcher(&config)?);
        Ok(Self {
            config,
            registry,
            rules,
            pages,
            store,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            adapters_for_registry(&self.registry),
            self.pages.clone(),
            self.store.clone(),
            EventFilter::for_registry(self.rules.clone(), &self.registry),
            SchedulerSettings {
                interval: self.config.crawl_interval,
                adapter_timeout: self.config.adapter_timeout,
                page_delay: self.config.rate_limit_delay,
            },
        )
    }

    pub fn refresher(&self) -> DetailRefresher {
        DetailRefresher::new(
            self.store.clone(),
            self.pages.clone(),
            self.registry.clone(),
            RefreshSettings {
                stale_after: self.config.stale_after(),
                min_delay: self.config.detail_min_delay,
                max_delay: self.config.detail_max_delay,
                item_timeout: self.config.detail_item_timeout,
                run_timeout: self.config.detail_run_timeout,
                ..RefreshSettings::default()
            },
        )
    }
}

/// Runs a detail refresh immediately, then once per `interval`, until
/// `cancel` trips. A failed run is logged and retried on the next tick.
pub async fn run_detail_loop(
    refresher: &DetailRefresher,
    interval: Duration,
    limit: Option<u32>,
    cancel: &CancellationToken,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut runs = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        runs += 1;
        match refresher.run_once(limit, cancel).await {
            Ok((outcome, summary)) => info!(
                run = runs,
                saved = summary.saved(),
                failed = summary.failed,
                reached = outcome.stats().reached,
                candidates = outcome.stats().candidates,
                "detail loop run finished"
            ),
            Err(err) => warn!(run = runs, error = %format!("{err:#}"), "detail loop run failed"),
        }
    }
    info!(runs, "detail loop stopped");
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use eventscout_storage::MemoryEventStore;

    const SOURCES: &str = r#"
sources:
  - name: hasgeek
    base_url: https://hasgeek.com
    listing_urls: ["https://hasgeek.com"]
    extract:
      kind: selectors
      items: ["li"]
      name: [{ selector: "a" }]
  - name: allevents
    base_url: https://allevents.in
    tech_filter: true
    enabled: false
    listing_urls: ["https://allevents.in/bangalore/technology"]
    extract:
      kind: selectors
      items: ["li.event-card"]
      name: [{ selector: "h3" }]
"#;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sources.yaml"), SOURCES).unwrap();
        dir
    }

    fn config_for(root: &Path) -> SyncConfig {
        let root = root.display().to_string();
        SyncConfig::from_lookup(|name| (name == "EVENTSCOUT_ROOT").then(|| root.clone())).unwrap()
    }

    #[tokio::test]
    async fn services_wire_enabled_sources_in_file_order() {
        let dir = workspace();
        let services = SyncServices::load(config_for(dir.path()), Arc::new(MemoryEventStore::new()))
            .await
            .unwrap();

        assert_eq!(services.registry.sources.len(), 2);
        assert_eq!(services.scheduler().adapter_names(), ["hasgeek"]);
        assert!(services.rules.is_tech_relevant("Rust meetup"));
    }

    #[tokio::test]
    async fn unreadable_registry_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_source_registry(&dir.path().join("sources.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sources.yaml"));

        fs::write(dir.path().join("sources.yaml"), "sources: [{ name: broken }]").unwrap();
        assert!(load_source_registry(&dir.path().join("sources.yaml")).await.is_err());
    }

    #[tokio::test]
    async fn detail_loop_runs_immediately_and_stops_on_cancel() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let dir = workspace();
        let services = SyncServices::load(config_for(dir.path()), store).await.unwrap();
        let refresher = services.refresher();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let runs = run_detail_loop(&refresher, Duration::from_secs(3600), None, &cancel).await;
        assert_eq!(runs, 1);
    }
}
