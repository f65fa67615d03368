//! Periodic crawl cycles with overlap prevention.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use eventscout_adapters::{AdapterContext, SourceAdapter};
use eventscout_storage::{EventStore, PageSource};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::filter::EventFilter;
use crate::report::{CycleReport, ScraperStatus};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub adapter_timeout: Duration,
    pub page_delay: Duration,
}

#[derive(Debug, Default)]
struct CycleState {
    running: bool,
    cycles_completed: u64,
}

/// Clears the running flag when a cycle ends, including on panic or when the
/// cycle future is dropped.
struct RunningGuard<'a> {
    state: &'a Mutex<CycleState>,
    completed: bool,
}

impl RunningGuard<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.running = false;
        if self.completed {
            state.cycles_completed += 1;
        }
    }
}

struct Inner {
    adapters: Vec<Box<dyn SourceAdapter>>,
    pages: Arc<dyn PageSource>,
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    settings: SchedulerSettings,
    state: Mutex<CycleState>,
    cancel: CancellationToken,
    jobs: tokio::sync::Mutex<Option<JobScheduler>>,
}

/// Runs every adapter in order once per cycle. Cheap to clone; clones share
/// one running flag and cycle counter.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        adapters: Vec<Box<dyn SourceAdapter>>,
        pages: Arc<dyn PageSource>,
        store: Arc<dyn EventStore>,
        filter: EventFilter,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters,
                pages,
                store,
                filter,
                settings,
                state: Mutex::new(CycleState::default()),
                cancel: CancellationToken::new(),
                jobs: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.inner.adapters.iter().map(|adapter| adapter.name()).collect()
    }

    /// Number of cycles that have run to the end, cancelled ones included.
    pub fn cycle_count(&self) -> u64 {
        self.lock_state().cycles_completed
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CycleState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_begin(&self) -> Option<(RunningGuard<'_>, u64)> {
        let mut state = self.lock_state();
        if state.running {
            return None;
        }
        state.running = true;
        let cycle = state.cycles_completed + 1;
        drop(state);
        Some((
            RunningGuard {
                state: &self.inner.state,
                completed: false,
            },
            cycle,
        ))
    }

    /// Runs one cycle unless another is in flight, in which case the request
    /// is dropped and `None` returned.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Some((guard, cycle)) = self.try_begin() else {
            info!("crawl cycle already running; skipping trigger");
            return None;
        };

        let report = self
            .run_adapters(cycle)
            .instrument(info_span!("crawl_cycle", cycle))
            .await;
        guard.complete();
        Some(report)
    }

    async fn run_adapters(&self, cycle: u64) -> CycleReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let ctx = AdapterContext::new(cycle, self.inner.settings.page_delay);
        info!(adapters = self.inner.adapters.len(), "crawl cycle started");

        let mut statuses = Vec::with_capacity(self.inner.adapters.len());
        let mut cancelled = false;
        for adapter in &self.inner.adapters {
            if self.inner.cancel.is_cancelled() {
                warn!(next = adapter.name(), "stop requested; abandoning remaining adapters");
                cancelled = true;
                break;
            }
            statuses.push(self.run_adapter(adapter.as_ref(), &ctx).await);
        }

        let report = CycleReport {
            cycle,
            started_at,
            duration: started.elapsed(),
            statuses,
            cancelled,
        };
        info!(
            inserted = report.total_inserted(),
            updated = report.total_updated(),
            filtered = report.total_filtered(),
            failures = report.failures(),
            duration_ms = report.duration.as_millis() as u64,
            cancelled = report.cancelled,
            "crawl cycle finished"
        );
        report
    }

    async fn run_adapter(&self, adapter: &dyn SourceAdapter, ctx: &AdapterContext) -> ScraperStatus {
        let name = adapter.name().to_string();
        let timeout = self.inner.settings.adapter_timeout;
        let scrape = tokio::time::timeout(timeout, adapter.scrape(self.inner.pages.as_ref(), ctx));

        let events = tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                warn!(adapter = %name, "adapter abandoned on stop request");
                return ScraperStatus::failed(name, "cancelled");
            }
            result = scrape => match result {
                Ok(Ok(events)) => events,
                Ok(Err(err)) => {
                    warn!(adapter = %name, error = %err, "adapter failed");
                    return ScraperStatus::failed(name, err.to_string());
                }
                Err(_) => {
                    warn!(adapter = %name, timeout_secs = timeout.as_secs(), "adapter timed out");
                    return ScraperStatus::failed(name, format!("timed out after {timeout:?}"));
                }
            },
        };

        let found = events.len();
        let outcome = self.inner.filter.apply(&name, events);
        match self.inner.store.upsert_batch(outcome.kept).await {
            Ok(batch) => {
                info!(
                    adapter = %name,
                    found,
                    inserted = batch.inserted,
                    updated = batch.updated,
                    skipped = batch.skipped,
                    filtered = outcome.filtered,
                    "adapter batch written"
                );
                ScraperStatus {
                    name,
                    success: true,
                    found,
                    inserted: batch.inserted,
                    updated: batch.updated,
                    skipped: batch.skipped,
                    filtered: outcome.filtered,
                    error: None,
                }
            }
            Err(err) => {
                warn!(adapter = %name, error = %err, "writing adapter batch failed");
                ScraperStatus {
                    found,
                    filtered: outcome.filtered,
                    ..ScraperStatus::failed(name, err.to_string())
                }
            }
        }
    }

    /// Runs a cycle right away in the background, then one every interval.
    pub async fn start(&self) -> Result<()> {
        let immediate = self.clone();
        tokio::spawn(async move {
            immediate.run_cycle().await;
        });

        let sched = JobScheduler::new().await.context("creating crawl scheduler")?;
        let scheduler = self.clone();
        let job = Job::new_repeated_async(self.inner.settings.interval, move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.run_cycle().await;
            })
        })
        .context("creating crawl job")?;
        sched.add(job).await.context("adding crawl job")?;
        sched.start().await.context("starting crawl scheduler")?;
        *self.inner.jobs.lock().await = Some(sched);

        info!(
            interval_secs = self.inner.settings.interval.as_secs(),
            adapters = self.inner.adapters.len(),
            "crawl scheduler started"
        );
        Ok(())
    }

    /// Stops future triggers and tells an in-flight cycle to give up before
    /// its next adapter.
    pub async fn stop(&self) -> Result<()> {
        self.inner.cancel.cancel();
        if let Some(mut sched) = self.inner.jobs.lock().await.take() {
            sched.shutdown().await.context("shutting down crawl scheduler")?;
        }
        info!(cycles = self.cycle_count(), "crawl scheduler stopped");
        Ok(())
    }
}
