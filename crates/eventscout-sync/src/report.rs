use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one adapter within one crawl cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScraperStatus {
    pub name: String,
    pub success: bool,
    /// Candidates the adapter returned before filtering.
    pub found: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub error: Option<String>,
}

impl ScraperStatus {
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub statuses: Vec<ScraperStatus>,
    /// Set when a stop request cut the cycle short.
    pub cancelled: bool,
}

impl CycleReport {
    pub fn total_inserted(&self) -> usize {
        self.statuses.iter().map(|s| s.inserted).sum()
    }

    pub fn total_updated(&self) -> usize {
        self.statuses.iter().map(|s| s.updated).sum()
    }

    pub fn total_filtered(&self) -> usize {
        self.statuses.iter().map(|s| s.filtered).sum()
    }

    pub fn failures(&self) -> usize {
        self.statuses.iter().filter(|s| !s.success).count()
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "crawl cycle {} finished in {:.1}s: {} inserted, {} updated, {} filtered{}\n",
            self.cycle,
            self.duration.as_secs_f64(),
            self.total_inserted(),
            self.total_updated(),
            self.total_filtered(),
            if self.cancelled { " (cancelled)" } else { "" },
        );
        for status in &self.statuses {
            let _ = match &status.error {
                None => writeln!(
                    out,
                    "  ok   {:<12} found={} inserted={} updated={} skipped={} filtered={}",
                    status.name, status.found, status.inserted, status.updated, status.skipped, status.filtered
                ),
                Some(error) => writeln!(out, "  FAIL {:<12} {}", status.name, error),
            };
        }
        out
    }
}

/// Write tally of one detail-refresh run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetailRunSummary {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl DetailRunSummary {
    pub fn saved(&self) -> usize {
        self.inserted + self.updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_adapter() {
        let report = CycleReport {
            cycle: 3,
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
            statuses: vec![
                ScraperStatus {
                    name: "hasgeek".into(),
                    success: true,
                    found: 4,
                    inserted: 2,
                    updated: 1,
                    skipped: 0,
                    filtered: 1,
                    error: None,
                },
                ScraperStatus::failed("echai", "no headless browser configured"),
            ],
            cancelled: false,
        };

        assert_eq!(report.total_inserted(), 2);
        assert_eq!(report.total_filtered(), 1);
        assert_eq!(report.failures(), 1);

        let text = report.render();
        assert!(text.starts_with("crawl cycle 3 finished in 1.5s: 2 inserted, 1 updated, 1 filtered\n"));
        assert!(text.contains("hasgeek"));
        assert!(text.contains("FAIL echai"));
    }
}
