//! Post-extraction filtering applied uniformly to every adapter's output.

use std::collections::HashSet;

use chrono::{Local, NaiveDate};
use eventscout_adapters::SourceRegistry;
use eventscout_core::filters::{is_upcoming_on, ClassificationRules};
use eventscout_core::{infer_event_type, EventCandidate};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    pub kept: Vec<EventCandidate>,
    pub filtered: usize,
}

/// Drops online events, past events and, for sources flagged `tech_filter`,
/// titles that are not tech related. Checks run in that order.
#[derive(Debug, Clone)]
pub struct EventFilter {
    rules: ClassificationRules,
    tech_filtered: HashSet<String>,
    today: Option<NaiveDate>,
}

impl EventFilter {
    pub fn new(rules: ClassificationRules) -> Self {
        Self {
            rules,
            tech_filtered: HashSet::new(),
            today: None,
        }
    }

    pub fn for_registry(rules: ClassificationRules, registry: &SourceRegistry) -> Self {
        let mut filter = Self::new(rules);
        filter.tech_filtered = registry
            .sources
            .iter()
            .filter(|source| source.tech_filter)
            .map(|source| source.name.to_lowercase())
            .collect();
        filter
    }

    pub fn with_tech_filter(mut self, platform: &str) -> Self {
        self.tech_filtered.insert(platform.to_lowercase());
        self
    }

    /// Pins the date used by the upcoming check.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn apply(&self, platform: &str, candidates: Vec<EventCandidate>) -> FilterOutcome {
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let tech_filter = self.tech_filtered.contains(&platform.to_lowercase());

        let total = candidates.len();
        let kept: Vec<EventCandidate> = candidates
            .into_iter()
            .filter(|candidate| self.keep(candidate, today, tech_filter))
            .collect();
        FilterOutcome {
            filtered: total - kept.len(),
            kept,
        }
    }

    fn keep(&self, candidate: &EventCandidate, today: NaiveDate, tech_filter: bool) -> bool {
        // Only the location classifies an untyped candidate here; the
        // address is consulted later, at upsert time.
        let event_type = candidate
            .event_type
            .unwrap_or_else(|| infer_event_type(&candidate.location, ""));
        if !self
            .rules
            .is_offline(event_type, &candidate.location, &candidate.name)
        {
            debug!(title = %candidate.name, "dropped online event");
            return false;
        }
        if !is_upcoming_on(candidate.date_text(), today) {
            debug!(title = %candidate.name, date = %candidate.date_text(), "dropped past event");
            return false;
        }
        if tech_filter && !self.rules.is_tech_relevant(&candidate.name) {
            debug!(title = %candidate.name, "dropped non-tech event");
            return false;
        }
        true
    }
}
