//! In-process [`EventStore`] used for dry runs and tests. It enforces the same
//! identity constraints as the relational schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventscout_core::{
    is_refreshable_website, Event, EventCandidate, EventDetail, NewEvent, RefreshCandidate,
    ScrapedDetail,
};
use tokio::sync::Mutex;

use crate::dedup::{self, RowWrite, UpsertTarget};
use crate::{BatchOutcome, DetailWrite, EventStore, PlatformCount, StoreError, StoreStats};

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<i64, Event>,
    details: BTreeMap<i64, EventDetail>,
    next_event_id: i64,
    next_detail_id: i64,
}

impl MemoryState {
    fn website_owner(&self, website: &str, except: Option<i64>) -> Option<i64> {
        if website.is_empty() {
            return None;
        }
        self.events
            .values()
            .find(|event| Some(event.id) != except && event.website == website)
            .map(|event| event.id)
    }

    fn push_event(&mut self, event: &NewEvent) -> Result<i64, StoreError> {
        if let Some(existing_id) = self.website_owner(&event.website, None) {
            return Err(StoreError::WebsiteConflict {
                website: event.website.clone(),
                existing_id,
            });
        }
        self.next_event_id += 1;
        let id = self.next_event_id;
        let now = Utc::now();
        self.events.insert(
            id,
            Event {
                id,
                name: event.name.clone(),
                location: event.location.clone(),
                date_time: event.date_time.clone(),
                date: event.date.clone(),
                time: event.time.clone(),
                website: event.website.clone(),
                description: event.description.clone(),
                address: event.address.clone(),
                event_type: event.event_type,
                platform: event.platform.clone(),
                hash: event.hash.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl UpsertTarget for MemoryState {
    async fn find_by_hash(&mut self, hash: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .events
            .values()
            .find(|event| event.hash == hash)
            .map(|event| event.id))
    }

    async fn find_by_website(&mut self, website: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.website_owner(website, None))
    }

    async fn update_event(&mut self, id: i64, event: &NewEvent) -> Result<(), StoreError> {
        if let Some(existing_id) = self.website_owner(&event.website, Some(id)) {
            return Err(StoreError::WebsiteConflict {
                website: event.website.clone(),
                existing_id,
            });
        }
        let row = self
            .events
            .get_mut(&id)
            .ok_or(StoreError::UnknownEvent { event_id: id })?;
        row.name = event.name.clone();
        row.location = event.location.clone();
        row.date_time = event.date_time.clone();
        row.date = event.date.clone();
        row.time = event.time.clone();
        row.website = event.website.clone();
        row.description = event.description.clone();
        row.address = event.address.clone();
        row.event_type = event.event_type;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_event(&mut self, event: &NewEvent) -> Result<RowWrite, StoreError> {
        if let Some(id) = self.find_by_hash(&event.hash).await? {
            self.update_event(id, event).await?;
            return Ok(RowWrite::Updated(id));
        }
        self.push_event(event).map(RowWrite::Inserted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row exactly as given, bypassing identity resolution. Used to
    /// load rows written under an earlier identity scheme.
    pub async fn seed_event(&self, event: NewEvent) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.events.values().any(|row| row.hash == event.hash) {
            return Err(StoreError::DuplicateHash { hash: event.hash });
        }
        state.push_event(&event)
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

fn next_last_scraped(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if previous >= now => previous + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_batch(&self, candidates: Vec<EventCandidate>) -> Result<BatchOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(dedup::upsert_all(&mut *state, candidates).await)
    }

    async fn upsert_detail(&self, detail: &ScrapedDetail) -> Result<DetailWrite, StoreError> {
        let mut state = self.state.lock().await;
        if !state.events.contains_key(&detail.event_id) {
            return Err(StoreError::UnknownEvent {
                event_id: detail.event_id,
            });
        }

        let previous = state.details.get(&detail.event_id).cloned();
        let now = Utc::now();
        let (id, created_at, write) = match &previous {
            Some(row) => (row.id, row.created_at, DetailWrite::Updated),
            None => {
                state.next_detail_id += 1;
                (state.next_detail_id, now, DetailWrite::Inserted)
            }
        };

        state.details.insert(
            detail.event_id,
            EventDetail {
                id,
                event_id: detail.event_id,
                full_description: detail.full_description.clone(),
                organizer: detail.organizer.clone(),
                organizer_contact: detail.organizer_contact.clone(),
                image_url: detail.image_url.clone(),
                tags: detail.tags_text(),
                price: detail.price.clone(),
                registration_url: detail.registration_url.clone(),
                duration: detail.duration.clone(),
                agenda_html: detail.agenda_html.clone(),
                speakers_json: detail.speakers_json(),
                prerequisites: detail.prerequisites.clone(),
                max_attendees: detail.max_attendees,
                attendees_count: detail.attendees_count,
                last_scraped: next_last_scraped(previous.map(|row| row.last_scraped)),
                scraped_body: detail.scraped_body.clone(),
                created_at,
                updated_at: now,
            },
        );
        Ok(write)
    }

    async fn refresh_candidates(
        &self,
        stale_after: chrono::Duration,
        limit: Option<i64>,
    ) -> Result<Vec<RefreshCandidate>, StoreError> {
        let state = self.state.lock().await;
        let cutoff = Utc::now() - stale_after;

        let mut events = state
            .events
            .values()
            .filter(|event| is_refreshable_website(&event.website))
            .filter(|event| match state.details.get(&event.id) {
                Some(detail) => detail.last_scraped < cutoff,
                None => true,
            })
            .collect::<Vec<_>>();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let limit = limit
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(usize::MAX);
        Ok(events
            .into_iter()
            .take(limit)
            .map(|event| RefreshCandidate {
                event_id: event.id,
                name: event.name.clone(),
                website: event.website.clone(),
                platform: event.platform.clone(),
                location: event.location.clone(),
            })
            .collect())
    }

    async fn get_detail(&self, event_id: i64) -> Result<Option<EventDetail>, StoreError> {
        Ok(self.state.lock().await.details.get(&event_id).cloned())
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        let mut events = self.events().await;
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for event in state.events.values() {
            *counts.entry(event.platform.as_str()).or_default() += 1;
        }
        let mut platforms = counts
            .into_iter()
            .map(|(platform, events)| PlatformCount {
                platform: platform.to_string(),
                events,
            })
            .collect::<Vec<_>>();
        platforms.sort_by(|a, b| b.events.cmp(&a.events).then(a.platform.cmp(&b.platform)));

        Ok(StoreStats {
            total_events: state.events.len() as i64,
            platforms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventscout_core::{identity_hash, EventType};

    impl MemoryEventStore {
        async fn backdate_detail(&self, event_id: i64, last_scraped: DateTime<Utc>) {
            let mut state = self.state.lock().await;
            if let Some(detail) = state.details.get_mut(&event_id) {
                detail.last_scraped = last_scraped;
            }
        }
    }

    fn candidate(name: &str, website: &str, platform: &str, date: &str) -> EventCandidate {
        EventCandidate {
            website: website.to_string(),
            date: date.to_string(),
            location: "Bengaluru".to_string(),
            ..EventCandidate::new(name, platform)
        }
    }

    fn legacy_row(name: &str, website: &str, hash: &str) -> NewEvent {
        NewEvent {
            name: name.to_string(),
            location: "Bengaluru".to_string(),
            date_time: String::new(),
            date: "2026-01-01".to_string(),
            time: String::new(),
            website: website.to_string(),
            description: String::new(),
            address: String::new(),
            event_type: EventType::Offline,
            platform: "meetup".to_string(),
            hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_batch_is_idempotent() {
        let store = MemoryEventStore::new();
        let batch = vec![
            candidate("Rust Meetup", "https://x.org/e/1", "meetup", "2026-03-01"),
            candidate("Go Meetup", "", "hasgeek", "2026-03-02"),
        ];

        let first = store.upsert_batch(batch.clone()).await.unwrap();
        let second = store.upsert_batch(batch).await.unwrap();

        assert_eq!(first, BatchOutcome { inserted: 2, updated: 0, skipped: 0 });
        assert_eq!(second, BatchOutcome { inserted: 0, updated: 2, skipped: 0 });
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn same_url_with_new_date_updates_one_row() {
        let store = MemoryEventStore::new();
        store
            .upsert_batch(vec![candidate("Tech Meetup", "https://x.org/e/1?ref=a", "meetup", "2026-03-01")])
            .await
            .unwrap();
        let outcome = store
            .upsert_batch(vec![candidate("Tech Meetup", "https://x.org/e/1", "meetup", "2026-03-08")])
            .await
            .unwrap();

        assert_eq!(outcome.updated, 1);
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "2026-03-08");
        assert_eq!(events[0].website, "https://x.org/e/1");
    }

    #[tokio::test]
    async fn website_match_catches_rows_with_a_different_hash() {
        let store = MemoryEventStore::new();
        let id = store
            .seed_event(legacy_row("Tech Meetup", "https://x.org/e/1", "legacy-hash"))
            .await
            .unwrap();

        let outcome = store
            .upsert_batch(vec![candidate("Tech Meetup (March)", "https://x.org/e/1", "meetup", "2026-03-08")])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { inserted: 0, updated: 1, skipped: 0 });

        let again = store
            .upsert_batch(vec![candidate("Tech Meetup (March)", "https://x.org/e/1", "meetup", "2026-03-08")])
            .await
            .unwrap();
        assert_eq!(again.updated, 1);

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].name, "Tech Meetup (March)");
        assert_eq!(events[0].hash, "legacy-hash");
    }

    #[tokio::test]
    async fn invalid_and_conflicting_rows_are_skipped_without_aborting() {
        let store = MemoryEventStore::new();
        store
            .seed_event(legacy_row("Canonical", "https://x.org/e/1", &identity_hash("https://x.org/e/1")))
            .await
            .unwrap();
        store
            .seed_event(legacy_row("Raw duplicate", "https://X.org/e/1/", "other-hash"))
            .await
            .unwrap();

        let outcome = store
            .upsert_batch(vec![
                candidate("", "https://x.org/e/2", "meetup", "2026-03-01"),
                candidate("No platform", "https://x.org/e/3", " ", "2026-03-01"),
                candidate("Conflict", "https://X.org/e/1/", "meetup", "2026-03-01"),
                candidate("Fine", "https://x.org/e/4", "meetup", "2026-03-01"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome { inserted: 1, updated: 0, skipped: 3 });
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn last_writer_wins_within_a_batch() {
        let store = MemoryEventStore::new();
        let outcome = store
            .upsert_batch(vec![
                candidate("Expo", "", "biec", "2026-05-01"),
                candidate("expo", "", "BIEC", "2026-05-02"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome { inserted: 1, updated: 1, skipped: 0 });
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "2026-05-02");
        assert_eq!(events[0].platform, "biec");
    }

    #[tokio::test]
    async fn detail_upsert_requires_event_and_advances_last_scraped() {
        let store = MemoryEventStore::new();
        assert!(matches!(
            store.upsert_detail(&ScrapedDetail::new(42)).await,
            Err(StoreError::UnknownEvent { event_id: 42 })
        ));

        store
            .upsert_batch(vec![candidate("Rust Meetup", "https://x.org/e/1", "meetup", "2026-03-01")])
            .await
            .unwrap();
        let event_id = store.events().await[0].id;

        let mut detail = ScrapedDetail::new(event_id);
        detail.organizer = "Rust Bangalore".into();
        assert_eq!(store.upsert_detail(&detail).await.unwrap(), DetailWrite::Inserted);
        let first = store.get_detail(event_id).await.unwrap().unwrap();

        detail.organizer = "Rust India".into();
        assert_eq!(store.upsert_detail(&detail).await.unwrap(), DetailWrite::Updated);
        let second = store.get_detail(event_id).await.unwrap().unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.organizer, "Rust India");
        assert!(second.last_scraped > first.last_scraped);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn refresh_candidates_skip_fresh_and_unvisitable_rows() {
        let store = MemoryEventStore::new();
        store
            .upsert_batch(vec![
                candidate("No site", "", "hasgeek", ""),
                candidate("Anchor", "https://x.org/#events", "meetup", ""),
                candidate("Script", "javascript:void(0)", "biec", ""),
                candidate("Fresh", "https://x.org/e/fresh", "meetup", ""),
                candidate("Stale", "https://x.org/e/stale", "meetup", ""),
                candidate("Never", "https://x.org/e/never", "hitex", ""),
            ])
            .await
            .unwrap();

        let ids = store
            .events()
            .await
            .into_iter()
            .map(|event| (event.name.clone(), event.id))
            .collect::<BTreeMap<_, _>>();
        for name in ["Fresh", "Stale"] {
            store.upsert_detail(&ScrapedDetail::new(ids[name])).await.unwrap();
        }
        store
            .backdate_detail(ids["Stale"], Utc::now() - chrono::Duration::days(8))
            .await;

        let candidates = store
            .refresh_candidates(chrono::Duration::days(7), None)
            .await
            .unwrap();
        let names = candidates.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Never", "Stale"]);

        let limited = store
            .refresh_candidates(chrono::Duration::days(7), Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].name, "Never");
    }

    #[tokio::test]
    async fn stats_count_events_per_platform() {
        let store = MemoryEventStore::new();
        store
            .upsert_batch(vec![
                candidate("A", "https://a.org/1", "meetup", ""),
                candidate("B", "https://a.org/2", "meetup", ""),
                candidate("C", "https://a.org/3", "biec", ""),
            ])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(
            stats.platforms,
            vec![
                PlatformCount { platform: "meetup".into(), events: 2 },
                PlatformCount { platform: "biec".into(), events: 1 },
            ]
        );

        let recent = store.recent_events(2).await.unwrap();
        assert_eq!(recent.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["C", "B"]);
    }
}
