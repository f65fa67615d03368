//! Core domain model and identity rules for eventscout.

pub mod filters;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "eventscout-core";

/// Location stored when a source did not provide one.
pub const UNKNOWN_LOCATION: &str = "N/A";

/// Upper bound (bytes) on the raw page body kept alongside a detail row.
pub const MAX_SCRAPED_BODY_BYTES: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Online,
    Offline,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Online => "Online",
            EventType::Offline => "Offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(EventType::Online),
            "offline" => Some(EventType::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, not-yet-validated event produced by one source adapter in one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub name: String,
    pub location: String,
    pub date_time: String,
    pub date: String,
    pub time: String,
    pub website: String,
    pub description: String,
    pub address: String,
    pub event_type: Option<EventType>,
    pub platform: String,
}

impl EventCandidate {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            ..Default::default()
        }
    }

    /// Date text used by the upcoming filter: the raw date-time when present,
    /// otherwise the separate date field.
    pub fn date_text(&self) -> &str {
        if self.date_time.trim().is_empty() {
            self.date.trim()
        } else {
            self.date_time.trim()
        }
    }

    /// Trims every text field, fills defaults, checks the required fields and
    /// derives the identity hash.
    pub fn normalize(self) -> Result<NewEvent, ValidationError> {
        let name = self.name.trim().to_string();
        let platform = self.platform.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::MissingName);
        }
        if platform.is_empty() {
            return Err(ValidationError::MissingPlatform);
        }

        let mut location = self.location.trim().to_string();
        if location.is_empty() {
            location = UNKNOWN_LOCATION.to_string();
        }
        let address = self.address.trim().to_string();
        let website = self.website.trim().to_string();
        let event_type = self
            .event_type
            .unwrap_or_else(|| infer_event_type(&location, &address));
        let hash = identity_hash(&identity_key(&website, &name, &platform));

        Ok(NewEvent {
            name,
            location,
            date_time: self.date_time.trim().to_string(),
            date: self.date.trim().to_string(),
            time: self.time.trim().to_string(),
            website,
            description: self.description.trim().to_string(),
            address,
            event_type,
            platform,
            hash,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event name is empty")]
    MissingName,
    #[error("event platform is empty")]
    MissingPlatform,
}

/// Normalized, validated event ready to be written by the upsert engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub name: String,
    pub location: String,
    pub date_time: String,
    pub date: String,
    pub time: String,
    pub website: String,
    pub description: String,
    pub address: String,
    pub event_type: EventType,
    pub platform: String,
    pub hash: String,
}

/// Canonical persisted event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub location: String,
    pub date_time: String,
    pub date: String,
    pub time: String,
    pub website: String,
    pub description: String,
    pub address: String,
    pub event_type: EventType,
    pub platform: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lower-cases, drops the query string and trims the trailing slash.
pub fn normalize_website(website: &str) -> String {
    let lower = website.trim().to_lowercase();
    let without_query = lower.split('?').next().unwrap_or_default();
    without_query.trim_end_matches('/').to_string()
}

/// The normalized URL when there is one, otherwise `name|platform`.
///
/// Dates never take part in the key, so a recurring listing keeps one row.
pub fn identity_key(website: &str, name: &str, platform: &str) -> String {
    let url = normalize_website(website);
    if !url.is_empty() {
        return url;
    }
    format!(
        "{}|{}",
        name.trim().to_lowercase(),
        platform.trim().to_lowercase()
    )
}

pub fn identity_hash(identity_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn infer_event_type(location: &str, address: &str) -> EventType {
    if location.to_lowercase().contains("online") || address.to_lowercase().contains("online") {
        EventType::Online
    } else {
        EventType::Offline
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
}

/// Enrichment scraped from one event's detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedDetail {
    pub event_id: i64,
    pub full_description: String,
    pub organizer: String,
    pub organizer_contact: String,
    pub image_url: String,
    pub tags: Vec<String>,
    pub price: String,
    pub registration_url: String,
    pub duration: String,
    pub agenda_html: String,
    pub speakers: Vec<Speaker>,
    pub prerequisites: String,
    pub max_attendees: i32,
    pub attendees_count: i32,
    pub scraped_body: String,
}

impl ScrapedDetail {
    pub fn new(event_id: i64) -> Self {
        Self {
            event_id,
            ..Default::default()
        }
    }

    pub fn tags_text(&self) -> String {
        self.tags.join(", ")
    }

    pub fn speakers_json(&self) -> String {
        if self.speakers.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.speakers).unwrap_or_default()
    }

    /// Stores the page body, cut at a char boundary below the size cap.
    pub fn set_scraped_body(&mut self, body: &str) {
        self.scraped_body = truncate_at_char_boundary(body, MAX_SCRAPED_BODY_BYTES).to_string();
    }
}

/// Persisted detail row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetail {
    pub id: i64,
    pub event_id: i64,
    pub full_description: String,
    pub organizer: String,
    pub organizer_contact: String,
    pub image_url: String,
    pub tags: String,
    pub price: String,
    pub registration_url: String,
    pub duration: String,
    pub agenda_html: String,
    pub speakers_json: String,
    pub prerequisites: String,
    pub max_attendees: i32,
    pub attendees_count: i32,
    pub last_scraped: DateTime<Utc>,
    pub scraped_body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored event selected for a detail refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCandidate {
    pub event_id: i64,
    pub name: String,
    pub website: String,
    pub platform: String,
    pub location: String,
}

/// A website the detail refresher can actually visit.
pub fn is_refreshable_website(website: &str) -> bool {
    let website = website.trim();
    !website.is_empty() && !website.contains('#') && !website.contains("javascript:")
}

pub fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn website_normalization_drops_query_and_trailing_slash() {
        assert_eq!(
            normalize_website("  HTTPS://X.org/E/1/?ref=home "),
            "https://x.org/e/1"
        );
        assert_eq!(normalize_website(""), "");
    }

    #[test]
    fn identity_ignores_date_text_for_same_url() {
        let mut first = EventCandidate::new("Tech Meetup", "meetup");
        first.website = "https://x.org/e/1?ref=a".into();
        first.date = "2026-03-01".into();
        let mut second = EventCandidate::new("Tech Meetup", "meetup");
        second.website = "https://x.org/e/1/".into();
        second.date = "Sun, Mar 8, 2026".into();

        assert_eq!(first.normalize().unwrap().hash, second.normalize().unwrap().hash);
    }

    #[test]
    fn identity_without_website_uses_name_and_platform() {
        assert_eq!(identity_key("", " Rust Meetup ", "HasGeek"), "rust meetup|hasgeek");

        let mut a = EventCandidate::new("Rust Meetup", "hasgeek");
        a.date = "2026-03-01".into();
        let mut b = EventCandidate::new("rust meetup", "HASGEEK");
        b.date = "2026-04-05".into();
        assert_eq!(a.normalize().unwrap().hash, b.normalize().unwrap().hash);
    }

    #[test]
    fn identity_hash_is_hex_sha256() {
        assert_eq!(
            identity_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn normalize_fills_defaults_and_infers_type() {
        let mut candidate = EventCandidate::new("  Cloud Summit ", " biec ");
        candidate.address = "Streamed online".into();
        let event = candidate.normalize().unwrap();
        assert_eq!(event.name, "Cloud Summit");
        assert_eq!(event.platform, "biec");
        assert_eq!(event.location, UNKNOWN_LOCATION);
        assert_eq!(event.event_type, EventType::Online);

        let explicit = EventCandidate {
            event_type: Some(EventType::Offline),
            location: "Online".into(),
            ..EventCandidate::new("Expo", "hitex")
        };
        assert_eq!(explicit.normalize().unwrap().event_type, EventType::Offline);
    }

    #[test]
    fn normalize_rejects_missing_required_fields() {
        assert_eq!(
            EventCandidate::new("   ", "meetup").normalize(),
            Err(ValidationError::MissingName)
        );
        assert_eq!(
            EventCandidate::new("Expo", "").normalize(),
            Err(ValidationError::MissingPlatform)
        );
    }

    #[test]
    fn date_text_prefers_date_time() {
        let mut candidate = EventCandidate::new("Expo", "hitex");
        candidate.date = "2026-03-01".into();
        assert_eq!(candidate.date_text(), "2026-03-01");
        candidate.date_time = "2026-03-02T10:00:00".into();
        assert_eq!(candidate.date_text(), "2026-03-02T10:00:00");
    }

    #[test]
    fn refreshable_website_rules() {
        assert!(is_refreshable_website("https://x.org/e/1"));
        assert!(!is_refreshable_website(""));
        assert!(!is_refreshable_website("https://x.org/#events"));
        assert!(!is_refreshable_website("javascript:void(0)"));
    }

    #[test]
    fn scraped_body_is_capped_on_char_boundary() {
        let mut detail = ScrapedDetail::new(1);
        let body = "é".repeat(MAX_SCRAPED_BODY_BYTES);
        detail.set_scraped_body(&body);
        assert!(detail.scraped_body.len() <= MAX_SCRAPED_BODY_BYTES);
        assert!(detail.scraped_body.chars().all(|c| c == 'é'));
    }

    #[test]
    fn speakers_serialize_to_json_array() {
        let mut detail = ScrapedDetail::new(7);
        assert_eq!(detail.speakers_json(), "");
        detail.speakers.push(Speaker {
            name: "Ada".into(),
            role: Some("Keynote".into()),
            profile_url: None,
        });
        assert_eq!(detail.speakers_json(), r#"[{"name":"Ada","role":"Keynote"}]"#);
        detail.tags = vec!["rust".into(), "systems".into()];
        assert_eq!(detail.tags_text(), "rust, systems");
    }
}
