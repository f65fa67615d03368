//! Date parsing and the keyword heuristics used to decide which crawled
//! events are kept.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EventType;

pub const RULES_FILE: &str = "rules/classification.yaml";

pub const DEFAULT_ONLINE_MARKERS: &[&str] =
    &["online", "virtual", "webinar", "web-based", "remote event"];

pub const DEFAULT_TECH_KEYWORDS: &[&str] = &[
    "tech", "developer", "software", "ai", "machine learning", "data", "cloud", "devops",
    "startup", "blockchain", "web3", "cyber", "security", "python", "javascript", "rust",
    "golang", "java", "react", "kubernetes", "hackathon", "coding", "programming", "api",
    "saas", "iot", "robotics", "product", "design", "ux", "fintech", "analytics", "llm",
    "genai", "open source", "engineering", "digital", "electronics", "semiconductor",
];

pub const DEFAULT_NON_TECH_KEYWORDS: &[&str] = &[
    "wedding", "bridal", "jewellery", "jewelry", "furniture", "textile", "garment", "food",
    "cooking", "yoga", "astrology", "spiritual", "music concert", "standup", "comedy",
    "dance", "fashion", "real estate", "property", "agri", "dairy", "poultry",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayoutKind {
    Date,
    DateTime,
}

/// Known layouts in priority order. The first one that parses wins.
const LAYOUTS: &[(&str, LayoutKind)] = &[
    ("%Y-%m-%dT%H:%M:%SZ", LayoutKind::DateTime),
    ("%Y-%m-%dT%H:%M:%S", LayoutKind::DateTime),
    ("%Y-%m-%dT%H:%M", LayoutKind::DateTime),
    ("%Y-%m-%d", LayoutKind::Date),
    ("%B %d, %Y", LayoutKind::Date),
    ("%b %d, %Y", LayoutKind::Date),
    ("%d %b %Y", LayoutKind::Date),
    ("%d %B %Y", LayoutKind::Date),
    ("%d %B, %Y", LayoutKind::Date),
    ("%m/%d/%Y", LayoutKind::Date),
    ("%d/%m/%Y", LayoutKind::Date),
    ("%Y/%m/%d", LayoutKind::Date),
    ("%d-%m-%Y", LayoutKind::Date),
    ("%m-%d-%Y", LayoutKind::Date),
    ("%B %d, %Y %I:%M %p", LayoutKind::DateTime),
    ("%b %d, %Y %I:%M %p", LayoutKind::DateTime),
    ("%d %b %Y %H:%M", LayoutKind::DateTime),
    ("%Y-%m-%d %H:%M:%S", LayoutKind::DateTime),
    ("%Y-%m-%d %H:%M", LayoutKind::DateTime),
];

static ORDINAL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d)(st|nd|rd|th)\b").expect("valid ordinal regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static LEADING_WEEKDAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(mon|tue|wed|thu|fri|sat|sun)[a-z]*\.?,?\s+").expect("valid weekday regex")
});
static TRAILING_ZONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(ist|utc|gmt)$").expect("valid zone regex"));
static RANGE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+[-–]\s+").expect("valid range regex"));
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b20\d{2}\b").expect("valid year regex"));
static EMBEDDED_ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").expect("valid iso regex"));

/// Parses free-form event date text into a calendar date.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.date_naive());
    }

    for candidate in cleaned_variants(trimmed) {
        if let Some(date) = parse_with_layouts(&candidate) {
            return Some(date);
        }
        let without_zone = TRAILING_ZONE.replace(&candidate, "").into_owned();
        if without_zone != candidate {
            if let Some(date) = parse_with_layouts(&without_zone) {
                return Some(date);
            }
        }
    }

    EMBEDDED_ISO_DATE
        .captures(trimmed)
        .and_then(|caps| NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok())
}

fn parse_with_layouts(text: &str) -> Option<NaiveDate> {
    LAYOUTS.iter().find_map(|(layout, kind)| match kind {
        LayoutKind::Date => NaiveDate::parse_from_str(text, layout).ok(),
        LayoutKind::DateTime => NaiveDateTime::parse_from_str(text, layout)
            .ok()
            .map(|dt| dt.date()),
    })
}

/// Cleaned forms of `text` to try against the layouts, most specific first.
fn cleaned_variants(text: &str) -> Vec<String> {
    let stripped = ORDINAL_SUFFIX.replace_all(text, "$1");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ").into_owned();

    let mut starts = Vec::new();
    let mut parts = RANGE_SEPARATOR.splitn(&collapsed, 2);
    let start = parts.next().unwrap_or_default().trim().to_string();
    match parts.next() {
        Some(end) if !YEAR.is_match(&start) => {
            if let Some(year) = YEAR.find_iter(end).last() {
                starts.push(format!("{start}, {}", year.as_str()));
                starts.push(format!("{start} {}", year.as_str()));
            }
            starts.push(start);
        }
        _ => starts.push(start),
    }

    let mut variants = Vec::with_capacity(starts.len() * 2);
    for start in starts {
        let without_weekday = LEADING_WEEKDAY.replace(&start, "").into_owned();
        if without_weekday != start {
            variants.push(start);
            variants.push(without_weekday);
        } else {
            variants.push(start);
        }
    }
    variants
}

/// True when the date is today or later. Unparseable text counts as upcoming.
pub fn is_upcoming(date_text: &str) -> bool {
    is_upcoming_on(date_text, Local::now().date_naive())
}

pub fn is_upcoming_on(date_text: &str, today: NaiveDate) -> bool {
    match parse_date(date_text) {
        Some(date) => date >= today,
        None => true,
    }
}

/// False when the combined type/location/title text carries one of the
/// built-in online markers.
pub fn is_offline_event(event_type: EventType, location: &str, title: &str) -> bool {
    ClassificationRules::default().is_offline(event_type, location, title)
}

fn combined(event_type: EventType, location: &str, title: &str) -> String {
    format!("{} {} {}", event_type.as_str(), location, title).to_lowercase()
}

fn contains_any<'a, S: AsRef<str>>(haystack: &str, needles: &'a [S]) -> Option<&'a str> {
    needles
        .iter()
        .map(|needle| -> &str { needle.as_ref() })
        .find(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase()))
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Editable keyword tables for online detection and tech relevance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRules {
    #[serde(default)]
    pub online_markers: Vec<String>,
    #[serde(default)]
    pub tech_keywords: Vec<String>,
    #[serde(default)]
    pub non_tech_keywords: Vec<String>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        Self {
            online_markers: owned(DEFAULT_ONLINE_MARKERS),
            tech_keywords: owned(DEFAULT_TECH_KEYWORDS),
            non_tech_keywords: owned(DEFAULT_NON_TECH_KEYWORDS),
        }
    }
}

impl ClassificationRules {
    /// Loads `rules/classification.yaml`, falling back to the built-in tables
    /// when the file does not exist.
    pub fn from_workspace_root(root: &Path) -> Result<Self, RulesError> {
        let path = root.join(RULES_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, RulesError> {
        let raw = fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut rules: Self = serde_yaml::from_str(&raw).map_err(|source| RulesError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if rules.online_markers.is_empty() {
            rules.online_markers = Self::default().online_markers;
        }
        Ok(rules)
    }

    pub fn is_offline(&self, event_type: EventType, location: &str, title: &str) -> bool {
        contains_any(&combined(event_type, location, title), &self.online_markers).is_none()
    }

    /// A non-tech keyword rejects the title before tech keywords are checked.
    pub fn is_tech_relevant(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        if contains_any(&title, &self.non_tech_keywords).is_some() {
            return false;
        }
        self.tech_keywords
            .iter()
            .any(|keyword| matches_keyword(&title, &keyword.to_lowercase()))
    }
}

/// Short keywords like `ai` only match as whole words.
fn matches_keyword(title: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    if keyword.len() > 3 {
        return title.contains(keyword);
    }
    title
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == keyword)
}
