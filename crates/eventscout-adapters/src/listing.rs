//! Listing page parsers. Pure functions from page body to candidates so they
//! can be exercised against saved pages.

use std::collections::HashSet;

use eventscout_core::{EventCandidate, EventType};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};
use url::Url;

use crate::config::{
    EmbeddedJsonRules, ExtractRules, FieldRule, HeadingBlockRules, ListingTarget, SelectorRules,
    SourceConfig, SplitRule,
};
use crate::sanitize::{absolute_url, clean_text, element_text, text_or_none};
use crate::AdapterError;

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b20\d{2}\b").expect("year regex"));

/// Parses one listing page of `source`. Title exclusions and per-page
/// de-duplication are applied here; date, online and tech filtering happen
/// later in the sync pipeline.
pub fn parse_listing(
    html: &str,
    source: &SourceConfig,
    target: &ListingTarget,
) -> Result<Vec<EventCandidate>, AdapterError> {
    let candidates = match &source.extract {
        ExtractRules::Selectors(rules) => parse_selectors(html, source, rules, target)?,
        ExtractRules::HeadingBlocks(rules) => parse_heading_blocks(html, source, rules, target)?,
        ExtractRules::EmbeddedJson(rules) => parse_embedded_json(html, source, rules, target)?,
    };
    Ok(finish(candidates, &source.exclude_title_keywords))
}

fn finish(candidates: Vec<EventCandidate>, exclude_title_keywords: &[String]) -> Vec<EventCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| {
            let title = candidate.name.to_lowercase();
            match exclude_title_keywords
                .iter()
                .find(|keyword| title.contains(&keyword.to_lowercase()))
            {
                Some(keyword) => {
                    debug!(title = %candidate.name, keyword = %keyword, "excluded by title keyword");
                    false
                }
                None => true,
            }
        })
        .filter(|candidate| {
            let key = if candidate.website.is_empty() {
                format!("{}|{}", candidate.name.to_lowercase(), candidate.date_text())
            } else {
                candidate.website.clone()
            };
            seen.insert(key)
        })
        .collect()
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

struct CompiledField {
    selector: Option<Selector>,
    attr: Option<String>,
    parent: bool,
    split: Option<SplitRule>,
    pattern: Option<Regex>,
}

impl CompiledField {
    fn compile(rule: &FieldRule) -> Result<Self, AdapterError> {
        let selector = rule.selector.as_deref().map(parse_selector).transpose()?;
        let pattern = rule
            .pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| AdapterError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self {
            selector,
            attr: rule.attr.clone(),
            parent: rule.parent,
            split: rule.split.clone(),
            pattern,
        })
    }

    fn extract(&self, item: ElementRef<'_>) -> Option<String> {
        let mut element = match &self.selector {
            Some(selector) => item.select(selector).next()?,
            None => item,
        };
        if self.parent {
            element = element.parent().and_then(ElementRef::wrap)?;
        }

        let mut value = match &self.attr {
            Some(attr) => clean_text(element.value().attr(attr)?),
            None => element_text(element),
        };
        if let Some(split) = &self.split {
            value = split_part(&value, split)?;
        }
        if let Some(pattern) = &self.pattern {
            value = pattern.find(&value)?.as_str().to_string();
        }
        text_or_none(value)
    }
}

fn split_part(value: &str, split: &SplitRule) -> Option<String> {
    let parts: Vec<&str> = value.split(split.separator.as_str()).collect();
    if split.part >= parts.len() {
        return None;
    }
    let picked = if split.rest {
        parts[split.part..].join(split.separator.as_str())
    } else {
        parts[split.part].to_string()
    };
    text_or_none(picked)
}

struct CompiledFields(Vec<CompiledField>);

impl CompiledFields {
    fn compile(rules: &[FieldRule]) -> Result<Self, AdapterError> {
        rules
            .iter()
            .map(CompiledField::compile)
            .collect::<Result<Vec<_>, _>>()
            .map(CompiledFields)
    }

    fn first(&self, item: ElementRef<'_>) -> Option<String> {
        self.0.iter().find_map(|field| field.extract(item))
    }

    fn first_or_empty(&self, item: ElementRef<'_>) -> String {
        self.first(item).unwrap_or_default()
    }
}

pub fn parse_selectors(
    html: &str,
    source: &SourceConfig,
    rules: &SelectorRules,
    target: &ListingTarget,
) -> Result<Vec<EventCandidate>, AdapterError> {
    let document = Html::parse_document(html);
    let name = CompiledFields::compile(&rules.name)?;
    let link = CompiledFields::compile(&rules.link)?;
    let date_time = CompiledFields::compile(&rules.date_time)?;
    let date = CompiledFields::compile(&rules.date)?;
    let time = CompiledFields::compile(&rules.time)?;
    let location = CompiledFields::compile(&rules.location)?;
    let description = CompiledFields::compile(&rules.description)?;

    let default_location = target
        .default_location
        .as_deref()
        .or(rules.default_location.as_deref())
        .unwrap_or_default();

    for item_selector in &rules.items {
        let selector = parse_selector(item_selector)?;
        let mut candidates = Vec::new();
        for item in document.select(&selector) {
            let Some(title) = name.first(item) else {
                continue;
            };
            if title.chars().count() < rules.min_name_len {
                continue;
            }

            let mut candidate = EventCandidate::new(title, &source.name);
            candidate.website = link
                .first(item)
                .map(|href| absolute_url(&source.base_url, &href))
                .unwrap_or_default();
            candidate.date_time = date_time.first_or_empty(item);
            candidate.date = date.first_or_empty(item);
            candidate.time = time.first_or_empty(item);
            candidate.location = location
                .first(item)
                .unwrap_or_else(|| default_location.to_string());
            candidate.description = description.first_or_empty(item);
            candidate.address = rules.default_address.clone().unwrap_or_default();
            candidate.event_type = rules.event_type;
            candidates.push(candidate);
        }
        if !candidates.is_empty() {
            debug!(selector = %item_selector, events = candidates.len(), "listing items matched");
            return Ok(candidates);
        }
    }
    Ok(Vec::new())
}

pub fn parse_heading_blocks(
    html: &str,
    source: &SourceConfig,
    rules: &HeadingBlockRules,
    target: &ListingTarget,
) -> Result<Vec<EventCandidate>, AdapterError> {
    let document = Html::parse_document(html);
    let heading_selector = parse_selector(&rules.heading)?;
    let link_selector = parse_selector("a")?;
    let read_more = rules.read_more_text.to_lowercase();

    let mut candidates = Vec::new();
    for heading in document.select(&heading_selector) {
        let Some(title_link) = heading.select(&link_selector).next() else {
            continue;
        };
        let title = element_text(title_link);
        if title.is_empty() {
            continue;
        }

        let mut website = title_link
            .value()
            .attr("href")
            .map(|href| absolute_url(&source.base_url, href))
            .unwrap_or_default();
        let mut block = HeadingBlock::default();

        for sibling in heading.next_siblings() {
            match sibling.value() {
                Node::Text(text) => block.classify_line(&clean_text(text), rules),
                Node::Element(element) => {
                    let tag = element.name();
                    if rules.block_end_tags.iter().any(|end| end.eq_ignore_ascii_case(tag)) {
                        break;
                    }
                    let Some(element_ref) = ElementRef::wrap(sibling) else {
                        continue;
                    };
                    match tag {
                        "strong" | "b" => {
                            if block.organizer.is_empty() {
                                block.organizer = element_text(element_ref);
                            }
                        }
                        "a" => {
                            let text = element_text(element_ref).to_lowercase();
                            if text.contains(&read_more) {
                                if let Some(href) = element.attr("href").filter(|h| !h.is_empty()) {
                                    website = absolute_url(&source.base_url, href);
                                }
                            }
                        }
                        "br" => {}
                        _ => block.classify_line(&element_text(element_ref), rules),
                    }
                }
                _ => {}
            }
        }

        let mut candidate = EventCandidate::new(title, &source.name);
        candidate.website = website;
        candidate.date = block.date;
        candidate.time = block.time;
        candidate.location = if block.location.is_empty() {
            target
                .default_location
                .clone()
                .or_else(|| rules.default_location.clone())
                .unwrap_or_default()
        } else {
            block.location
        };
        candidate.address = rules.default_address.clone().unwrap_or_default();
        if !block.organizer.is_empty() {
            candidate.description = format!("Organized by: {}", block.organizer);
        }
        candidate.event_type = Some(EventType::Offline);
        candidates.push(candidate);
    }
    Ok(candidates)
}

#[derive(Debug, Default)]
struct HeadingBlock {
    organizer: String,
    date: String,
    time: String,
    location: String,
}

impl HeadingBlock {
    fn classify_line(&mut self, line: &str, rules: &HeadingBlockRules) {
        if line.is_empty() {
            return;
        }
        if self.date.is_empty() && is_date_line(line) {
            self.date = line.to_string();
        } else if self.time.is_empty() && is_time_line(line) {
            self.time = line.to_string();
        } else if self.location.is_empty() && is_location_line(line, &rules.location_markers) {
            self.location = line.to_string();
        }
    }
}

/// A month name plus a four-digit year, e.g. "February 26 - March 01, 2026".
fn is_date_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    MONTH_NAMES.iter().any(|month| lower.contains(month)) && YEAR.is_match(line)
}

/// "9:00am - 6:00pm"
fn is_time_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    (lower.contains("am") || lower.contains("pm")) && line.contains(':')
}

fn is_location_line(line: &str, markers: &[String]) -> bool {
    let lower = line.to_lowercase();
    markers.iter().any(|marker| lower.contains(&marker.to_lowercase()))
}

pub fn parse_embedded_json(
    html: &str,
    source: &SourceConfig,
    rules: &EmbeddedJsonRules,
    target: &ListingTarget,
) -> Result<Vec<EventCandidate>, AdapterError> {
    let document = Html::parse_document(html);
    let script_selector = parse_selector(&rules.script)?;
    let fallback_city = target.default_location.as_deref().unwrap_or_default();

    let mut candidates = Vec::new();
    for script in document.select(&script_selector) {
        let raw: String = script.text().collect();
        let data: JsonValue = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                warn!(source = %source.name, error = %err, "embedded json did not parse");
                continue;
            }
        };
        let Some(page_props) = data.pointer("/props/pageProps").and_then(JsonValue::as_object) else {
            continue;
        };

        let listed: Vec<EventCandidate> = listed_event_objects(page_props)
            .into_iter()
            .filter_map(|object| embedded_event(object, source, fallback_city))
            .collect();
        if !listed.is_empty() {
            candidates.extend(listed);
            continue;
        }

        if let Some(apollo) = page_props.get("__APOLLO_STATE__").and_then(JsonValue::as_object) {
            candidates.extend(
                apollo
                    .values()
                    .filter_map(JsonValue::as_object)
                    .filter(|object| is_event_like(object))
                    .filter_map(|object| embedded_event(object, source, fallback_city)),
            );
        }
    }
    Ok(candidates)
}

/// `pageProps.events`, or the nodes of `pageProps.searchResults.edges`.
fn listed_event_objects(page_props: &Map<String, JsonValue>) -> Vec<&Map<String, JsonValue>> {
    let list = page_props
        .get("events")
        .and_then(JsonValue::as_array)
        .or_else(|| {
            page_props
                .get("searchResults")
                .and_then(|results| results.get("edges"))
                .and_then(JsonValue::as_array)
        });
    list.map(|items| {
        items
            .iter()
            .filter_map(JsonValue::as_object)
            .map(|item| item.get("node").and_then(JsonValue::as_object).unwrap_or(item))
            .collect()
    })
    .unwrap_or_default()
}

fn is_event_like(object: &Map<String, JsonValue>) -> bool {
    match json_str(object, &["__typename"]) {
        Some(typename) => typename.to_lowercase().contains("event"),
        None => true,
    }
}

fn json_str<'a>(object: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| object.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn embedded_event(
    object: &Map<String, JsonValue>,
    source: &SourceConfig,
    fallback_city: &str,
) -> Option<EventCandidate> {
    let title = clean_text(&json_str(object, &["title", "name"])?.replace('\u{a0}', " "));
    if title.is_empty() {
        return None;
    }
    let website = embedded_event_url(json_str(object, &["eventUrl", "link", "url"])?, &source.base_url)?;

    let venue = object.get("venue").and_then(JsonValue::as_object);
    let venue_field = |key: &str| {
        venue
            .and_then(|venue| json_str(venue, &[key]))
            .map(|value| clean_text(&value.replace('\u{a0}', " ")))
            .unwrap_or_default()
    };
    let venue_name = venue_field("name");
    let venue_address = venue_field("address");
    let venue_city = venue_field("city");

    let city = if venue_city.is_empty() {
        fallback_city.to_string()
    } else {
        venue_city
    };
    let location = [venue_name.as_str(), venue_address.as_str(), city.as_str()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    let is_online = object
        .get("isOnline")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    let mut candidate = EventCandidate::new(title, &source.name);
    candidate.website = website;
    candidate.date_time = json_str(object, &["dateTime", "time", "localDateTime"])
        .unwrap_or_default()
        .to_string();
    candidate.location = location;
    candidate.address = venue_address;
    candidate.description = json_str(object, &["description"])
        .unwrap_or_default()
        .to_string();
    candidate.event_type = Some(if is_online {
        EventType::Online
    } else {
        EventType::Offline
    });
    Some(candidate)
}

/// Absolute event URL, or `None` for values that are not links to the source.
fn embedded_event_url(href: &str, base_url: &str) -> Option<String> {
    if href.starts_with("http://")
        || href.starts_with("https://")
        || href.starts_with("//")
        || href.starts_with('/')
    {
        return text_or_none(absolute_url(base_url, href));
    }
    let host = Url::parse(base_url).ok()?.host_str()?.trim_start_matches("www.").to_string();
    if href.contains(&format!("{host}/")) {
        return Some(format!("https://{href}"));
    }
    None
}
