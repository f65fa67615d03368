//! Detail page parsers, one per known platform plus a generic fallback.

use eventscout_core::{RefreshCandidate, ScrapedDetail, Speaker};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use serde_json::Value as JsonValue;

use crate::listing::parse_selector;
use crate::sanitize::{absolute_url, clean_text, element_text, sanitize_html, text_or_none};
use crate::AdapterError;

const HITEX_ORGANIZER: &str = "HITEX - Hyderabad International Trade Expositions";
const BIEC_ORGANIZER: &str = "BIEC - Bangalore International Exhibition Centre";
const ECHAI_ORGANIZER: &str = "eChai Ventures";

static MEETUP_PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)charges?:\s*Rs\.?\s*(\d+)").expect("price regex"));
static MEETUP_CONTACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)contact\s*us?:\s*(\d{10})").expect("contact regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailParser {
    AllEvents,
    HasGeek,
    Meetup,
    Townscript,
    Biec,
    Hitex,
    EChai,
    Generic,
}

/// A parsed detail page. `follow_up` names an external page whose content
/// should be merged with [`merge_external`] before saving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDetail {
    pub detail: ScrapedDetail,
    pub follow_up: Option<String>,
}

impl DetailParser {
    pub fn for_platform(platform: &str) -> Self {
        match platform.trim().to_ascii_lowercase().as_str() {
            "allevents" => DetailParser::AllEvents,
            "hasgeek" => DetailParser::HasGeek,
            "meetup" => DetailParser::Meetup,
            "townscript" => DetailParser::Townscript,
            "biec" => DetailParser::Biec,
            "hitex" => DetailParser::Hitex,
            "echai" => DetailParser::EChai,
            _ => DetailParser::Generic,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DetailParser::AllEvents => "allevents",
            DetailParser::HasGeek => "hasgeek",
            DetailParser::Meetup => "meetup",
            DetailParser::Townscript => "townscript",
            DetailParser::Biec => "biec",
            DetailParser::Hitex => "hitex",
            DetailParser::EChai => "echai",
            DetailParser::Generic => "generic",
        }
    }

    pub fn parse(&self, html: &str, event: &RefreshCandidate) -> Result<ParsedDetail, AdapterError> {
        let document = Html::parse_document(html);
        let page = Page {
            document: &document,
        };

        let mut detail = ScrapedDetail::new(event.event_id);
        detail.registration_url = event.website.clone();
        detail.image_url = page.meta_property("og:image")?;

        let mut follow_up = None;
        match self {
            DetailParser::AllEvents => page.all_events(&mut detail, &event.website)?,
            DetailParser::HasGeek => {
                detail.full_description =
                    page.first_html(&[".markdown", ".event__description", "article.markdown"], 50)?;
                detail.organizer = page.first_text(".profile__fullname, .organizer")?;
            }
            DetailParser::Meetup => page.meetup(&mut detail)?,
            DetailParser::Townscript => {
                detail.full_description =
                    page.first_html(&[".event-description-text", ".description-content"], 50)?;
                if detail.image_url.is_empty() {
                    detail.image_url = page
                        .first_attr(".event-image img, .banner img", "src")?
                        .map(|src| absolute_url(&event.website, &src))
                        .unwrap_or_default();
                }
                detail.organizer = page.first_text(".organizer-info, .organizer-name, .host")?;
            }
            DetailParser::Biec => page.biec(&mut detail)?,
            DetailParser::Hitex => {
                detail.organizer = HITEX_ORGANIZER.to_string();
                follow_up = page.hitex_external_link()?;
                if follow_up.is_none() {
                    detail.full_description = page
                        .first_html(&[".event-description", ".content", "article", "main"], 100)?;
                }
            }
            DetailParser::EChai => page.echai(&mut detail)?,
            DetailParser::Generic => {
                detail.full_description = page.first_html(
                    &[
                        ".event-description",
                        ".description",
                        ".content",
                        "article",
                        "[itemprop='description']",
                        ".about",
                        ".details",
                        "main",
                        ".event-content",
                        ".event-details",
                        ".event-info",
                    ],
                    100,
                )?;
                detail.organizer = page.first_text(".organizer, .author, [itemprop='organizer']")?;
            }
        }

        page.apply_structured_data(&mut detail)?;
        detail.set_scraped_body(html);
        Ok(ParsedDetail { detail, follow_up })
    }
}

/// Fills the description (and a missing image) from an external organizer page.
pub fn merge_external(detail: &mut ScrapedDetail, html: &str) -> Result<(), AdapterError> {
    let document = Html::parse_document(html);
    let page = Page {
        document: &document,
    };

    let description = page.first_html(
        &[
            "section.section",
            ".about-event",
            "[class*='about']",
            ".event-description",
            ".event-content",
            "article",
            "main",
        ],
        100,
    )?;
    detail.full_description = if description.is_empty() {
        let paragraph = parse_selector("p")?;
        document
            .select(&paragraph)
            .map(element_text)
            .filter(|text| text.len() > 50)
            .map(|text| format!("<p>{text}</p>"))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        description
    };

    if detail.image_url.is_empty() {
        detail.image_url = page.meta_property("og:image")?;
    }
    Ok(())
}

struct Page<'a> {
    document: &'a Html,
}

impl<'a> Page<'a> {
    fn first(&self, selector: &str) -> Result<Option<ElementRef<'a>>, AdapterError> {
        let selector = parse_selector(selector)?;
        Ok(self.document.select(&selector).next())
    }

    fn first_text(&self, selector: &str) -> Result<String, AdapterError> {
        Ok(self.first(selector)?.map(element_text).unwrap_or_default())
    }

    fn first_attr(&self, selector: &str, attr: &str) -> Result<Option<String>, AdapterError> {
        Ok(self
            .first(selector)?
            .and_then(|element| element.value().attr(attr))
            .and_then(|value| text_or_none(value.to_string())))
    }

    fn meta_property(&self, property: &str) -> Result<String, AdapterError> {
        Ok(self
            .first_attr(&format!("meta[property='{property}']"), "content")?
            .unwrap_or_default())
    }

    /// Sanitized inner markup of the first selector whose markup is longer
    /// than `min_len` bytes.
    fn first_html(&self, selectors: &[&str], min_len: usize) -> Result<String, AdapterError> {
        for selector in selectors {
            if let Some(element) = self.first(selector)? {
                let html = element.inner_html();
                if html.trim().len() > min_len {
                    return Ok(sanitize_html(&html));
                }
            }
        }
        Ok(String::new())
    }

    fn all_events(&self, detail: &mut ScrapedDetail, website: &str) -> Result<(), AdapterError> {
        detail.full_description = self.first_html(
            &[
                ".event-description-html",
                ".event-description",
                ".description-content",
                ".about-event",
            ],
            50,
        )?;
        detail.organizer =
            self.first_text(".organizer-name, .event-organizer, [itemprop='organizer']")?;
        if let Some(href) =
            self.first_attr("a.register-button, a.book-ticket, a[href*='register']", "href")?
        {
            detail.registration_url = absolute_url(website, &href);
        }

        let tag_selector = parse_selector(".event-tags a, .tag, .category-tag")?;
        for tag in self.document.select(&tag_selector).map(element_text) {
            if !tag.is_empty() && tag.len() < 50 && !detail.tags.contains(&tag) {
                detail.tags.push(tag);
            }
        }
        Ok(())
    }

    fn meetup(&self, detail: &mut ScrapedDetail) -> Result<(), AdapterError> {
        detail.full_description = self.first_html(
            &[
                ".w-full.break-words",
                "[data-event-label='event-description']",
                ".event-description",
                ".description",
            ],
            50,
        )?;
        detail.organizer = self.first_text(".groupName, .organizer-name")?;

        let plain = self.first_text(".w-full.break-words")?;
        if let Some(caps) = MEETUP_PRICE.captures(&plain) {
            detail.price = format!("₹{}", &caps[1]);
        }
        if let Some(caps) = MEETUP_CONTACT.captures(&plain) {
            detail.organizer_contact = caps[1].to_string();
        }
        Ok(())
    }

    fn biec(&self, detail: &mut ScrapedDetail) -> Result<(), AdapterError> {
        let mut sections = Vec::new();
        for (selector, heading) in [(".eve-detail", "Event Details"), (".eve-venue", "Venue")] {
            if let Some(container) = self.first(selector)?.and_then(parent_element) {
                if element_text(container).len() > 10 {
                    sections.push(format!("<h3>{heading}</h3>{}", sanitize_html(&container.inner_html())));
                }
            }
        }
        detail.full_description = sections.join("\n");

        let organizer_section = self.first(".eve-org")?.and_then(parent_element);
        if let Some(section) = organizer_section {
            let bold = parse_selector("p b")?;
            detail.organizer = section.select(&bold).next().map(element_text).unwrap_or_default();
            let mail = parse_selector("a[href^='mailto:']")?;
            if let Some(href) = section.select(&mail).next().and_then(|a| a.value().attr("href")) {
                detail.organizer_contact = href.trim_start_matches("mailto:").to_string();
            }
        }
        if detail.organizer.is_empty() {
            detail.organizer = BIEC_ORGANIZER.to_string();
        }
        Ok(())
    }

    /// The external "Website" button on a HITEX event page.
    fn hitex_external_link(&self) -> Result<Option<String>, AdapterError> {
        let buttons = parse_selector("a.btn[href], a[type='button'][href]")?;
        Ok(self
            .document
            .select(&buttons)
            .filter(|button| element_text(*button).to_lowercase().contains("website"))
            .filter_map(|button| button.value().attr("href"))
            .map(str::trim)
            .find(|href| href.starts_with("http") && !href.contains("hitex.co.in"))
            .map(str::to_string))
    }

    fn echai(&self, detail: &mut ScrapedDetail) -> Result<(), AdapterError> {
        detail.full_description = self.first_html(&[".event_short_description .trix-content"], 20)?;
        if detail.full_description.is_empty() {
            detail.full_description = self.first_html(&[".event_short_description"], 20)?;
        }
        if detail.full_description.is_empty() {
            detail.full_description = self.first_html(&["article"], 100)?;
        }
        if detail.full_description.is_empty() {
            for meta in ["meta[property='og:description']", "meta[name='description']"] {
                if let Some(text) = self.first_attr(meta, "content")? {
                    detail.full_description = format!("<p>{text}</p>");
                    break;
                }
            }
        }
        detail.organizer = ECHAI_ORGANIZER.to_string();
        Ok(())
    }

    /// Fills still-empty fields from a schema.org `Event` in JSON-LD.
    fn apply_structured_data(&self, detail: &mut ScrapedDetail) -> Result<(), AdapterError> {
        let scripts = parse_selector("script[type='application/ld+json']")?;
        let Some(event) = self
            .document
            .select(&scripts)
            .filter_map(|script| serde_json::from_str::<JsonValue>(&script.text().collect::<String>()).ok())
            .flat_map(|value| match value {
                JsonValue::Array(items) => items,
                other => vec![other],
            })
            .find(is_schema_event)
        else {
            return Ok(());
        };

        if detail.full_description.is_empty() {
            if let Some(text) = event.get("description").and_then(JsonValue::as_str) {
                let text = clean_text(text);
                if !text.is_empty() {
                    detail.full_description = format!("<p>{text}</p>");
                }
            }
        }
        if detail.organizer.is_empty() {
            detail.organizer = named(event.get("organizer")).unwrap_or_default();
        }
        if detail.image_url.is_empty() {
            detail.image_url = match event.get("image") {
                Some(JsonValue::String(url)) => url.clone(),
                Some(JsonValue::Array(urls)) => urls
                    .iter()
                    .find_map(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
        }
        if detail.price.is_empty() {
            detail.price = offer_price(event.get("offers")).unwrap_or_default();
        }
        if detail.max_attendees == 0 {
            detail.max_attendees = event
                .get("maximumAttendeeCapacity")
                .and_then(JsonValue::as_i64)
                .and_then(|value| i32::try_from(value).ok())
                .unwrap_or(0);
        }
        if detail.speakers.is_empty() {
            detail.speakers = speakers(event.get("performer"));
        }
        Ok(())
    }
}

fn parent_element(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.parent().and_then(ElementRef::wrap)
}

fn is_schema_event(value: &JsonValue) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(kind)) => kind.ends_with("Event"),
        Some(JsonValue::Array(kinds)) => kinds
            .iter()
            .filter_map(JsonValue::as_str)
            .any(|kind| kind.ends_with("Event")),
        _ => false,
    }
}

fn named(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(name) => text_or_none(clean_text(name)),
        JsonValue::Array(items) => items.iter().find_map(|item| named(Some(item))),
        other => other
            .get("name")
            .and_then(JsonValue::as_str)
            .and_then(|name| text_or_none(clean_text(name))),
    }
}

fn offer_price(offers: Option<&JsonValue>) -> Option<String> {
    let offer = match offers? {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    let price = match offer.get("price")? {
        JsonValue::String(price) => price.trim().to_string(),
        JsonValue::Number(price) => price.to_string(),
        _ => return None,
    };
    if price.is_empty() {
        return None;
    }
    match offer.get("priceCurrency").and_then(JsonValue::as_str) {
        Some(currency) => Some(format!("{currency} {price}")),
        None => Some(price),
    }
}

fn speakers(performers: Option<&JsonValue>) -> Vec<Speaker> {
    let items = match performers {
        Some(JsonValue::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(single) => vec![single],
        None => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|performer| {
            let name = named(Some(performer))?;
            Some(Speaker {
                name,
                role: performer
                    .get("jobTitle")
                    .and_then(JsonValue::as_str)
                    .and_then(|role| text_or_none(role.to_string())),
                profile_url: performer
                    .get("url")
                    .and_then(JsonValue::as_str)
                    .and_then(|url| text_or_none(url.to_string())),
            })
        })
        .collect()
}
