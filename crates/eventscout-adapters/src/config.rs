//! `sources.yaml` schema.

use eventscout_core::EventType;
use eventscout_storage::FetchMode;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }

    pub fn find(&self, name: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|source| source.name.eq_ignore_ascii_case(name))
    }

    /// Fetch mode for detail pages of `platform`; unknown platforms use plain HTTP.
    pub fn detail_fetch_mode(&self, platform: &str) -> FetchMode {
        self.find(platform)
            .map(SourceConfig::detail_fetch_mode)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Also the platform tag written on every event from this source.
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default)]
    pub detail_fetch_mode: Option<FetchMode>,
    #[serde(default)]
    pub listing_urls: Vec<ListingTarget>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    /// Re-fetch through the browser when a plain HTTP body is smaller than this.
    #[serde(default)]
    pub browser_fallback_min_bytes: Option<usize>,
    /// Overrides the configured inter-page delay for this source.
    #[serde(default)]
    pub page_delay_ms: Option<u64>,
    #[serde(default)]
    pub tech_filter: bool,
    #[serde(default)]
    pub exclude_title_keywords: Vec<String>,
    pub extract: ExtractRules,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn detail_fetch_mode(&self) -> FetchMode {
        self.detail_fetch_mode.unwrap_or(self.fetch_mode)
    }
}

/// One listing page, optionally carrying the location assumed for events
/// that do not state their own (per-city listings).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ListingTargetSpec")]
pub struct ListingTarget {
    pub url: String,
    pub default_location: Option<String>,
}

impl ListingTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            default_location: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListingTargetSpec {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        default_location: Option<String>,
    },
}

impl From<ListingTargetSpec> for ListingTarget {
    fn from(spec: ListingTargetSpec) -> Self {
        match spec {
            ListingTargetSpec::Url(url) => ListingTarget::new(url),
            ListingTargetSpec::Detailed {
                url,
                default_location,
            } => ListingTarget {
                url,
                default_location,
            },
        }
    }
}

/// Numbered listing pages built from a `{page}` template.
#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub url_template: String,
    #[serde(default = "default_first_page")]
    pub first_page: u32,
    pub max_pages: u32,
    /// Consecutive empty pages after which paging stops.
    #[serde(default = "default_stop_after_empty")]
    pub stop_after_empty: u32,
}

fn default_first_page() -> u32 {
    1
}

fn default_stop_after_empty() -> u32 {
    2
}

impl Pagination {
    pub fn page_url(&self, page: u32) -> String {
        self.url_template.replace("{page}", &page.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractRules {
    Selectors(SelectorRules),
    HeadingBlocks(HeadingBlockRules),
    EmbeddedJson(EmbeddedJsonRules),
}

impl ExtractRules {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractRules::Selectors(_) => "selectors",
            ExtractRules::HeadingBlocks(_) => "heading_blocks",
            ExtractRules::EmbeddedJson(_) => "embedded_json",
        }
    }
}

/// Card-style listings: one element per event, one rule list per field.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorRules {
    /// Tried in order; the first selector matching anything is used.
    pub items: Vec<String>,
    pub name: Vec<FieldRule>,
    #[serde(default)]
    pub link: Vec<FieldRule>,
    #[serde(default)]
    pub date_time: Vec<FieldRule>,
    #[serde(default)]
    pub date: Vec<FieldRule>,
    #[serde(default)]
    pub time: Vec<FieldRule>,
    #[serde(default)]
    pub location: Vec<FieldRule>,
    #[serde(default)]
    pub description: Vec<FieldRule>,
    #[serde(default)]
    pub default_location: Option<String>,
    #[serde(default)]
    pub default_address: Option<String>,
    #[serde(default)]
    pub event_type: Option<EventType>,
    /// Minimum title length in characters.
    #[serde(default)]
    pub min_name_len: usize,
}

/// Extracts one value from an item element. Rules for a field are tried in
/// order and the first non-empty value wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldRule {
    /// Relative to the item; absent means the item itself.
    #[serde(default)]
    pub selector: Option<String>,
    /// Read this attribute instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Use the text of the matched element's parent.
    #[serde(default)]
    pub parent: bool,
    #[serde(default)]
    pub split: Option<SplitRule>,
    /// Keep only the first regex match of the value.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitRule {
    pub separator: String,
    #[serde(default)]
    pub part: usize,
    /// Join every part from `part` onwards instead of taking just one.
    #[serde(default)]
    pub rest: bool,
}

/// Listings where each event is a heading followed by loose sibling lines
/// (organizer in `<strong>`, then date, time and location lines).
#[derive(Debug, Clone, Deserialize)]
pub struct HeadingBlockRules {
    #[serde(default = "default_heading")]
    pub heading: String,
    /// Sibling tags that end the current block.
    #[serde(default = "default_block_end_tags")]
    pub block_end_tags: Vec<String>,
    #[serde(default = "default_read_more_text")]
    pub read_more_text: String,
    /// Lower-case fragments that mark a line as a location.
    #[serde(default)]
    pub location_markers: Vec<String>,
    #[serde(default)]
    pub default_location: Option<String>,
    #[serde(default)]
    pub default_address: Option<String>,
}

fn default_heading() -> String {
    "h3".to_string()
}

fn default_block_end_tags() -> Vec<String> {
    vec!["img".to_string(), "h3".to_string()]
}

fn default_read_more_text() -> String {
    "read more".to_string()
}

/// Event objects embedded as JSON in a script element (Next.js pages).
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddedJsonRules {
    #[serde(default = "default_script_selector")]
    pub script: String,
}

fn default_script_selector() -> String {
    "script#__NEXT_DATA__".to_string()
}
