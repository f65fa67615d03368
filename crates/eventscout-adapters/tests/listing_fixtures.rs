use std::fs;
use std::path::{Path, PathBuf};

use eventscout_adapters::listing::parse_listing;
use eventscout_adapters::{ListingTarget, SourceConfig, SourceRegistry};
use eventscout_core::{EventCandidate, EventType};
use serde::Deserialize;

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
struct GoldenEvent {
    name: String,
    website: String,
    date_time: String,
    date: String,
    time: String,
    location: String,
    address: String,
    description: String,
    event_type: Option<EventType>,
}

impl From<&EventCandidate> for GoldenEvent {
    fn from(candidate: &EventCandidate) -> Self {
        Self {
            name: candidate.name.clone(),
            website: candidate.website.clone(),
            date_time: candidate.date_time.clone(),
            date: candidate.date.clone(),
            time: candidate.time.clone(),
            location: candidate.location.clone(),
            address: candidate.address.clone(),
            description: candidate.description.clone(),
            event_type: candidate.event_type,
        }
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn registry() -> SourceRegistry {
    let text = fs::read_to_string(workspace_root().join("sources.yaml")).expect("read sources.yaml");
    serde_yaml::from_str(&text).expect("parse sources.yaml")
}

fn first_target(source: &SourceConfig) -> ListingTarget {
    match (source.listing_urls.first(), source.pagination.as_ref()) {
        (Some(target), _) => target.clone(),
        (None, Some(pagination)) => ListingTarget::new(pagination.page_url(pagination.first_page)),
        (None, None) => panic!("{} has no listing pages", source.name),
    }
}

fn parse_fixture(source_name: &str) -> Vec<EventCandidate> {
    let registry = registry();
    let source = registry.find(source_name).expect("source configured");
    let html = fs::read_to_string(
        workspace_root()
            .join("fixtures")
            .join(source_name)
            .join("listing.html"),
    )
    .expect("read listing fixture");
    parse_listing(&html, source, &first_target(source)).expect("parse listing")
}

fn read_snapshot(source_name: &str) -> Vec<GoldenEvent> {
    let path = workspace_root()
        .join("fixtures")
        .join(source_name)
        .join("snapshot.json");
    let text = fs::read_to_string(path).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

fn assert_matches_snapshot(source_name: &str) {
    let events = parse_fixture(source_name);
    assert!(
        events.iter().all(|event| event.platform == source_name),
        "platform tag is the source name"
    );
    let actual: Vec<GoldenEvent> = events.iter().map(GoldenEvent::from).collect();
    assert_eq!(actual, read_snapshot(source_name));
}

#[test]
fn golden_json_snapshot_test_allevents() {
    assert_matches_snapshot("allevents");
}

#[test]
fn golden_json_snapshot_test_biec() {
    assert_matches_snapshot("biec");
}

#[test]
fn golden_json_snapshot_test_hasgeek() {
    assert_matches_snapshot("hasgeek");
}

#[test]
fn golden_json_snapshot_test_townscript() {
    assert_matches_snapshot("townscript");
}

#[test]
fn golden_json_snapshot_test_meetup() {
    assert_matches_snapshot("meetup");
}

#[test]
fn golden_json_snapshot_test_hitex() {
    assert_matches_snapshot("hitex");
}

#[test]
fn golden_json_snapshot_test_echai() {
    assert_matches_snapshot("echai");
}

#[test]
fn registry_lists_every_source_in_crawl_order() {
    let registry = registry();
    let names: Vec<&str> = registry.enabled().map(|source| source.name.as_str()).collect();
    assert_eq!(
        names,
        ["allevents", "biec", "hasgeek", "townscript", "meetup", "hitex", "echai"]
    );
    for source in registry.enabled() {
        assert!(
            workspace_root()
                .join("fixtures")
                .join(&source.name)
                .join("listing.html")
                .exists(),
            "{} has a listing fixture",
            source.name
        );
    }
}
