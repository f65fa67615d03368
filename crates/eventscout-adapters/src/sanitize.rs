//! Text and markup cleanup shared by listing and detail parsers.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use url::Url;

static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("script regex"));
static STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("style regex"));
static IFRAME_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<iframe[^>]*>.*?</iframe>").expect("iframe regex"));
static NOSCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<noscript[^>]*>.*?</noscript>").expect("noscript regex"));
static INLINE_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\s+on\w+="[^"]*""#).expect("handler regex"));
static JAVASCRIPT_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href="javascript:[^"]*""#).expect("href regex"));
static GAP_BETWEEN_TAGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">\s{3,}<").expect("gap regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Strips active content from captured markup while keeping formatting tags,
/// so the result can be rendered as-is by a client.
pub fn sanitize_html(html: &str) -> String {
    let html = SCRIPT_BLOCK.replace_all(html, "");
    let html = STYLE_BLOCK.replace_all(&html, "");
    let html = IFRAME_BLOCK.replace_all(&html, "");
    let html = NOSCRIPT_BLOCK.replace_all(&html, "");
    let html = INLINE_HANDLER.replace_all(&html, "");
    let html = JAVASCRIPT_HREF.replace_all(&html, r##"href="#""##);
    let html = GAP_BETWEEN_TAGS.replace_all(&html, "><");
    html.replace('\0', "").trim().to_string()
}

/// Collapses runs of whitespace and trims.
pub fn clean_text(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

pub fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Resolves `href` against `base`. Already absolute and protocol-relative
/// links pass through; unresolvable input is returned unchanged.
pub fn absolute_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    match Url::parse(base).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_html_removes_active_content() {
        let html = r#"
            <div onclick="steal()"><script>alert(1)</script><p>Keep   me</p>
            <style>p{}</style><iframe src="x"></iframe><noscript>no</noscript>
            <a href="javascript:void(0)">link</a></div>
        "#;
        let cleaned = sanitize_html(html);
        assert!(!cleaned.contains("script"));
        assert!(!cleaned.contains("style"));
        assert!(!cleaned.contains("iframe"));
        assert!(!cleaned.contains("onclick"));
        assert!(cleaned.contains(r##"<a href="#">link</a>"##));
        assert!(cleaned.starts_with("<div>"));
        assert!(cleaned.contains("<p>Keep   me</p>"));
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  Rust \n\t Meetup  "), "Rust Meetup");
    }

    #[test]
    fn absolute_url_resolves_relative_links() {
        assert_eq!(
            absolute_url("https://hasgeek.com/rootconf/", "/rootconf/2026"),
            "https://hasgeek.com/rootconf/2026"
        );
        assert_eq!(absolute_url("https://a.in/x", "//cdn.a.in/i.png"), "https://cdn.a.in/i.png");
        assert_eq!(absolute_url("https://a.in/x", "https://b.in/y"), "https://b.in/y");
        assert_eq!(absolute_url("not a url", "/e/1"), "/e/1");
        assert_eq!(absolute_url("https://a.in", ""), "");
    }
}
