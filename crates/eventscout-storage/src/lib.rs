//! Page fetching (HTTP and headless browser) and event persistence for eventscout.

mod browser;
mod dedup;
pub mod memory;
pub mod pg;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use eventscout_core::{Event, EventCandidate, EventDetail, RefreshCandidate, ScrapedDetail};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub use browser::BrowserRenderer;
pub use memory::MemoryEventStore;
pub use pg::PgEventStore;

pub const CRATE_NAME: &str = "eventscout-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Timeouts, transport failures and bad statuses are all worth another try;
/// a request that cannot even be built is not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() || err.is_redirect() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per URL, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Linear backoff: the wait after attempt `n` (0-based) is `base * (n + 1)`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index.saturating_add(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
    #[error("no headless browser configured to render {url}")]
    BrowserUnavailable { url: String },
    #[error("browser failed to render {url}: {message}")]
    Browser { url: String, message: String },
    #[error("browser timed out after {timeout:?} rendering {url}")]
    BrowserTimeout { url: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    /// Fetches `url` and returns its body as sanitized text.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.fetch_bytes(url).await?;
        Ok(sanitize_body(&response.body))
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let failure = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                })
                            }
                            Err(err) => FetchError::Request(err),
                        }
                    } else {
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };

            attempt += 1;
            if attempt >= attempts {
                return Err(FetchError::RetriesExhausted {
                    attempts,
                    last: Box::new(failure),
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt - 1);
            debug!(attempt, error = %failure, delay_ms = delay.as_millis() as u64, "retrying fetch");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Decodes a page body, dropping invalid UTF-8 sequences and NUL bytes.
pub fn sanitize_body(bytes: &[u8]) -> String {
    let mut body = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        body.push_str(chunk.valid());
    }
    body.retain(|c| c != '\0');
    body
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    #[default]
    Http,
    Browser,
}

/// Everything adapters and the detail refresher need to obtain a page body.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, mode: FetchMode, url: &str) -> Result<String, FetchError>;
}

/// Routes plain fetches through [`HttpFetcher`] and rendered fetches through
/// the optional [`BrowserRenderer`].
#[derive(Debug, Clone)]
pub struct PageFetcher {
    http: HttpFetcher,
    browser: Option<BrowserRenderer>,
}

impl PageFetcher {
    pub fn new(http: HttpFetcher, browser: Option<BrowserRenderer>) -> Self {
        Self { http, browser }
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch_page(&self, mode: FetchMode, url: &str) -> Result<String, FetchError> {
        match mode {
            FetchMode::Http => self.http.fetch_text(url).await,
            FetchMode::Browser => match &self.browser {
                Some(browser) => browser.render(url).await,
                None => Err(FetchError::BrowserUnavailable {
                    url: url.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("event {event_id} does not exist")]
    UnknownEvent { event_id: i64 },
    #[error("event hash {hash} already exists")]
    DuplicateHash { hash: String },
    #[error("website {website} already belongs to event {existing_id}")]
    WebsiteConflict { website: String, existing_id: i64 },
    #[error("unexpected value {value:?} in column {column}")]
    Decode { column: &'static str, value: String },
}

/// Per-batch tally returned by [`EventStore::upsert_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailWrite {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformCount {
    pub platform: String,
    pub events: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_events: i64,
    pub platforms: Vec<PlatformCount>,
}

/// Persistence seam shared by the crawl and detail-refresh paths.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Validates, resolves identity and writes every candidate. A failing row
    /// is counted as skipped and never aborts the rest of the batch.
    async fn upsert_batch(&self, candidates: Vec<EventCandidate>) -> Result<BatchOutcome, StoreError>;

    async fn upsert_detail(&self, detail: &ScrapedDetail) -> Result<DetailWrite, StoreError>;

    /// Events with a visitable website whose detail row is missing or older
    /// than `stale_after`, most recently created first.
    async fn refresh_candidates(
        &self,
        stale_after: chrono::Duration,
        limit: Option<i64>,
    ) -> Result<Vec<RefreshCandidate>, StoreError>;

    async fn get_detail(&self, event_id: i64) -> Result<Option<EventDetail>, StoreError>;

    /// Most recently created events first.
    async fn recent_events(&self, limit: i64) -> Result<Vec<Event>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(status_line: &'static str, body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/events"), hits)
    }

    fn fast_fetcher(max_attempts: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
            },
        })
        .expect("client")
    }

    #[test]
    fn backoff_is_linear() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(6));
    }

    #[test]
    fn body_sanitization_drops_nul_and_invalid_utf8() {
        assert_eq!(sanitize_body(b"<p>ok\0</p>"), "<p>ok</p>");
        assert_eq!(sanitize_body(&[b'a', 0xff, 0xfe, b'b']), "ab");
        assert_eq!(sanitize_body("café".as_bytes()), "café");
        assert_eq!(sanitize_body("rating \u{FFFD} kept".as_bytes()), "rating \u{FFFD} kept");
    }

    #[tokio::test]
    async fn non_success_status_is_retried_until_attempts_run_out() {
        let (url, hits) = serve("500 Internal Server Error", b"").await;
        let err = fast_fetcher(3).fetch_bytes(&url).await.unwrap_err();

        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::HttpStatus { status: 500, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn successful_fetch_returns_sanitized_text() {
        let (url, hits) = serve("200 OK", b"<html>ok\0</html>").await;
        let text = fast_fetcher(3).fetch_text(&url).await.expect("fetch");
        assert_eq!(text, "<html>ok</html>");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn browser_mode_without_renderer_is_an_error() {
        let pages = PageFetcher::new(fast_fetcher(1), None);
        let err = pages
            .fetch_page(FetchMode::Browser, "https://echai.ventures/events")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BrowserUnavailable { .. }));
    }
}
