use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info_span, Instrument};

use crate::{sanitize_body, FetchError, DEFAULT_USER_AGENT};

/// Renders JavaScript-heavy pages by running a headless Chromium with
/// `--dump-dom` and capturing the serialized DOM from stdout.
#[derive(Debug, Clone)]
pub struct BrowserRenderer {
    binary: PathBuf,
    timeout: Duration,
    user_agent: String,
}

impl BrowserRenderer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub async fn render(&self, url: &str) -> Result<String, FetchError> {
        self.render_inner(url)
            .instrument(info_span!("browser_render", url))
            .await
    }

    async fn render_inner(&self, url: &str) -> Result<String, FetchError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!("--user-agent={}", self.user_agent))
            .arg("--virtual-time-budget=10000")
            .arg("--dump-dom")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(FetchError::Browser {
                    url: url.to_string(),
                    message: format!("spawning {}: {err}", self.binary.display()),
                })
            }
            Err(_) => {
                return Err(FetchError::BrowserTimeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Browser {
                url: url.to_string(),
                message: format!("exit {}: {}", output.status, stderr.trim()),
            });
        }

        let html = sanitize_body(&output.stdout);
        if html.trim().is_empty() {
            return Err(FetchError::Browser {
                url: url.to_string(),
                message: "empty DOM".to_string(),
            });
        }
        debug!(bytes = html.len(), "rendered page");
        Ok(html)
    }
}
