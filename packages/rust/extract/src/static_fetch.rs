//! Static fetch-and-parse extraction strategy.
//!
//! Cheap and stateless: one HTTP GET (optionally carrying a session
//! cookie), then DOM extraction. Detects login walls so callers can fall
//! back to the browser-rendered strategy.

use std::time::Duration;

use reqwest::Client;
use scraper::Html;
use tracing::debug;
use url::Url;

use docsink_shared::config::CrawlConfig;
use docsink_shared::{DocsinkError, Result};

use crate::content;
use crate::{ExtractOutcome, SiteSession};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("docsink/", env!("CARGO_PKG_VERSION"));

/// Options shared by both extraction strategies.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Body-text phrases marking a login wall.
    pub login_markers: Vec<String>,
    /// Bound on fallback whole-document content length.
    pub max_content_len: usize,
}

impl From<&CrawlConfig> for ExtractOptions {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            timeout_secs: config.timeout_secs,
            login_markers: config.login_markers.clone(),
            max_content_len: config.max_content_len,
        }
    }
}

/// Lightweight HTTP + HTML-parse page extractor.
pub struct StaticExtractor {
    client: Client,
    options: ExtractOptions,
}

impl StaticExtractor {
    /// Create a new extractor with its own HTTP client.
    pub fn new(options: ExtractOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| DocsinkError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, options })
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    /// Fetch `url` and extract title, content, image refs, and page links.
    ///
    /// Returns [`ExtractOutcome::LoginWall`] when the response exhibits a
    /// login-wall signature; the caller decides whether to retry with the
    /// browser strategy.
    pub async fn extract(
        &self,
        url: &Url,
        session: Option<&SiteSession>,
    ) -> Result<ExtractOutcome> {
        debug!(%url, "fetching page");

        let mut request = self.client.get(url.as_str());
        if let Some(cookie) = session.and_then(|s| s.cookie.as_deref()) {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: {e}")))?;

        let final_url = response.url().clone();
        let status = response.status();
        if !status.is_success() {
            return Err(DocsinkError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: body read failed: {e}")))?;

        let doc = Html::parse_document(&body);

        if content::is_login_wall(&doc, &self.options.login_markers) {
            debug!(%final_url, "login wall detected");
            return Ok(ExtractOutcome::LoginWall { final_url });
        }

        Ok(ExtractOutcome::Extracted(content::extract_document(
            &doc,
            &final_url,
            self.options.max_content_len,
        )))
    }
}
