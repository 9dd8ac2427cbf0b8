//! Browser-rendered extraction strategy (feature `browser`).
//!
//! Used when the static path hits a login wall: drives headless Chrome
//! over CDP, submits credentials into the login form, waits for
//! client-side rendering, and runs the same DOM extraction on the
//! rendered HTML.

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use docsink_shared::{DocsinkError, Result};

use crate::content;
use crate::static_fetch::ExtractOptions;
use crate::{Extraction, SiteSession};

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Settle time after navigation for late-loading scripts.
const RENDER_SETTLE_MS: u64 = 500;

/// Browser strategy configuration.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Run headless (default). Set false for debugging.
    pub headless: bool,
    /// Page-load timeout.
    pub timeout_secs: u64,
    /// Explicit Chrome executable, overriding discovery.
    pub chrome_path: Option<PathBuf>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            timeout_secs: 30,
            chrome_path: None,
        }
    }
}

/// Full browser-rendered page extractor.
pub struct BrowserExtractor {
    options: BrowserOptions,
}

impl BrowserExtractor {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }

    /// Render `url`, logging in with the session credentials when a login
    /// form is present, then extract from the rendered DOM.
    pub async fn extract(
        &self,
        url: &Url,
        session: Option<&SiteSession>,
        extract_options: &ExtractOptions,
    ) -> Result<Extraction> {
        let chrome = self.find_chrome()?;
        info!(chrome = %chrome.display(), headless = self.options.headless, "launching browser");

        let mut builder = BrowserConfig::builder().chrome_executable(chrome);
        if !self.options.headless {
            builder = builder.with_head();
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-gpu");

        let config = builder
            .build()
            .map_err(|e| DocsinkError::Network(format!("failed to build browser config: {e}")))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DocsinkError::Network(format!("failed to launch browser: {e}")))?;

        // Drive the CDP event loop until the browser goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = self.drive(&browser, url, session, extract_options).await;

        let _ = browser.close().await;
        let _ = browser.wait().await;
        handler_task.abort();

        result
    }

    async fn drive(
        &self,
        browser: &Browser,
        url: &Url,
        session: Option<&SiteSession>,
        extract_options: &ExtractOptions,
    ) -> Result<Extraction> {
        let page = browser
            .new_page(url.as_str())
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: {e}")))?;

        let nav_timeout = Duration::from_secs(self.options.timeout_secs);
        if tokio::time::timeout(nav_timeout, page.wait_for_navigation())
            .await
            .is_err()
        {
            warn!(%url, "timeout waiting for navigation");
        }
        tokio::time::sleep(Duration::from_millis(RENDER_SETTLE_MS)).await;

        if let Some(session) = session {
            if session.has_login() {
                self.try_login(&page, session).await?;
            }
        }

        let final_url = page
            .url()
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: {e}")))?
            .map(|u| u.to_string())
            .and_then(|u| Url::parse(&u).ok())
            .unwrap_or_else(|| url.clone());

        let html = page
            .content()
            .await
            .map_err(|e| DocsinkError::Network(format!("{url}: content: {e}")))?;

        let _ = page.close().await;

        let doc = Html::parse_document(&html);
        Ok(content::extract_document(
            &doc,
            &final_url,
            extract_options.max_content_len,
        ))
    }

    /// Fill and submit the login form if one is rendered.
    async fn try_login(&self, page: &Page, session: &SiteSession) -> Result<()> {
        let Ok(password_field) = page.find_element(r#"input[type="password"]"#).await else {
            debug!("no login form rendered, continuing");
            return Ok(());
        };

        let email = session.email.as_deref().unwrap_or_default();
        let password = session.password.as_deref().unwrap_or_default();
        info!("login form detected, submitting credentials");

        if let Ok(email_field) = page
            .find_element(r#"input[type="email"], input[name*="email"], input[type="text"]"#)
            .await
        {
            email_field
                .click()
                .await
                .map_err(|e| DocsinkError::Network(format!("login form: {e}")))?;
            email_field
                .type_str(email)
                .await
                .map_err(|e| DocsinkError::Network(format!("login form: {e}")))?;
        }

        password_field
            .click()
            .await
            .map_err(|e| DocsinkError::Network(format!("login form: {e}")))?;
        password_field
            .type_str(password)
            .await
            .map_err(|e| DocsinkError::Network(format!("login form: {e}")))?;
        password_field
            .press_key("Enter")
            .await
            .map_err(|e| DocsinkError::Network(format!("login submit: {e}")))?;

        let nav_timeout = Duration::from_secs(self.options.timeout_secs);
        if tokio::time::timeout(nav_timeout, page.wait_for_navigation())
            .await
            .is_err()
        {
            warn!("timeout waiting for post-login navigation");
        }
        tokio::time::sleep(Duration::from_millis(RENDER_SETTLE_MS)).await;

        Ok(())
    }

    /// Locate a Chrome/Chromium executable.
    fn find_chrome(&self) -> Result<PathBuf> {
        if let Some(path) = &self.options.chrome_path {
            if path.exists() {
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "configured chrome path does not exist");
        }

        for path in CHROME_PATHS {
            let candidate = std::path::Path::new(path);
            if candidate.exists() {
                return Ok(candidate.to_path_buf());
            }
        }

        for cmd in &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        return Ok(PathBuf::from(path));
                    }
                }
            }
        }

        Err(DocsinkError::config(
            "Chrome/Chromium not found; install it or set crawl to static-only sites",
        ))
    }
}
