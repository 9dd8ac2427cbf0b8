//! Page fetching and content extraction.
//!
//! Two interchangeable strategies: [`StaticExtractor`] does a cheap
//! HTTP fetch + HTML parse and is always tried first; when it detects a
//! login wall, callers fall back to the browser-rendered
//! [`BrowserExtractor`] (feature `browser`), which can submit credentials
//! and wait for client-side rendering.
//!
//! This crate has no side effects beyond outbound HTTP. It never touches
//! storage or the database.

pub mod content;
pub mod static_fetch;

#[cfg(feature = "browser")]
pub mod browser;

use url::Url;

pub use static_fetch::{ExtractOptions, StaticExtractor};

#[cfg(feature = "browser")]
pub use browser::{BrowserExtractor, BrowserOptions};

/// Credential material for a login-walled documentation site.
#[derive(Debug, Clone, Default)]
pub struct SiteSession {
    /// Session cookie sent with static fetches.
    pub cookie: Option<String>,
    /// Login email for browser-rendered extraction.
    pub email: Option<String>,
    /// Login password for browser-rendered extraction.
    pub password: Option<String>,
}

impl SiteSession {
    /// Whether the session can drive an interactive login form.
    pub fn has_login(&self) -> bool {
        self.email.is_some() && self.password.is_some()
    }
}

/// Everything extracted from one page.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Post-redirect URL, the page's identity for dedup purposes.
    pub final_url: Url,
    /// Page title.
    pub title: String,
    /// Extracted plain-text content, if any.
    pub content: Option<String>,
    /// Absolute image URLs referenced by the page.
    pub image_refs: Vec<Url>,
    /// Absolute same-host page links.
    pub page_links: Vec<Url>,
}

/// Result of a static extraction attempt.
#[derive(Debug)]
pub enum ExtractOutcome {
    /// The page was extracted normally.
    Extracted(Extraction),
    /// The response looks like a login wall; a browser-rendered
    /// extraction with credentials is required.
    LoginWall { final_url: Url },
}
