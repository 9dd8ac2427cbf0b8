//! Sequential crawl engine: frontier, scope checks, and the page loop.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use docsink_extract::{ExtractOutcome, Extraction, SiteSession, StaticExtractor};
use docsink_images::ImagePipeline;
use docsink_shared::config::CrawlConfig;
use docsink_shared::{CancelFlag, DocsinkError, PageRecord, ProgressTracker, Result};

#[cfg(feature = "browser")]
use docsink_extract::BrowserExtractor;

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// What to crawl.
#[derive(Debug, Clone)]
pub enum CrawlMode {
    /// Discovery: start from one seed and follow in-scope links until the
    /// frontier empties.
    Seeded { root: Url },
    /// Bounded: crawl exactly these URLs, in order. Link discovery is
    /// suppressed entirely; this mode is for targeted re-scrapes.
    Bounded { urls: Vec<Url> },
}

/// Callbacks for run observation (progress bars, job logs).
pub trait CrawlObserver: Send + Sync {
    fn page_started(&self, _url: &str, _current: usize, _total: usize) {}
    fn page_failed(&self, _url: &str, _error: &str) {}
    fn note(&self, _line: &str) {}
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl CrawlObserver for SilentObserver {}

/// What a crawl produced. Pending image records stay in the pipeline
/// until the caller drains them for Bulk Commit.
#[derive(Debug)]
pub struct CrawlOutput {
    /// Pages collected for commit, in crawl order.
    pub pages: Vec<PageRecord>,
    /// Pages whose fetch/extract failed.
    pub pages_failed: usize,
    /// In-scope links seen but not followed (bounded mode).
    pub links_discovered: usize,
}

/// Sequential, scope-aware crawler.
pub struct Crawler<'a> {
    config: &'a CrawlConfig,
    fetcher: &'a StaticExtractor,
    session: Option<&'a SiteSession>,
    #[cfg(feature = "browser")]
    browser: Option<&'a BrowserExtractor>,
}

impl<'a> Crawler<'a> {
    pub fn new(config: &'a CrawlConfig, fetcher: &'a StaticExtractor) -> Self {
        Self {
            config,
            fetcher,
            session: None,
            #[cfg(feature = "browser")]
            browser: None,
        }
    }

    /// Attach a site credential for login-walled content.
    pub fn with_session(mut self, session: &'a SiteSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach the browser-rendered fallback strategy.
    #[cfg(feature = "browser")]
    pub fn with_browser(mut self, browser: &'a BrowserExtractor) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Drain the frontier.
    ///
    /// A single page failure is logged and counted, never fatal. The only
    /// errors that abort the run are cancellation and progress-invariant
    /// violations.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mode: CrawlMode,
        pipeline: &mut ImagePipeline<'_>,
        progress: &mut ProgressTracker,
        observer: &dyn CrawlObserver,
        cancel: &CancelFlag,
    ) -> Result<CrawlOutput> {
        let (mut pending, bound, scope_root): (VecDeque<Url>, Option<usize>, Url) = match mode {
            CrawlMode::Seeded { root } => (VecDeque::from([root.clone()]), None, root),
            CrawlMode::Bounded { urls } => {
                let root = urls.first().cloned().ok_or_else(|| {
                    DocsinkError::validation("bounded crawl requires at least one URL")
                })?;
                let count = urls.len();
                (urls.into(), Some(count), root)
            }
        };

        let scope = CrawlScope::new(&scope_root, self.config);
        let mut visited: HashSet<String> = HashSet::new();
        let mut enqueued: HashSet<String> =
            pending.iter().map(normalize_url).collect();

        progress.add_total(pending.len());

        let mut pages: Vec<PageRecord> = Vec::new();
        let mut pages_failed = 0usize;
        let mut links_discovered = 0usize;
        let mut attempts = 0usize;
        let mut first_fetch = true;

        info!(
            mode = if bound.is_some() { "bounded" } else { "discovery" },
            seeds = pending.len(),
            "starting crawl"
        );

        while let Some(url) = pending.pop_front() {
            if let Some(bound) = bound {
                if attempts >= bound {
                    break;
                }
            }
            cancel.check()?;
            attempts += 1;

            let key = normalize_url(&url);
            if visited.contains(&key) {
                debug!(%url, "already visited, skipping");
                progress.advance()?;
                progress.page_done();
                continue;
            }

            observer.page_started(url.as_str(), progress.current() + 1, progress.total());

            if self.config.rate_limit_ms > 0 && !first_fetch {
                tokio::time::sleep(Duration::from_millis(self.config.rate_limit_ms)).await;
            }
            first_fetch = false;

            let extraction = match self.extract_page(&url).await {
                Ok(extraction) => extraction,
                Err(DocsinkError::Cancelled) => return Err(DocsinkError::Cancelled),
                Err(e) => {
                    warn!(%url, error = %e, "page failed, continuing");
                    observer.page_failed(url.as_str(), &e.to_string());
                    pages_failed += 1;
                    progress.advance()?;
                    progress.page_done();
                    continue;
                }
            };

            visited.insert(key.clone());

            // A redirect changes the unit's identity to the final URL.
            let final_key = normalize_url(&extraction.final_url);
            if final_key != key {
                if visited.contains(&final_key) {
                    debug!(%url, final = %final_key, "redirect target already visited");
                    progress.advance()?;
                    progress.page_done();
                    continue;
                }
                visited.insert(final_key.clone());
            }

            progress.advance()?;
            progress.page_done();

            pages.push(PageRecord {
                url: final_key.clone(),
                title: extraction.title.clone(),
                content: extraction.content.clone(),
                scraped_at: Utc::now(),
            });

            // Images are units of work too: grow the estimate, then
            // process each through the pipeline.
            progress.add_total(extraction.image_refs.len());
            for image_url in &extraction.image_refs {
                pipeline.process(image_url, &final_key).await?;
                progress.advance()?;
                progress.image_done();
            }

            // Frontier expansion.
            let in_scope: Vec<&Url> = extraction
                .page_links
                .iter()
                .filter(|link| scope.in_scope(link))
                .collect();

            if bound.is_some() {
                links_discovered += in_scope.len();
            } else {
                let mut added = 0usize;
                for link in in_scope {
                    let link_key = normalize_url(link);
                    if !visited.contains(&link_key) && enqueued.insert(link_key) {
                        pending.push_back((*link).clone());
                        added += 1;
                    }
                }
                progress.add_total(added);
            }

            observer.note(&format!(
                "{progress} scraped {final_key} ({} images so far)",
                progress.images_processed()
            ));
        }

        info!(
            pages = pages.len(),
            failed = pages_failed,
            links_discovered,
            "crawl complete"
        );

        Ok(CrawlOutput {
            pages,
            pages_failed,
            links_discovered,
        })
    }

    /// Static extraction with browser fallback on a login wall.
    async fn extract_page(&self, url: &Url) -> Result<Extraction> {
        match self.fetcher.extract(url, self.session).await? {
            ExtractOutcome::Extracted(extraction) => Ok(extraction),
            ExtractOutcome::LoginWall { final_url } => {
                #[cfg(feature = "browser")]
                if let Some(browser) = self.browser {
                    if self.session.map(SiteSession::has_login).unwrap_or(false) {
                        debug!(%final_url, "login wall, retrying with browser");
                        return browser
                            .extract(&final_url, self.session, self.fetcher.options())
                            .await;
                    }
                }
                Err(DocsinkError::Network(format!(
                    "{final_url}: login wall and no usable site credential"
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scope checking
// ---------------------------------------------------------------------------

/// Determines which URLs are in scope for a crawl.
struct CrawlScope {
    base_host: String,
    base_path: String,
    include_patterns: Vec<regex::Regex>,
    exclude_patterns: Vec<regex::Regex>,
}

impl CrawlScope {
    fn new(root: &Url, config: &CrawlConfig) -> Self {
        Self {
            base_host: root.host_str().unwrap_or("").to_string(),
            base_path: root.path().to_string(),
            include_patterns: config
                .include_patterns
                .iter()
                .filter_map(|p| glob_to_regex(p))
                .collect(),
            exclude_patterns: config
                .exclude_patterns
                .iter()
                .filter_map(|p| glob_to_regex(p))
                .collect(),
        }
    }

    fn in_scope(&self, url: &Url) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }
        if url.host_str().unwrap_or("") != self.base_host {
            return false;
        }

        let path = url.path();

        for pattern in &self.exclude_patterns {
            if pattern.is_match(path) {
                return false;
            }
        }

        if !self.include_patterns.is_empty() {
            return self.include_patterns.iter().any(|p| p.is_match(path));
        }

        path.starts_with(&self.base_path)
            || self.base_path.starts_with(path)
            || path.starts_with('/')
    }
}

/// Convert a glob-like pattern to a regex.
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}

/// Normalize a URL for visited-set identity (strip fragment, drop a
/// trailing slash except at the root).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}
