//! End-to-end crawl run: seed the uploaded-set, drain the frontier, then
//! bulk-commit everything the run collected.

use tracing::{info, instrument};

use docsink_crawler::{CrawlMode, CrawlObserver, Crawler};
use docsink_extract::{ExtractOptions, SiteSession, StaticExtractor};
use docsink_images::{ImagePipeline, ObjectStore};
use docsink_shared::{AppConfig, CancelFlag, CrawlSummary, ProgressTracker, Result};
use docsink_storage::Storage;

#[cfg(feature = "browser")]
use docsink_extract::{BrowserExtractor, BrowserOptions};

use crate::commit;

/// One crawl invocation.
#[derive(Debug)]
pub struct RunRequest {
    pub mode: CrawlMode,
    /// Credential for login-walled content.
    pub session: Option<SiteSession>,
    /// Attach the browser-rendered fallback strategy.
    pub use_browser: bool,
}

/// Run a crawl start-to-finish and return the completion report.
///
/// Pages become visible to readers only through the final commit; a
/// cancelled run commits nothing. Per-unit failures are embedded in the
/// summary of an otherwise successful run.
#[instrument(skip_all)]
pub async fn run_crawl(
    storage: &Storage,
    store: &dyn ObjectStore,
    config: &AppConfig,
    request: RunRequest,
    observer: &dyn CrawlObserver,
    cancel: &CancelFlag,
) -> Result<CrawlSummary> {
    // The uploaded-set is owned by this run, seeded once from storage.
    let uploaded = storage.uploaded_image_urls().await?;
    info!(known_images = uploaded.len(), "seeded uploaded-set");

    let fetcher = StaticExtractor::new(ExtractOptions::from(&config.crawl))?;
    let mut pipeline = ImagePipeline::new(
        &config.images,
        store,
        config.object_store.bucket.clone(),
        uploaded,
        cancel.clone(),
    )?;
    let mut progress = ProgressTracker::new();

    let crawler = Crawler::new(&config.crawl, &fetcher);
    let crawler = match &request.session {
        Some(session) => crawler.with_session(session),
        None => crawler,
    };

    #[cfg(feature = "browser")]
    let browser = if request.use_browser {
        Some(BrowserExtractor::new(BrowserOptions::default()))
    } else {
        None
    };
    #[cfg(feature = "browser")]
    let crawler = match &browser {
        Some(browser) => crawler.with_browser(browser),
        None => crawler,
    };

    let output = crawler
        .run(request.mode, &mut pipeline, &mut progress, observer, cancel)
        .await?;

    let stats = pipeline.stats().clone();
    let pending = pipeline.take_pending();

    let committed = commit::commit(storage, output.pages, pending).await?;

    let summary = CrawlSummary {
        pages_inserted: committed.pages_inserted,
        pages_updated: committed.pages_updated,
        pages_failed: output.pages_failed + committed.pages_failed,
        images_total: stats.total,
        images_unique: stats.unique,
        images_uploaded: stats.uploaded,
        images_skipped: stats.skipped,
        images_failed: stats.failed,
        associations_new: committed.associations_new,
        associations_existing: committed.associations_existing,
        links_discovered: output.links_discovered,
    };

    info!(
        pages_inserted = summary.pages_inserted,
        pages_updated = summary.pages_updated,
        pages_failed = summary.pages_failed,
        images_uploaded = summary.images_uploaded,
        "crawl run complete"
    );

    Ok(summary)
}
