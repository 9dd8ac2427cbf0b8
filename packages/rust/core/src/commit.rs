//! Bulk commit: chunked page upserts and image-association inserts.
//!
//! Collected pages are committed only after the crawl frontier is
//! exhausted. Chunks retry with capped linear backoff; a chunk that
//! exhausts its retries is logged and excluded from the success counts,
//! never fatal to the run. Association rows are inserted only for pages
//! whose database id resolved, so they can never reference a missing page.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use docsink_shared::{PageRecord, PendingImage, Result};
use docsink_storage::{ImageRowInsert, Storage};

const PAGE_CHUNK_SIZE: usize = 50;
const IMAGE_CHUNK_SIZE: usize = 100;
const MAX_CHUNK_RETRIES: u32 = 3;
const BACKOFF_STEP_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Accounting from one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub pages_inserted: usize,
    pub pages_updated: usize,
    /// Pages lost to chunks that exhausted their retries.
    pub pages_failed: usize,
    pub associations_new: usize,
    pub associations_existing: usize,
    /// Pending images dropped: owner page unresolved or chunk exhausted.
    pub images_dropped: usize,
}

/// Commit collected pages and pending image records.
pub async fn commit(
    storage: &Storage,
    pages: Vec<PageRecord>,
    pending_images: Vec<PendingImage>,
) -> Result<CommitOutcome> {
    // Dedup pages by URL, last write wins, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut by_url: HashMap<String, PageRecord> = HashMap::new();
    for page in pages {
        if !by_url.contains_key(&page.url) {
            order.push(page.url.clone());
        }
        by_url.insert(page.url.clone(), page);
    }
    let deduped: Vec<PageRecord> = order.iter().filter_map(|url| by_url.remove(url)).collect();

    // Pre-commit existence check splits inserted vs updated afterwards.
    let urls: Vec<String> = deduped.iter().map(|p| p.url.clone()).collect();
    let existing = storage.existing_page_urls(&urls).await?;

    let mut url_to_id: HashMap<String, String> = HashMap::new();
    let mut pages_failed = 0usize;

    for chunk in deduped.chunks(PAGE_CHUNK_SIZE) {
        let mut attempt = 0u32;
        loop {
            match storage.upsert_pages_chunk(chunk).await {
                Ok(rows) => {
                    url_to_id.extend(rows);
                    break;
                }
                Err(e) if attempt < MAX_CHUNK_RETRIES => {
                    attempt += 1;
                    let delay = (BACKOFF_STEP_MS * u64::from(attempt)).min(BACKOFF_CAP_MS);
                    warn!(attempt, error = %e, "page chunk upsert failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        pages = chunk.len(),
                        "page chunk failed after retries, skipping"
                    );
                    pages_failed += chunk.len();
                    break;
                }
            }
        }
    }

    let pages_inserted = url_to_id
        .keys()
        .filter(|url| !existing.contains(*url))
        .count();
    let pages_updated = url_to_id.len() - pages_inserted;

    // Resolve owner URLs to page ids; unresolved records are the expected
    // residue of failed chunks and are dropped.
    let mut rows: Vec<ImageRowInsert> = Vec::new();
    let mut images_dropped = 0usize;
    for image in pending_images {
        match url_to_id.get(&image.page_url) {
            Some(page_id) => rows.push(ImageRowInsert {
                page_id: page_id.clone(),
                original_url: image.original_url,
                storage_path: image.storage_path,
            }),
            None => {
                images_dropped += 1;
            }
        }
    }

    let mut associations_new = 0usize;
    let mut associations_existing = 0usize;

    for chunk in rows.chunks(IMAGE_CHUNK_SIZE) {
        let mut attempt = 0u32;
        loop {
            match storage.insert_images_chunk(chunk).await {
                Ok(inserted) => {
                    associations_new += inserted as usize;
                    associations_existing += chunk.len() - inserted as usize;
                    break;
                }
                Err(e) if attempt < MAX_CHUNK_RETRIES => {
                    attempt += 1;
                    let delay = (BACKOFF_STEP_MS * u64::from(attempt)).min(BACKOFF_CAP_MS);
                    warn!(attempt, error = %e, "image chunk insert failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        images = chunk.len(),
                        "image chunk failed after retries, skipping"
                    );
                    images_dropped += chunk.len();
                    break;
                }
            }
        }
    }

    let outcome = CommitOutcome {
        pages_inserted,
        pages_updated,
        pages_failed,
        associations_new,
        associations_existing,
        images_dropped,
    };

    info!(
        pages_inserted = outcome.pages_inserted,
        pages_updated = outcome.pages_updated,
        pages_failed = outcome.pages_failed,
        associations_new = outcome.associations_new,
        associations_existing = outcome.associations_existing,
        "bulk commit complete"
    );

    Ok(outcome)
}
