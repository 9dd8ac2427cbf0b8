//! Crawl-frontier management.
//!
//! The crawler owns the worklist: it decides what to fetch next, when
//! crawling is complete, and feeds extracted pages and image references
//! to the rest of the pipeline. Fetches are sequential, a deliberate
//! politeness/simplicity trade-off.

mod engine;

pub use engine::{CrawlMode, CrawlObserver, CrawlOutput, Crawler, SilentObserver, normalize_url};
