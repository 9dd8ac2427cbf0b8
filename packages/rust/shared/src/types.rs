//! Core domain types for the scrape-and-ingest pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pages and images
// ---------------------------------------------------------------------------

/// A scraped page, keyed by its normalized absolute URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Normalized absolute URL, the upsert key.
    pub url: String,
    /// Page title (extracted, or derived from the URL).
    pub title: String,
    /// Extracted plain-text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// When the page was scraped.
    pub scraped_at: DateTime<Utc>,
}

/// An uploaded image waiting for its page-association row.
///
/// The owning page's database id is not known until Bulk Commit resolves
/// it, so the pipeline records the page by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingImage {
    /// URL of the page the image was found on.
    pub page_url: String,
    /// Normalized original image URL, the dedup key.
    pub original_url: String,
    /// Object-storage key the image was uploaded under.
    pub storage_path: String,
}

// ---------------------------------------------------------------------------
// Crawl summary
// ---------------------------------------------------------------------------

/// User-facing completion report for one crawl run.
///
/// Partial failures live here as counts; they do not fail the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub pages_inserted: usize,
    pub pages_updated: usize,
    pub pages_failed: usize,
    /// Total image references seen (including repeats).
    pub images_total: usize,
    /// Distinct normalized image URLs seen.
    pub images_unique: usize,
    pub images_uploaded: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
    /// Association rows newly inserted by this run.
    pub associations_new: usize,
    /// Associations that already existed.
    pub associations_existing: usize,
    /// In-scope links seen but not followed (bounded mode only).
    pub links_discovered: usize,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle status of a job. Transitions are one-directional:
/// `Queued → Running → {Completed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Stable string form used in the database and over the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    /// Operation identifier (e.g. `crawl`).
    pub name: String,
    pub status: JobStatus,
    /// Opaque invocation arguments.
    pub args: Option<serde_json::Value>,
    /// Opaque result payload, set on completion.
    pub result: Option<serde_json::Value>,
    /// Append-only, newline-joined log text.
    pub logs: String,
    pub error: Option<String>,
    /// Raised by `cancel` on a running job; observed cooperatively.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAction {
    /// The job was still queued; it went straight to `cancelled`.
    CancelledImmediately,
    /// The job was running; the flag was set for the worker to observe.
    CancellationRequested,
}

/// Outcome of a cancel request on a non-terminal job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub action: CancelAction,
    pub previous_status: JobStatus,
}
