//! Job runner: claim queued work, execute it cooperatively, and apply
//! exactly one terminal transition.
//!
//! Cancellation is cooperative end to end. A watcher task polls the
//! job's `cancel_requested` flag into an in-process [`CancelFlag`] (and
//! flushes buffered log lines while it is at it); the crawl observes the
//! flag around every network call; and the store's terminal transition
//! lets a raised flag win over a late success.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use url::Url;

use docsink_crawler::{CrawlMode, CrawlObserver};
use docsink_extract::SiteSession;
use docsink_images::ObjectStore;
use docsink_shared::config::SiteConfig;
use docsink_shared::{AppConfig, CancelFlag, CrawlSummary, DocsinkError, JobRow, Result};
use docsink_storage::{JobOutcome, Storage};

use crate::pipeline::{self, RunRequest};

/// Operation identifier for crawl jobs.
pub const CRAWL_JOB: &str = "crawl";

/// Arguments carried by a crawl job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJobArgs {
    /// Root URL: the seed in discovery mode, the scope anchor otherwise.
    pub root_url: String,
    /// Explicit page list for bounded mode (targeted re-scrapes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_urls: Option<Vec<String>>,
}

/// Enqueue a crawl job.
pub async fn queue_crawl(storage: &Storage, args: &CrawlJobArgs) -> Result<String> {
    let value = serde_json::to_value(args)
        .map_err(|e| DocsinkError::validation(format!("bad crawl args: {e}")))?;
    storage.create_job(CRAWL_JOB, Some(&value)).await
}

/// Build a [`SiteSession`] from the configured environment variables.
pub fn session_from_env(site: &SiteConfig) -> Option<SiteSession> {
    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let cookie = read(&site.cookie_env);
    let email = read(&site.login_email_env);
    let password = read(&site.login_password_env);

    if cookie.is_none() && (email.is_none() || password.is_none()) {
        return None;
    }
    Some(SiteSession {
        cookie,
        email,
        password,
    })
}

/// Claims and executes queued jobs against one storage + object store.
#[derive(Clone)]
pub struct Runner {
    storage: Arc<Storage>,
    store: Arc<dyn ObjectStore>,
    config: AppConfig,
}

impl Runner {
    pub fn new(storage: Arc<Storage>, store: Arc<dyn ObjectStore>, config: AppConfig) -> Self {
        Self {
            storage,
            store,
            config,
        }
    }

    /// Claim and execute the next queued job.
    ///
    /// Returns the finished job row, or `None` when the queue is empty.
    #[instrument(skip_all)]
    pub async fn run_next(&self) -> Result<Option<JobRow>> {
        let Some(job) = self.storage.claim_next_job().await? else {
            return Ok(None);
        };
        info!(job_id = %job.id, name = %job.name, "claimed job");

        let cancel = CancelFlag::new();
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let observer = JobObserver {
            lines: lines.clone(),
        };

        let watcher = tokio::spawn(watch_job(
            self.storage.clone(),
            job.id.clone(),
            cancel.clone(),
            lines.clone(),
            self.config.jobs.cancel_poll_ms,
        ));

        let result = self.execute(&job, &observer, &cancel).await;

        watcher.abort();
        let _ = watcher.await;
        flush_logs(&self.storage, &job.id, &lines).await;

        // The stored flag is authoritative even if the watcher never got
        // a final poll in.
        let flag_in_store = self
            .storage
            .cancel_requested(&job.id)
            .await
            .unwrap_or(false);

        let outcome = match result {
            Ok(_) if cancel.is_raised() || flag_in_store => JobOutcome::Cancelled,
            Ok(summary) => {
                let value = serde_json::to_value(&summary).map_err(|e| {
                    DocsinkError::validation(format!("unencodable summary: {e}"))
                })?;
                JobOutcome::Completed(value)
            }
            Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job failed");
                JobOutcome::Failed(e.to_string())
            }
        };

        self.storage.finish_job(&job.id, outcome).await?;
        self.storage.get_job(&job.id).await
    }

    /// Poll for queued jobs until the process is stopped.
    pub async fn run_worker(&self, poll_interval: Duration) -> Result<()> {
        loop {
            match self.run_next().await? {
                Some(job) => {
                    info!(job_id = %job.id, status = %job.status, "job finished");
                }
                None => tokio::time::sleep(poll_interval).await,
            }
        }
    }

    /// Dispatch the job body by name.
    async fn execute(
        &self,
        job: &JobRow,
        observer: &dyn CrawlObserver,
        cancel: &CancelFlag,
    ) -> Result<CrawlSummary> {
        match job.name.as_str() {
            CRAWL_JOB => {
                let args: CrawlJobArgs = job
                    .args
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| DocsinkError::validation(format!("bad crawl args: {e}")))?
                    .ok_or_else(|| DocsinkError::validation("crawl job has no args"))?;

                let request = build_request(&self.config, &args)?;
                pipeline::run_crawl(
                    &self.storage,
                    self.store.as_ref(),
                    &self.config,
                    request,
                    observer,
                    cancel,
                )
                .await
            }
            other => Err(DocsinkError::validation(format!(
                "unknown job name: {other}"
            ))),
        }
    }
}

/// Turn job args into a run request.
fn build_request(config: &AppConfig, args: &CrawlJobArgs) -> Result<RunRequest> {
    let mode = match &args.page_urls {
        Some(urls) if !urls.is_empty() => {
            let parsed: Result<Vec<Url>> = urls
                .iter()
                .map(|u| {
                    Url::parse(u)
                        .map_err(|e| DocsinkError::validation(format!("invalid page URL {u}: {e}")))
                })
                .collect();
            CrawlMode::Bounded { urls: parsed? }
        }
        _ => CrawlMode::Seeded {
            root: Url::parse(&args.root_url)
                .map_err(|e| DocsinkError::validation(format!("invalid root URL: {e}")))?,
        },
    };

    Ok(RunRequest {
        mode,
        session: session_from_env(&config.site),
        use_browser: true,
    })
}

/// Buffers crawl log lines for the watcher to flush into the job row.
struct JobObserver {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CrawlObserver for JobObserver {
    fn page_failed(&self, url: &str, error: &str) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push(format!("failed {url}: {error}"));
        }
    }

    fn note(&self, line: &str) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push(line.to_string());
        }
    }
}

/// Watcher task: flush buffered log lines and mirror the stored
/// cancellation flag into the in-process one.
async fn watch_job(
    storage: Arc<Storage>,
    job_id: String,
    cancel: CancelFlag,
    lines: Arc<Mutex<Vec<String>>>,
    poll_ms: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(poll_ms.max(50)));
    loop {
        interval.tick().await;
        flush_logs(&storage, &job_id, &lines).await;
        match storage.cancel_requested(&job_id).await {
            Ok(true) => {
                info!(%job_id, "cancellation requested, raising flag");
                cancel.raise();
            }
            Ok(false) => {}
            Err(e) => warn!(%job_id, error = %e, "cancel poll failed"),
        }
    }
}

/// Drain buffered lines into the job's append-only log.
async fn flush_logs(storage: &Storage, job_id: &str, lines: &Arc<Mutex<Vec<String>>>) {
    let drained: Vec<String> = match lines.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
    };
    for line in drained {
        if let Err(e) = storage.append_job_log(job_id, &line).await {
            warn!(%job_id, error = %e, "log append failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsink_images::MemoryStore;
    use docsink_shared::JobStatus;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_runner() -> (Runner, Arc<Storage>) {
        let tmp = std::env::temp_dir().join(format!("docsink_runner_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));

        let mut config = AppConfig::default();
        config.crawl.rate_limit_ms = 0;
        config.jobs.cancel_poll_ms = 50;
        config.object_store.bucket = "imgs".into();
        config.images.strip_query_suffixes.push("127.0.0.1".into());

        let runner = Runner::new(storage.clone(), Arc::new(MemoryStore::new()), config);
        (runner, storage)
    }

    async fn mount_page(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn empty_queue_yields_none() {
        let (runner, _storage) = test_runner().await;
        assert!(runner.run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bounded_crawl_job_reports_partial_failure_as_completed() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "/ok",
            "<html><body><main><h1>Ok Page</h1><p>Fine.</p></main></body></html>",
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (runner, storage) = test_runner().await;
        let args = CrawlJobArgs {
            root_url: format!("{}/ok", server.uri()),
            page_urls: Some(vec![
                format!("{}/ok", server.uri()),
                format!("{}/missing", server.uri()),
            ]),
        };
        let id = queue_crawl(&storage, &args).await.unwrap();

        let job = runner.run_next().await.unwrap().expect("job ran");
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Completed, "partial failure still completes");

        let summary: CrawlSummary = serde_json::from_value(job.result.unwrap()).unwrap();
        assert_eq!(summary.pages_inserted, 1);
        assert_eq!(summary.pages_failed, 1);

        // The failed URL never reached the page table.
        let ok_url = format!("{}/ok", server.uri());
        let missing_url = format!("{}/missing", server.uri());
        assert!(storage.get_page(&ok_url).await.unwrap().is_some());
        assert!(storage.get_page(&missing_url).await.unwrap().is_none());
        assert!(!job.logs.is_empty(), "progress lines were appended");
    }

    #[tokio::test]
    async fn rescraping_the_same_url_stays_one_row() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "/page",
            "<html><body><main><h1>Page</h1></main></body></html>",
        )
        .await;

        let (runner, storage) = test_runner().await;
        let args = CrawlJobArgs {
            root_url: format!("{}/page", server.uri()),
            page_urls: Some(vec![format!("{}/page", server.uri())]),
        };

        queue_crawl(&storage, &args).await.unwrap();
        let first = runner.run_next().await.unwrap().unwrap();
        let first_summary: CrawlSummary = serde_json::from_value(first.result.unwrap()).unwrap();
        assert_eq!(first_summary.pages_inserted, 1);

        queue_crawl(&storage, &args).await.unwrap();
        let second = runner.run_next().await.unwrap().unwrap();
        let second_summary: CrawlSummary = serde_json::from_value(second.result.unwrap()).unwrap();
        assert_eq!(second_summary.pages_updated, 1);
        assert_eq!(second_summary.pages_inserted, 0);

        assert_eq!(storage.count_pages().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_queued_job_is_never_claimed() {
        let (runner, storage) = test_runner().await;
        let args = CrawlJobArgs {
            root_url: "https://docs.example.com".into(),
            page_urls: None,
        };
        let id = queue_crawl(&storage, &args).await.unwrap();
        storage.cancel_job(&id).await.unwrap();

        assert!(runner.run_next().await.unwrap().is_none());
        let job = storage.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn cancel_during_run_ends_as_cancelled() {
        let server = MockServer::start().await;
        // Slow pages keep the job running long enough to cancel it.
        for route in ["/a", "/b", "/c"] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(
                            "<html><body><main><h1>Slow</h1></main></body></html>",
                        )
                        .set_delay(Duration::from_millis(400)),
                )
                .mount(&server)
                .await;
        }

        let (runner, storage) = test_runner().await;
        let args = CrawlJobArgs {
            root_url: format!("{}/a", server.uri()),
            page_urls: Some(vec![
                format!("{}/a", server.uri()),
                format!("{}/b", server.uri()),
                format!("{}/c", server.uri()),
            ]),
        };
        let id = queue_crawl(&storage, &args).await.unwrap();

        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run_next().await }
        });

        // Let the worker claim and start the first slow fetch.
        tokio::time::sleep(Duration::from_millis(200)).await;
        storage.cancel_job(&id).await.unwrap();

        let finished = task.await.unwrap().unwrap().expect("job row");
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert!(finished.result.is_none());

        // The cancelled run committed nothing.
        assert_eq!(storage.count_pages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_job_name_fails_the_job() {
        let (runner, storage) = test_runner().await;
        storage.create_job("reticulate", None).await.unwrap();

        let job = runner.run_next().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("unknown job name"));
    }
}
