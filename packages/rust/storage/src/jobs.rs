//! Durable job store: queue, claim, log-append, finish, and cancel.
//!
//! The database arbitrates every race. Claiming uses a conditional
//! update whose affected-row count decides the winner, so two workers
//! can never both run the same job; the cancellation flag is honored by
//! the terminal transition itself, so a result arriving after a cancel
//! request still lands as `cancelled`.

use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use docsink_shared::{
    CancelAction, CancelOutcome, DocsinkError, JobRow, JobStatus, Result,
};

use crate::{Storage, parse_timestamp};

/// How many times a lost claim or cancel race is retried before giving up.
const RACE_RETRIES: u32 = 5;

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Enqueue a job. Returns the generated id (time-ordered uuid v7).
    pub async fn create_job(
        &self,
        name: &str,
        args: Option<&serde_json::Value>,
    ) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let args_json = args.map(|v| v.to_string());

        self.conn
            .execute(
                "INSERT INTO jobs (id, name, status, args_json, created_at)
                 VALUES (?1, ?2, 'queued', ?3, ?4)",
                params![id.as_str(), name, args_json.as_deref(), now.as_str()],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Atomically claim the oldest queued job, transitioning it to
    /// `running` and stamping `started_at`.
    ///
    /// The conditional update is the arbiter: if another worker wins the
    /// row between select and update, the update affects zero rows and
    /// the select is retried.
    pub async fn claim_next_job(&self) -> Result<Option<JobRow>> {
        for _ in 0..RACE_RETRIES {
            let mut rows = self
                .conn
                .query(
                    "SELECT id FROM jobs WHERE status = 'queued'
                     ORDER BY created_at ASC, id ASC LIMIT 1",
                    params![],
                )
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?;

            let Some(row) = rows
                .next()
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?
            else {
                return Ok(None);
            };
            let id: String = row
                .get(0)
                .map_err(|e| DocsinkError::Storage(e.to_string()))?;

            let now = Utc::now().to_rfc3339();
            let affected = self
                .conn
                .execute(
                    "UPDATE jobs SET status = 'running', started_at = ?1
                     WHERE id = ?2 AND status = 'queued'",
                    params![now.as_str(), id.as_str()],
                )
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?;

            if affected == 1 {
                return self.get_job(&id).await;
            }
            // Lost the race for this row; select again.
        }
        Ok(None)
    }

    /// Append one line to a job's log (newline-joined, append-only).
    pub async fn append_job_log(&self, id: &str, line: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET logs = CASE WHEN logs = '' THEN ?1
                 ELSE logs || char(10) || ?1 END
                 WHERE id = ?2",
                params![line, id],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Apply exactly one terminal transition, stamping `finished_at`.
    ///
    /// A raised cancellation flag overrides a completed/failed outcome:
    /// the worker's late result loses to the cancel request. Finishing an
    /// already-terminal job is a silent no-op so at-least-once completion
    /// signaling from a retried worker is safe.
    pub async fn finish_job(&self, id: &str, outcome: JobOutcome) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = match outcome {
            JobOutcome::Completed(result) => {
                let result_json = result.to_string();
                self.conn
                    .execute(
                        "UPDATE jobs SET
                           status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'completed' END,
                           result_json = CASE WHEN cancel_requested = 1 THEN NULL ELSE ?1 END,
                           finished_at = ?2
                         WHERE id = ?3 AND status IN ('queued', 'running')",
                        params![result_json.as_str(), now.as_str(), id],
                    )
                    .await
            }
            JobOutcome::Failed(error) => {
                self.conn
                    .execute(
                        "UPDATE jobs SET
                           status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'failed' END,
                           error = CASE WHEN cancel_requested = 1 THEN NULL ELSE ?1 END,
                           finished_at = ?2
                         WHERE id = ?3 AND status IN ('queued', 'running')",
                        params![error.as_str(), now.as_str(), id],
                    )
                    .await
            }
            JobOutcome::Cancelled => {
                self.conn
                    .execute(
                        "UPDATE jobs SET status = 'cancelled', finished_at = ?1
                         WHERE id = ?2 AND status IN ('queued', 'running')",
                        params![now.as_str(), id],
                    )
                    .await
            }
        };
        result.map_err(|e| DocsinkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Request cancellation.
    ///
    /// Queued jobs go straight to `cancelled` (terminal, no run ever
    /// happened). Running jobs get the flag set for the worker to
    /// observe; nothing is forcibly killed. Terminal jobs reject the
    /// request with their current status.
    pub async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        for _ in 0..RACE_RETRIES {
            let job = self
                .get_job(id)
                .await?
                .ok_or_else(|| DocsinkError::Storage(format!("job {id} not found")))?;

            if job.status.is_terminal() {
                return Err(DocsinkError::JobFinished {
                    status: job.status.to_string(),
                });
            }

            let affected = match job.status {
                JobStatus::Queued => {
                    let now = Utc::now().to_rfc3339();
                    self.conn
                        .execute(
                            "UPDATE jobs SET status = 'cancelled', cancel_requested = 1,
                             finished_at = ?1
                             WHERE id = ?2 AND status = 'queued'",
                            params![now.as_str(), id],
                        )
                        .await
                        .map_err(|e| DocsinkError::Storage(e.to_string()))?
                }
                JobStatus::Running => self
                    .conn
                    .execute(
                        "UPDATE jobs SET cancel_requested = 1
                         WHERE id = ?1 AND status = 'running'",
                        params![id],
                    )
                    .await
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?,
                _ => unreachable!("terminal handled above"),
            };

            if affected == 1 {
                let action = match job.status {
                    JobStatus::Queued => CancelAction::CancelledImmediately,
                    _ => CancelAction::CancellationRequested,
                };
                return Ok(CancelOutcome {
                    action,
                    previous_status: job.status,
                });
            }
            // The job moved between read and update; re-read and retry.
        }
        Err(DocsinkError::Storage(format!(
            "job {id} state kept changing during cancel"
        )))
    }

    /// Read the cancellation flag (polled by running workers).
    pub async fn cancel_requested(&self, id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let flag: i64 = row
                    .get(0)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?;
                Ok(flag != 0)
            }
            Ok(None) => Err(DocsinkError::Storage(format!("job {id} not found"))),
            Err(e) => Err(DocsinkError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Queries and maintenance
    // -----------------------------------------------------------------------

    /// Fetch one job row.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, status, args_json, result_json, logs, error,
                        cancel_requested, created_at, started_at, finished_at
                 FROM jobs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DocsinkError::Storage(e.to_string())),
        }
    }

    /// Most recent jobs first.
    pub async fn list_jobs(&self, limit: u32) -> Result<Vec<JobRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, status, args_json, result_json, logs, error,
                        cancel_requested, created_at, started_at, finished_at
                 FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Delete all terminal job rows. Returns the number removed.
    pub async fn clear_finished_jobs(&self) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled')",
                params![],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))
    }
}

/// Convert a database row to a [`JobRow`].
fn row_to_job(row: &libsql::Row) -> Result<JobRow> {
    let status_str: String = row
        .get(2)
        .map_err(|e| DocsinkError::Storage(e.to_string()))?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| DocsinkError::Storage(e))?;

    let parse_json = |value: Option<String>| -> Result<Option<serde_json::Value>> {
        value
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| DocsinkError::Storage(format!("invalid job JSON: {e}")))
    };

    let cancel_requested: i64 = row
        .get(7)
        .map_err(|e| DocsinkError::Storage(e.to_string()))?;

    Ok(JobRow {
        id: row
            .get::<String>(0)
            .map_err(|e| DocsinkError::Storage(e.to_string()))?,
        name: row
            .get::<String>(1)
            .map_err(|e| DocsinkError::Storage(e.to_string()))?,
        status,
        args: parse_json(row.get::<String>(3).ok())?,
        result: parse_json(row.get::<String>(4).ok())?,
        logs: row
            .get::<String>(5)
            .map_err(|e| DocsinkError::Storage(e.to_string()))?,
        error: row.get::<String>(6).ok(),
        cancel_requested: cancel_requested != 0,
        created_at: parse_timestamp(
            &row.get::<String>(8)
                .map_err(|e| DocsinkError::Storage(e.to_string()))?,
        )?,
        started_at: match row.get::<String>(9).ok() {
            Some(s) => Some(parse_timestamp(&s)?),
            None => None,
        },
        finished_at: match row.get::<String>(10).ok() {
            Some(s) => Some(parse_timestamp(&s)?),
            None => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_storage;

    #[tokio::test]
    async fn create_claim_log_finish() {
        let storage = test_storage().await;
        let args = serde_json::json!({ "root_url": "https://docs.example.com" });
        let id = storage.create_job("crawl", Some(&args)).await.unwrap();

        let job = storage.get_job(&id).await.unwrap().expect("job");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.args, Some(args));
        assert!(job.started_at.is_none());

        let claimed = storage.claim_next_job().await.unwrap().expect("claimed");
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        storage.append_job_log(&id, "[1/3] scraping").await.unwrap();
        storage.append_job_log(&id, "[2/3] scraping").await.unwrap();

        let result = serde_json::json!({ "pages_inserted": 2 });
        storage
            .finish_job(&id, JobOutcome::Completed(result.clone()))
            .await
            .unwrap();

        let done = storage.get_job(&id).await.unwrap().expect("job");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(result));
        assert_eq!(done.logs, "[1/3] scraping\n[2/3] scraping");
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn claim_order_is_oldest_first() {
        let storage = test_storage().await;
        let first = storage.create_job("crawl", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = storage.create_job("crawl", None).await.unwrap();

        assert_eq!(storage.claim_next_job().await.unwrap().unwrap().id, first);
        assert_eq!(storage.claim_next_job().await.unwrap().unwrap().id, second);
        assert!(storage.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let storage = test_storage().await;
        storage.create_job("crawl", None).await.unwrap();

        let (a, b) = tokio::join!(storage.claim_next_job(), storage.claim_next_job());
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(
            a.is_some() != b.is_some(),
            "exactly one claimant must win: {a:?} vs {b:?}"
        );
    }

    #[tokio::test]
    async fn cancel_queued_is_immediately_terminal() {
        let storage = test_storage().await;
        let id = storage.create_job("crawl", None).await.unwrap();

        let outcome = storage.cancel_job(&id).await.unwrap();
        assert_eq!(outcome.action, CancelAction::CancelledImmediately);
        assert_eq!(outcome.previous_status, JobStatus::Queued);

        let job = storage.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_some());

        // The cancelled job is no longer claimable.
        assert!(storage.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_running_sets_the_flag() {
        let storage = test_storage().await;
        let id = storage.create_job("crawl", None).await.unwrap();
        storage.claim_next_job().await.unwrap().unwrap();

        let outcome = storage.cancel_job(&id).await.unwrap();
        assert_eq!(outcome.action, CancelAction::CancellationRequested);
        assert_eq!(outcome.previous_status, JobStatus::Running);

        assert!(storage.cancel_requested(&id).await.unwrap());
        let job = storage.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running, "worker must observe the flag");
    }

    #[tokio::test]
    async fn cancel_terminal_is_rejected_with_status() {
        let storage = test_storage().await;
        let id = storage.create_job("crawl", None).await.unwrap();
        storage.claim_next_job().await.unwrap().unwrap();
        storage
            .finish_job(&id, JobOutcome::Failed("boom".into()))
            .await
            .unwrap();

        let err = storage.cancel_job(&id).await.expect_err("terminal");
        match err {
            DocsinkError::JobFinished { status } => assert_eq!(status, "failed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_beats_a_racing_success() {
        let storage = test_storage().await;
        let id = storage.create_job("crawl", None).await.unwrap();
        storage.claim_next_job().await.unwrap().unwrap();
        storage.cancel_job(&id).await.unwrap();

        // The worker's body returned success after cancel was requested.
        storage
            .finish_job(
                &id,
                JobOutcome::Completed(serde_json::json!({ "pages_inserted": 10 })),
            )
            .await
            .unwrap();

        let job = storage.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none(), "late result must be discarded");
    }

    #[tokio::test]
    async fn second_finish_is_a_no_op() {
        let storage = test_storage().await;
        let id = storage.create_job("crawl", None).await.unwrap();
        storage.claim_next_job().await.unwrap().unwrap();

        storage
            .finish_job(
                &id,
                JobOutcome::Completed(serde_json::json!({ "pages_inserted": 1 })),
            )
            .await
            .unwrap();
        // A crashed-and-retried worker reports the same completion again.
        storage
            .finish_job(&id, JobOutcome::Failed("retry crash".into()))
            .await
            .unwrap();

        let job = storage.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn list_and_clear_jobs() {
        let storage = test_storage().await;
        let a = storage.create_job("crawl", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let _b = storage.create_job("crawl", None).await.unwrap();

        let jobs = storage.list_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 2);

        storage.claim_next_job().await.unwrap().unwrap();
        storage
            .finish_job(&a, JobOutcome::Cancelled)
            .await
            .unwrap();

        let removed = storage.clear_finished_jobs().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.list_jobs(10).await.unwrap().len(), 1);
    }
}
