use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use mls_store::{JobKind, JobRecord, JobStatus, SiteSlot, Store, StoreError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("a build or agent run is already in progress for site {site_id}")]
    AlreadyInProgress { site_id: String },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyInProgress { site_id } => QueueError::AlreadyInProgress { site_id },
            other => QueueError::Store(other),
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Visibility lease on a reserved job; auto-releases on worker death.
    pub lease: Duration,
    /// Exponential backoff: `base * factor^(attempt-1)`, ±`jitter`.
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub max_retries: u32,
    pub jitter: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::minutes(30),
            backoff_base: Duration::seconds(10),
            backoff_factor: 2.0,
            max_retries: 5,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success,
    Failed { message: String, retryable: bool },
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit id for deduplication; generated when absent.
    pub job_id: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelStaleSummary {
    pub builds: usize,
    pub agent_runs: usize,
    pub jobs: usize,
}

/// Durable FIFO queue over the store's `jobs` table.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<Store>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<Store>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueues a ready job. When `opts.job_id` names an existing job the
    /// stored record comes back untouched.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        site_id: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> QueueResult<JobRecord> {
        let now = Utc::now();
        let job = JobRecord {
            id: opts.job_id.unwrap_or_else(mls_types::job_id),
            kind,
            site_id: site_id.to_string(),
            payload,
            status: JobStatus::Ready,
            attempts: 0,
            max_retries: opts.max_retries.unwrap_or(self.config.max_retries),
            not_before: now,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let (stored, _inserted) = self.store.insert_job(&job).await?;
        Ok(stored)
    }

    /// The single point of serialization across the process; see the store's
    /// `acquire_site_slot` for the semantics.
    pub async fn acquire_slot(&self, site_id: &str, holder: &str) -> QueueResult<SiteSlot> {
        Ok(self
            .store
            .acquire_site_slot(site_id, holder, self.config.lease)
            .await?)
    }

    pub async fn renew_slot(&self, site_id: &str, holder: &str) -> QueueResult<()> {
        Ok(self
            .store
            .renew_site_slot(site_id, holder, self.config.lease)
            .await?)
    }

    pub async fn release_slot(&self, site_id: &str, holder: &str) -> QueueResult<()> {
        Ok(self.store.release_site_slot(site_id, holder).await?)
    }

    /// Pulls the oldest ready job under a visibility lease.
    pub async fn reserve(&self) -> QueueResult<Option<JobRecord>> {
        Ok(self.store.reserve_next_job(self.config.lease).await?)
    }

    pub async fn get(&self, job_id: &str) -> QueueResult<JobRecord> {
        Ok(self.store.get_job(job_id).await?)
    }

    /// Terminal acknowledgement. A retryable failure below the retry budget
    /// re-enqueues with exponential backoff instead of going terminal.
    pub async fn ack(&self, job_id: &str, outcome: JobOutcome) -> QueueResult<JobRecord> {
        match outcome {
            JobOutcome::Success => {
                self.store.ack_job(job_id, JobStatus::Succeeded, None).await?;
            }
            JobOutcome::Cancelled => {
                self.store
                    .ack_job(job_id, JobStatus::Cancelled, Some("cancelled"))
                    .await?;
            }
            JobOutcome::Failed { message, retryable } => {
                let job = self.store.get_job(job_id).await?;
                if retryable && job.attempts <= job.max_retries {
                    let delay = self.backoff_delay(&job.id, job.attempts);
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        delay_s = delay.num_seconds(),
                        "requeueing failed job with backoff"
                    );
                    self.store
                        .requeue_job(job_id, Utc::now() + delay, &message)
                        .await?;
                } else {
                    self.store
                        .ack_job(job_id, JobStatus::Failed, Some(&message))
                        .await?;
                }
            }
        }
        Ok(self.store.get_job(job_id).await?)
    }

    /// Recovery entry point for a site whose worker died without releasing
    /// its lease: cancels non-terminal builds, agent runs and jobs, and
    /// breaks the slot.
    pub async fn cancel_stale(&self, site_id: &str) -> QueueResult<CancelStaleSummary> {
        let builds = self.store.cancel_non_terminal_builds(site_id).await?;
        let agent_runs = self.store.cancel_non_terminal_agent_runs(site_id).await?;
        let jobs = self.store.cancel_jobs_for_site(site_id).await?;
        self.store.break_site_slot(site_id).await?;
        Ok(CancelStaleSummary {
            builds,
            agent_runs,
            jobs,
        })
    }

    /// Deterministic jitter: hash of `(job, attempt)` spread over ±jitter so
    /// retry storms decorrelate without a PRNG in the hot path.
    fn backoff_delay(&self, job_id: &str, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.config.backoff_base.num_milliseconds() as f64;
        let raw_ms = base_ms * self.config.backoff_factor.powi(exponent as i32);

        let mut hasher = DefaultHasher::new();
        (job_id, attempt).hash(&mut hasher);
        let unit = (hasher.finish() % 10_000) as f64 / 10_000.0;
        let factor = 1.0 + (unit * 2.0 - 1.0) * self.config.jitter;

        Duration::milliseconds((raw_ms * factor) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::Site;
    use serde_json::json;

    async fn queue() -> (JobQueue, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        (JobQueue::new(store.clone(), QueueConfig::default()), store)
    }

    #[tokio::test]
    async fn enqueue_with_explicit_id_deduplicates() {
        let (queue, _) = queue().await;
        let opts = EnqueueOptions {
            job_id: Some("job_fixed".into()),
            max_retries: None,
        };
        let first = queue
            .enqueue(JobKind::Build, "site_a", json!({"n": 1}), opts.clone())
            .await
            .unwrap();
        let second = queue
            .enqueue(JobKind::Build, "site_a", json!({"n": 2}), opts)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.payload["n"], 1);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_delay() {
        let (queue, _) = queue().await;
        queue
            .enqueue(JobKind::Build, "site_a", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = queue.reserve().await.unwrap().unwrap();
        let after = queue
            .ack(
                &job.id,
                JobOutcome::Failed {
                    message: "timeout".into(),
                    retryable: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Ready);
        assert!(after.not_before > Utc::now());
        assert_eq!(after.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn fatal_failure_goes_terminal() {
        let (queue, _) = queue().await;
        queue
            .enqueue(JobKind::Build, "site_a", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = queue.reserve().await.unwrap().unwrap();
        let after = queue
            .ack(
                &job.id,
                JobOutcome::Failed {
                    message: "corrupt artifact".into(),
                    retryable: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_goes_terminal() {
        let (queue, store) = queue().await;
        queue
            .enqueue(
                JobKind::Build,
                "site_a",
                json!({}),
                EnqueueOptions {
                    job_id: None,
                    max_retries: Some(0),
                },
            )
            .await
            .unwrap();
        let job = queue.reserve().await.unwrap().unwrap();
        // attempts is now 1 > max_retries 0, so even a retryable failure is
        // terminal.
        let after = queue
            .ack(
                &job.id,
                JobOutcome::Failed {
                    message: "timeout".into(),
                    retryable: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        drop(store);
    }

    #[tokio::test]
    async fn backoff_grows_exponentially_within_jitter() {
        let (queue, _) = queue().await;
        let first = queue.backoff_delay("job_x", 1);
        let third = queue.backoff_delay("job_x", 3);
        // base 10s: attempt 1 ∈ [8s, 12s], attempt 3 ∈ [32s, 48s].
        assert!(first >= Duration::seconds(8) && first <= Duration::seconds(12));
        assert!(third >= Duration::seconds(32) && third <= Duration::seconds(48));
    }

    #[tokio::test]
    async fn cancel_stale_sweeps_everything_for_the_site() {
        let (queue, store) = queue().await;
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let build = mls_types::Build::new(
            &site.id,
            mls_types::BuildScope::Full,
            mls_types::BuildTrigger::User,
        );
        store.insert_build(&build).await.unwrap();
        queue
            .enqueue(JobKind::Build, &site.id, json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        queue.acquire_slot(&site.id, &build.id).await.unwrap();
        // Worker crashed mid-deploy: the build is stuck non-terminal.
        store
            .write_build_status(&build.id, mls_types::BuildStatus::Deploying, None)
            .await
            .unwrap();

        let summary = queue.cancel_stale(&site.id).await.unwrap();
        assert_eq!(
            summary,
            CancelStaleSummary {
                builds: 1,
                agent_runs: 0,
                jobs: 1
            }
        );
        // The slot is free again.
        queue.acquire_slot(&site.id, "worker-2").await.unwrap();
    }
}
