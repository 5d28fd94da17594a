use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mls_store::{JobKind, JobRecord};

use crate::cancel::CancellationRegistry;
use crate::queue::{JobOutcome, JobQueue};

/// What a handler reports back to the queue when a job ends.
#[derive(Debug)]
pub enum HandlerOutcome {
    Success,
    Cancelled,
    Failed { message: String, retryable: bool },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord, cancel: CancellationToken) -> HandlerOutcome;
}

/// Polling worker pool over the shared queue. One pool consumes both job
/// kinds; the per-site slot inside each handler is what serializes work.
pub struct WorkerPool {
    queue: JobQueue,
    cancellations: CancellationRegistry,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, cancellations: CancellationRegistry) -> Self {
        Self {
            queue,
            cancellations,
            handlers: HashMap::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawns `count` worker tasks that run until `shutdown` fires. Each
    /// worker drives one job to completion at a time.
    pub fn spawn(self, count: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        (0..count)
            .map(|index| {
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    pool.run_worker(index, shutdown).await;
                })
            })
            .collect()
    }

    async fn run_worker(&self, index: usize, shutdown: CancellationToken) {
        info!(worker = index, "worker started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker = index, "worker shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            match self.queue.reserve().await {
                Ok(Some(job)) => self.run_job(index, job).await,
                Ok(None) => {}
                Err(err) => {
                    warn!(worker = index, error = %err, "reserve failed");
                }
            }
        }
    }

    async fn run_job(&self, index: usize, job: JobRecord) {
        let Some(handler) = self.handlers.get(&job.kind) else {
            error!(worker = index, job_id = %job.id, kind = job.kind.as_str(), "no handler registered");
            let _ = self
                .queue
                .ack(
                    &job.id,
                    JobOutcome::Failed {
                        message: format!("no handler for kind {}", job.kind.as_str()),
                        retryable: false,
                    },
                )
                .await;
            return;
        };

        info!(worker = index, job_id = %job.id, kind = job.kind.as_str(), site_id = %job.site_id, "job started");
        // Keyed by site: the per-site slot means one running job per site,
        // and stop requests address the site, not the job.
        let cancel = self.cancellations.create(&job.site_id).await;
        let outcome = handler.handle(&job, cancel).await;
        self.cancellations.remove(&job.site_id).await;

        let ack = match outcome {
            HandlerOutcome::Success => JobOutcome::Success,
            HandlerOutcome::Cancelled => JobOutcome::Cancelled,
            HandlerOutcome::Failed { message, retryable } => {
                warn!(worker = index, job_id = %job.id, retryable, %message, "job failed");
                JobOutcome::Failed { message, retryable }
            }
        };
        if let Err(err) = self.queue.ack(&job.id, ack).await {
            error!(worker = index, job_id = %job.id, error = %err, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, QueueConfig};
    use mls_store::{JobStatus, Store};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &JobRecord, _cancel: CancellationToken) -> HandlerOutcome {
            self.seen.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success
        }
    }

    #[tokio::test]
    async fn pool_drains_jobs_and_acks_success() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = JobQueue::new(store.clone(), QueueConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(queue.clone(), CancellationRegistry::new())
            .with_poll_interval(Duration::from_millis(10));
        pool.register(
            JobKind::Build,
            Arc::new(CountingHandler { seen: seen.clone() }),
        );

        let job = queue
            .enqueue(JobKind::Build, "site_a", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handles = pool.spawn(2, shutdown.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seen.load(Ordering::SeqCst) >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }

        let stored = store.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    struct UnregisteredKindOnly;

    #[async_trait]
    impl JobHandler for UnregisteredKindOnly {
        async fn handle(&self, _job: &JobRecord, _cancel: CancellationToken) -> HandlerOutcome {
            HandlerOutcome::Success
        }
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job_fatally() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = JobQueue::new(store.clone(), QueueConfig::default());
        let mut pool = WorkerPool::new(queue.clone(), CancellationRegistry::new())
            .with_poll_interval(Duration::from_millis(10));
        // Only the agent kind is registered; the build job has no handler.
        pool.register(JobKind::Agent, Arc::new(UnregisteredKindOnly));

        let job = queue
            .enqueue(JobKind::Build, "site_a", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handles = pool.spawn(1, shutdown.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stored = store.get_job(&job.id).await.unwrap();
                if stored.status == JobStatus::Failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
