use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mls_queue::{HandlerOutcome, JobHandler, JobQueue, JobRecord};

use crate::engine::PipelineEngine;
use crate::error::PipelineError;

/// Queue handler for `build` jobs. The payload carries the build id and,
/// for agent-owned builds, the run id that already holds the site slot.
pub struct BuildJobHandler {
    engine: PipelineEngine,
    queue: JobQueue,
}

impl BuildJobHandler {
    pub fn new(engine: PipelineEngine, queue: JobQueue) -> Self {
        Self { engine, queue }
    }
}

#[async_trait]
impl JobHandler for BuildJobHandler {
    async fn handle(&self, job: &JobRecord, cancel: CancellationToken) -> HandlerOutcome {
        let Some(build_id) = job.payload.get("buildId").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Failed {
                message: "job payload missing buildId".to_string(),
                retryable: false,
            };
        };
        let owned_by = job
            .payload
            .get("ownedBy")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        // Agent-owned builds run under the agent's slot; standalone builds
        // renew the slot taken at enqueue time.
        let holder = owned_by.clone().unwrap_or_else(|| build_id.to_string());

        if let Err(err) = self.queue.acquire_slot(&job.site_id, &holder).await {
            return HandlerOutcome::Failed {
                message: err.to_string(),
                retryable: false,
            };
        }

        let result = self.engine.run_build(build_id, cancel).await;

        if owned_by.is_none() {
            if let Err(err) = self.queue.release_slot(&job.site_id, &holder).await {
                tracing::warn!(site_id = %job.site_id, error = %err, "slot release failed");
            }
        }

        match result {
            Ok(_) => HandlerOutcome::Success,
            Err(PipelineError::Cancelled) => HandlerOutcome::Cancelled,
            Err(err) => HandlerOutcome::Failed {
                retryable: err.is_retryable(),
                message: err.to_string(),
            },
        }
    }
}
