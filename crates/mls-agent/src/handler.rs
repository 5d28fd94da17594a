use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mls_queue::{HandlerOutcome, JobHandler, JobQueue, JobRecord};

use crate::agent::AgentLoop;
use crate::error::AgentError;

/// Queue handler for `agent` jobs. The run id is the slot holder for the
/// whole iteration chain, including the builds the loop enqueues.
pub struct AgentJobHandler {
    agent: AgentLoop,
    queue: JobQueue,
}

impl AgentJobHandler {
    pub fn new(agent: AgentLoop, queue: JobQueue) -> Self {
        Self { agent, queue }
    }
}

#[async_trait]
impl JobHandler for AgentJobHandler {
    async fn handle(&self, job: &JobRecord, cancel: CancellationToken) -> HandlerOutcome {
        let Some(run_id) = job.payload.get("runId").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Failed {
                message: "job payload missing runId".to_string(),
                retryable: false,
            };
        };

        if let Err(err) = self.queue.acquire_slot(&job.site_id, run_id).await {
            return HandlerOutcome::Failed {
                message: err.to_string(),
                retryable: false,
            };
        }

        let result = self.agent.run(run_id, cancel).await;

        if let Err(err) = self.queue.release_slot(&job.site_id, run_id).await {
            tracing::warn!(site_id = %job.site_id, error = %err, "slot release failed");
        }

        match result {
            Ok(_) => HandlerOutcome::Success,
            Err(AgentError::Cancelled) => HandlerOutcome::Cancelled,
            Err(err) => HandlerOutcome::Failed {
                retryable: err.is_retryable(),
                message: err.to_string(),
            },
        }
    }
}
