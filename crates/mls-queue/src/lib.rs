mod cancel;
mod queue;
mod worker;

pub use cancel::CancellationRegistry;
pub use queue::{
    CancelStaleSummary, EnqueueOptions, JobOutcome, JobQueue, QueueConfig, QueueError, QueueResult,
};
pub use worker::{HandlerOutcome, JobHandler, WorkerPool};

pub use mls_store::{JobKind, JobRecord, JobStatus};
