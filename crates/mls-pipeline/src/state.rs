use std::sync::Arc;

use mls_store::Store;
use mls_types::{BuildStatus, ErrorDetails};

use crate::error::{PipelineError, PipelineResult};
use mls_types::BuildPhase;

/// Allowed transitions of the build lifecycle:
///
/// ```text
/// queued ──▶ crawling ─▶ optimizing ─▶ deploying ─▶ success
///    │           │            │             │
///    ▼           ▼            ▼             ▼
/// cancelled    failed       failed        failed
///                └────retry────┴──▶ queued (same id)
/// ```
pub fn can_transition(from: BuildStatus, to: BuildStatus) -> bool {
    use BuildStatus::*;
    matches!(
        (from, to),
        (Queued, Crawling)
            | (Queued, Cancelled)
            // Configuration errors fail a build before any phase starts.
            | (Queued, Failed)
            | (Crawling, Optimizing)
            | (Crawling, Failed)
            | (Crawling, Cancelled)
            | (Optimizing, Deploying)
            | (Optimizing, Failed)
            | (Optimizing, Cancelled)
            | (Deploying, Success)
            | (Deploying, Failed)
            | (Deploying, Cancelled)
            | (Failed, Queued)
            // Resuming from a checkpoint can re-enter any running status.
            | (Queued, Optimizing)
            | (Queued, Deploying)
    )
}

/// The sole writer of `builds.status`. Off-diagram transitions are rejected
/// before anything touches the store; terminal writes are synchronous so
/// durability precedes the next phase.
#[derive(Clone)]
pub struct BuildStateMachine {
    store: Arc<Store>,
}

impl BuildStateMachine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn transition(
        &self,
        build_id: &str,
        to: BuildStatus,
        error_details: Option<&ErrorDetails>,
    ) -> PipelineResult<()> {
        let build = self
            .store
            .get_build(build_id)
            .await
            .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "state-read", err))?;
        if build.status == to {
            return Ok(());
        }
        if !can_transition(build.status, to) {
            return Err(PipelineError::fatal(
                BuildPhase::Crawl,
                "state-transition",
                format!(
                    "illegal transition {} -> {} for {build_id}",
                    build.status.as_str(),
                    to.as_str()
                ),
            ));
        }
        self.store
            .write_build_status(build_id, to, error_details)
            .await
            .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "state-write", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::{Build, BuildScope, BuildTrigger, Site};

    #[test]
    fn diagram_is_enforced() {
        use BuildStatus::*;
        assert!(can_transition(Queued, Crawling));
        assert!(can_transition(Crawling, Optimizing));
        assert!(can_transition(Optimizing, Deploying));
        assert!(can_transition(Deploying, Success));
        assert!(can_transition(Failed, Queued));
        assert!(!can_transition(Success, Crawling));
        assert!(!can_transition(Cancelled, Queued));
        assert!(!can_transition(Queued, Success));
        assert!(!can_transition(Crawling, Deploying));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_before_the_write() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();

        let machine = BuildStateMachine::new(store.clone());
        machine
            .transition(&build.id, BuildStatus::Crawling, None)
            .await
            .unwrap();
        let err = machine
            .transition(&build.id, BuildStatus::Success, None)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        let loaded = store.get_build(&build.id).await.unwrap();
        assert_eq!(loaded.status, BuildStatus::Crawling);
    }

    #[tokio::test]
    async fn same_status_write_is_a_noop() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();

        let machine = BuildStateMachine::new(store);
        machine
            .transition(&build.id, BuildStatus::Queued, None)
            .await
            .unwrap();
    }
}
