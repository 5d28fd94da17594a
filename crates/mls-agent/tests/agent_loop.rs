use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mls_agent::{AgentConfig, AgentLoop};
use mls_events::EventBus;
use mls_pipeline::testing::mock_services;
use mls_pipeline::{ArtifactPaths, BuildJobHandler, PipelineEngine, PipelineLimits};
use mls_queue::{CancellationRegistry, JobKind, JobQueue, QueueConfig, WorkerPool};
use mls_settings::SettingsResolver;
use mls_store::Store;
use mls_types::{AgentPhase, BuildStatus, BuildTrigger, ReviewVerdict, Site};

const HOME: &str = r#"<html><head><title>Acme</title></head><body>
<a href="/about/">About</a>
<div class="swiper-container"></div>
</body></html>"#;

const ABOUT: &str = "<html><head><title>About</title></head><body><a href=\"/\">Home</a></body></html>";

fn plan_reply() -> String {
    serde_json::json!({
        "settings": {"css": {"purgeAggressiveness": "aggressive"}},
        "rationale": {"css": "most selectors are unused"},
        "expected": {
            "performanceScore": 92.0,
            "payloadSavingsPercent": 60.0,
            "lcpImprovementPercent": 55.0
        }
    })
    .to_string()
}

fn needs_changes_reply() -> String {
    serde_json::json!({
        "verdict": "needs-changes",
        "settingDelta": {"css": {"purgeSafelist": {"standard": ["slider-active"]}}},
        "reasoning": "slider state classes were purged",
        "shouldRebuild": true,
        "confidence": 0.8
    })
    .to_string()
}

fn pass_reply() -> String {
    serde_json::json!({
        "verdict": "pass",
        "reasoning": "functional checks are green",
        "shouldRebuild": false,
        "confidence": 0.95
    })
    .to_string()
}

struct Harness {
    store: Arc<Store>,
    queue: JobQueue,
    agent: AgentLoop,
    site: Site,
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
    _tmp: tempfile::TempDir,
}

async fn harness(oracle_replies: Vec<String>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let site = Site::new("Acme", "https://acme.test");
    store.insert_site(&site).await.unwrap();

    let mut pages = HashMap::new();
    pages.insert("https://acme.test/".to_string(), HOME.to_string());
    pages.insert("https://acme.test/about/".to_string(), ABOUT.to_string());
    let services = mock_services(pages, oracle_replies);

    let events = EventBus::new();
    let resolver = SettingsResolver::new(store.clone());
    let paths = ArtifactPaths::new(tmp.path());
    let queue = JobQueue::new(store.clone(), QueueConfig::default());
    let engine = PipelineEngine::new(
        store.clone(),
        resolver.clone(),
        services.clone(),
        events.clone(),
        paths.clone(),
        PipelineLimits::default(),
    );

    let mut pool = WorkerPool::new(queue.clone(), CancellationRegistry::new())
        .with_poll_interval(Duration::from_millis(20));
    pool.register(
        JobKind::Build,
        Arc::new(BuildJobHandler::new(engine, queue.clone())),
    );
    let shutdown = CancellationToken::new();
    let handles = pool.spawn(2, shutdown.clone());

    let agent = AgentLoop::new(
        store.clone(),
        queue.clone(),
        resolver,
        services,
        events,
        paths,
        AgentConfig {
            build_poll: Duration::from_millis(25),
            ..AgentConfig::default()
        },
    );

    Harness {
        store,
        queue,
        agent,
        site,
        shutdown,
        handles,
        _tmp: tmp,
    }
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[tokio::test]
async fn two_iterations_needs_changes_then_pass() {
    let h = harness(vec![plan_reply(), needs_changes_reply(), pass_reply()]).await;

    let run = h.agent.create_run(&h.site.id, None).await.unwrap();

    let finished = tokio::time::timeout(
        Duration::from_secs(60),
        h.agent.run(&run.id, CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(finished.phase, AgentPhase::Complete);
    assert_eq!(finished.iteration, 2);
    assert_eq!(finished.checkpoint.history.len(), 2);
    assert_eq!(
        finished.checkpoint.history[0].verdict,
        Some(ReviewVerdict::NeedsChanges)
    );
    assert_eq!(
        finished.checkpoint.history[1].verdict,
        Some(ReviewVerdict::Pass)
    );
    // Three oracle calls, 1000 in / 200 out each.
    assert_eq!(finished.checkpoint.tokens.input_tokens, 3000);
    assert_eq!(finished.checkpoint.tokens.output_tokens, 600);

    // The needs-changes delta was merged into the site's sparse settings.
    let site = h.store.get_site(&h.site.id).await.unwrap();
    assert_eq!(
        site.settings["css"]["purgeSafelist"]["standard"][0],
        "slider-active"
    );

    // Both iterations produced successful agent-triggered builds.
    let builds = h.store.list_builds(&h.site.id, 10, 0).await.unwrap();
    let agent_builds: Vec<_> = builds
        .iter()
        .filter(|b| b.triggered_by == BuildTrigger::Agent)
        .collect();
    assert_eq!(agent_builds.len(), 2);
    assert!(agent_builds.iter().all(|b| b.status == BuildStatus::Success));

    let report = h.agent.report(&h.site.id).await.unwrap().unwrap();
    assert_eq!(report.final_verdict, "pass");
    assert_eq!(report.total_iterations, 2);

    h.queue.release_slot(&h.site.id, &run.id).await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn cancelled_run_fails_and_is_resumable_while_workdir_exists() {
    let h = harness(vec![plan_reply()]).await;
    let run = h.agent.create_run(&h.site.id, None).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.agent.run(&run.id, cancel).await.unwrap_err();
    assert!(matches!(err, mls_agent::AgentError::Cancelled));

    let stored = h.store.get_agent_run(&run.id).await.unwrap();
    assert_eq!(stored.phase, AgentPhase::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("cancelled"));
    assert!(AgentLoop::can_resume(&stored));

    let reopened = h.agent.prepare_resume(&run.id).await.unwrap();
    assert_eq!(reopened.phase, AgentPhase::Building);

    // Removing the working directory closes the resume gate.
    let workdir = reopened.workdir.clone().unwrap();
    let mut failed = reopened.clone();
    failed.phase = AgentPhase::Failed;
    h.store.update_agent_run(&failed).await.unwrap();
    std::fs::remove_dir_all(&workdir).unwrap();
    let stored = h.store.get_agent_run(&run.id).await.unwrap();
    assert!(!AgentLoop::can_resume(&stored));

    h.stop().await;
}

#[tokio::test]
async fn second_concurrent_run_is_rejected() {
    let h = harness(Vec::new()).await;
    h.agent.create_run(&h.site.id, None).await.unwrap();
    let err = h.agent.create_run(&h.site.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        mls_agent::AgentError::Queue(mls_queue::QueueError::AlreadyInProgress { .. })
    ));
    h.stop().await;
}
