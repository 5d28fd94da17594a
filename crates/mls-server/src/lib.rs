use std::sync::Arc;

use mls_adapters::Services;
use mls_agent::AgentLoop;
use mls_events::EventBus;
use mls_pipeline::ArtifactPaths;
use mls_queue::{CancellationRegistry, JobQueue};
use mls_settings::SettingsResolver;
use mls_store::Store;
use mls_workspace::{ChatPlanner, LiveEditWorkspace};

mod http;

pub use http::serve;

/// Shared request context: every cross-cutting handle is carried here and
/// passed explicitly, never a process-wide singleton.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub events: EventBus,
    pub queue: JobQueue,
    pub resolver: SettingsResolver,
    pub services: Services,
    pub paths: ArtifactPaths,
    pub agent: AgentLoop,
    pub workspace: LiveEditWorkspace,
    pub planner: ChatPlanner,
    pub cancellations: CancellationRegistry,
    pub api_key: Arc<String>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        queue: JobQueue,
        resolver: SettingsResolver,
        services: Services,
        paths: ArtifactPaths,
        agent: AgentLoop,
        cancellations: CancellationRegistry,
        api_key: String,
    ) -> Self {
        let workspace = LiveEditWorkspace::new(
            store.clone(),
            paths.clone(),
            events.clone(),
            services.clone(),
        );
        let planner = ChatPlanner::new(workspace.clone(), events.clone());
        Self {
            store,
            events,
            queue,
            resolver,
            services,
            paths,
            agent,
            workspace,
            planner,
            cancellations,
            api_key: Arc::new(api_key),
        }
    }
}
