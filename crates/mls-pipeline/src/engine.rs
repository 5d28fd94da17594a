use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Level;

use mls_adapters::Services;
use mls_events::{EventBus, TopicPublisher};
use mls_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mls_settings::SettingsResolver;
use mls_store::Store;
use mls_types::{
    Build, BuildPhase, BuildStatus, ProgressEvent, SiteStatus, Topic, TopicKind,
};

use crate::context::{BuildContext, PipelineLimits};
use crate::error::{PipelineError, PipelineResult};
use crate::paths::{prune_build_artifacts, ArtifactPaths};
use crate::phases::{self, CrawlOutput};
use crate::state::BuildStateMachine;

/// Drives one build through the eight phases with checkpoints, budgets and
/// progress events. Construct once; clone per job.
#[derive(Clone)]
pub struct PipelineEngine {
    store: Arc<Store>,
    resolver: SettingsResolver,
    services: Services,
    events: EventBus,
    paths: ArtifactPaths,
    limits: PipelineLimits,
    state: BuildStateMachine,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<Store>,
        resolver: SettingsResolver,
        services: Services,
        events: EventBus,
        paths: ArtifactPaths,
        limits: PipelineLimits,
    ) -> Self {
        let state = BuildStateMachine::new(store.clone());
        Self {
            store,
            resolver,
            services,
            events,
            paths,
            limits,
            state,
        }
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub async fn run_build(&self, build_id: &str, cancel: CancellationToken) -> PipelineResult<Build> {
        let mut build = self
            .store
            .get_build(build_id)
            .await
            .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "load", err))?;
        let site = self
            .store
            .get_site(&build.site_id)
            .await
            .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "load", err))?;

        // Retry of a failed build keeps the id, resets progress and clears
        // the failure payload; crawl artifacts on disk survive.
        if build.status == BuildStatus::Failed {
            self.store
                .reset_build_for_retry(&build.id)
                .await
                .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "retry-reset", err))?;
            build = self
                .store
                .get_build(build_id)
                .await
                .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "load", err))?;
        }

        let topic = Topic::new(TopicKind::Build, &site.id);
        let publisher = TopicPublisher::new(self.events.clone(), topic);

        // Settings validation failures are fatal before anything runs; the
        // build still lands in `failed` with structured details.
        let setup = async {
            let resolved_value = self.resolver.resolve_site_value(&site.id).await.map_err(
                |err| PipelineError::fatal(BuildPhase::Crawl, "settings", err.to_string()),
            )?;
            let settings = SettingsResolver::validate(&resolved_value).map_err(|err| {
                PipelineError::fatal(BuildPhase::Crawl, "settings", err.to_string())
            })?;
            self.paths
                .ensure_build_dirs(&build.id)
                .await
                .map_err(|err| PipelineError::from_io(BuildPhase::Crawl, "artifact-dirs", err))?;
            Ok::<_, PipelineError>((resolved_value, settings))
        };
        let (resolved_value, settings) = match setup.await {
            Ok(ready) => ready,
            Err(err) => {
                let details = err.details(BuildPhase::Crawl);
                self.state
                    .transition(&build.id, BuildStatus::Failed, Some(&details))
                    .await?;
                return Err(err);
            }
        };
        build.resolved_settings = resolved_value;

        let start_after = build.checkpoint_phase;
        let mut ctx = BuildContext::new(
            build,
            site,
            settings,
            self.resolver.clone(),
            self.services.clone(),
            self.store.clone(),
            self.paths.clone(),
            publisher,
            cancel,
            self.limits.clone(),
        );

        let _ = self
            .store
            .set_site_status(&ctx.site.id, SiteStatus::Building)
            .await;

        let result = self.run_phases(&mut ctx, start_after).await;
        let _ = ctx.flush_logs().await;

        match result {
            Ok(()) => {
                self.state
                    .transition(&ctx.build.id, BuildStatus::Success, None)
                    .await?;
                let _ = self
                    .store
                    .set_site_status(&ctx.site.id, SiteStatus::Active)
                    .await;
                ctx.emit(ProgressEvent::Done);
                self.observe(&ctx, "build.completed", "success");
                let _ = prune_build_artifacts(
                    &self.paths,
                    &self.store,
                    &ctx.site.id,
                    self.limits.keep_artifacts,
                    Some(&ctx.build.id),
                )
                .await;
                self.events.prune_idle_topics();
                self.store
                    .get_build(&ctx.build.id)
                    .await
                    .map_err(|err| PipelineError::from_store(BuildPhase::Measure, "load", err))
            }
            Err(PipelineError::Cancelled) => {
                let current_phase = ctx.build.checkpoint_phase.unwrap_or(BuildPhase::Crawl);
                let details = PipelineError::Cancelled.details(current_phase);
                self.state
                    .transition(&ctx.build.id, BuildStatus::Cancelled, Some(&details))
                    .await?;
                let _ = self
                    .store
                    .set_site_status(&ctx.site.id, SiteStatus::Active)
                    .await;
                ctx.emit(ProgressEvent::error("build cancelled"));
                self.observe(&ctx, "build.cancelled", "cancelled");
                Err(PipelineError::Cancelled)
            }
            Err(err) => {
                let current_phase = ctx.build.checkpoint_phase.unwrap_or(BuildPhase::Crawl);
                let details = err.details(current_phase);
                self.state
                    .transition(&ctx.build.id, BuildStatus::Failed, Some(&details))
                    .await?;
                let _ = self
                    .store
                    .set_site_status(&ctx.site.id, SiteStatus::Error)
                    .await;
                ctx.emit(ProgressEvent::error(format!(
                    "build failed in {}/{}: {}",
                    details.phase, details.step, details.message
                )));
                self.observe(&ctx, "build.failed", "failed");
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        ctx: &mut BuildContext,
        start_after: Option<BuildPhase>,
    ) -> PipelineResult<()> {
        let mut crawl_output: Option<CrawlOutput> = None;
        let mut edge_url: Option<String> = ctx.site.edge_url.clone();
        let mut display_status = BuildStatus::Queued;

        for phase in BuildPhase::ALL {
            // Resume path: skip phases at or before the checkpoint, reusing
            // the crawl artifacts already on disk.
            if let Some(done) = start_after {
                if phase <= done {
                    if crawl_output.is_none() {
                        let output = phases::crawl::load_persisted(ctx).await?;
                        ctx.build.pages_total = output.inventory.pages.len() as u64;
                        crawl_output = Some(output);
                    }
                    continue;
                }
            }

            ctx.check_cancelled()?;

            let wanted = phase.display_status();
            if wanted != display_status {
                self.state.transition(&ctx.build.id, wanted, None).await?;
                display_status = wanted;
            }
            ctx.emit(ProgressEvent::phase(phase.as_str()));
            self.observe_phase(ctx, phase, "start");

            let budget = self.limits.phase_timeouts.budget(phase);
            let phase_result = tokio::time::timeout(
                budget,
                self.run_single_phase(ctx, phase, &mut crawl_output, &mut edge_url),
            )
            .await;
            match phase_result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(PipelineError::Timeout {
                        phase: phase.as_str().to_string(),
                        budget_secs: budget.as_secs(),
                    })
                }
            }

            // Durable checkpoint before the next phase starts.
            self.store
                .write_build_checkpoint(&ctx.build.id, phase)
                .await
                .map_err(|err| PipelineError::from_store(phase, "checkpoint", err))?;
            ctx.build.checkpoint_phase = Some(phase);
            self.store
                .update_build_metrics(&ctx.build)
                .await
                .map_err(|err| PipelineError::from_store(phase, "metrics", err))?;
            self.store
                .update_build_progress(&ctx.build.id, ctx.build.pages_total, ctx.build.pages_processed)
                .await
                .map_err(|err| PipelineError::from_store(phase, "progress", err))?;
            ctx.flush_logs().await?;
            self.observe_phase(ctx, phase, "complete");
        }
        Ok(())
    }

    async fn run_single_phase(
        &self,
        ctx: &mut BuildContext,
        phase: BuildPhase,
        crawl_output: &mut Option<CrawlOutput>,
        edge_url: &mut Option<String>,
    ) -> PipelineResult<()> {
        match phase {
            BuildPhase::Crawl => {
                let output = phases::crawl::run(ctx).await?;
                *crawl_output = Some(output);
            }
            BuildPhase::Images => {
                let crawl = self.require_crawl(ctx, crawl_output).await?;
                phases::images::run(ctx, &crawl).await?;
            }
            BuildPhase::Css => {
                let crawl = self.require_crawl(ctx, crawl_output).await?;
                phases::css::run(ctx, &crawl).await?;
            }
            BuildPhase::Js => {
                let crawl = self.require_crawl(ctx, crawl_output).await?;
                phases::js::run(ctx, &crawl).await?;
            }
            BuildPhase::Html => {
                let crawl = self.require_crawl(ctx, crawl_output).await?;
                phases::html::run(ctx, &crawl).await?;
                ctx.build.pages_processed = ctx.build.pages_total;
            }
            BuildPhase::Fonts => {
                let crawl = self.require_crawl(ctx, crawl_output).await?;
                phases::fonts::run(ctx, &crawl).await?;
            }
            BuildPhase::Deploy => {
                let url = phases::deploy::run(ctx).await?;
                *edge_url = Some(url);
            }
            BuildPhase::Measure => {
                let url = edge_url.clone().ok_or_else(|| {
                    PipelineError::fatal(BuildPhase::Measure, "edge-url", "no edge URL recorded")
                })?;
                phases::measure::run(ctx, &url).await?;
            }
        }
        Ok(())
    }

    /// Later phases re-read the persisted crawl output when resuming.
    async fn require_crawl(
        &self,
        ctx: &BuildContext,
        cached: &mut Option<CrawlOutput>,
    ) -> PipelineResult<CrawlOutput> {
        if let Some(output) = cached {
            return Ok(output.clone());
        }
        let output = phases::crawl::load_persisted(ctx).await?;
        *cached = Some(output.clone());
        Ok(output)
    }

    fn observe(&self, ctx: &BuildContext, event: &str, status: &str) {
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent {
                event,
                component: "pipeline.engine",
                site_id: Some(&ctx.site.id),
                build_id: Some(&ctx.build.id),
                status: Some(status),
                ..Default::default()
            },
        );
    }

    fn observe_phase(&self, ctx: &BuildContext, phase: BuildPhase, status: &str) {
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent {
                event: "build.phase",
                component: "pipeline.engine",
                site_id: Some(&ctx.site.id),
                build_id: Some(&ctx.build.id),
                phase: Some(phase.as_str()),
                status: Some(status),
                ..Default::default()
            },
        );
    }
}
