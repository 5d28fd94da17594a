use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use mls_adapters::{parse_plan, parse_review, Services};
use mls_events::{EventBus, TopicPublisher};
use mls_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mls_queue::{EnqueueOptions, JobKind, JobQueue};
use mls_settings::SettingsResolver;
use mls_store::Store;
use mls_types::{
    AgentPhase, AgentReport, AgentRun, AiReviewDecision, Build, BuildScope, BuildStatus,
    BuildTrigger, IterationRecord, OptimizationPlan, ProgressEvent, ReviewVerdict, SiteInventory,
    Topic, TopicKind, VerificationReport,
};
use mls_verify::VerificationSuite;

use crate::error::{AgentError, AgentResult};
use crate::prompts;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub default_max_iterations: u32,
    /// Poll cadence while waiting for an enqueued build.
    pub build_poll: Duration,
    /// Inline attempts for a malformed oracle response before the job-level
    /// retry takes over.
    pub oracle_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 10,
            build_poll: Duration::from_secs(2),
            oracle_attempts: 3,
        }
    }
}

/// The optimize-verify-review driver. One instance serves every run; all
/// per-run state lives in the checkpoint row.
#[derive(Clone)]
pub struct AgentLoop {
    store: Arc<Store>,
    queue: JobQueue,
    resolver: SettingsResolver,
    services: Services,
    events: EventBus,
    paths: mls_pipeline::ArtifactPaths,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        store: Arc<Store>,
        queue: JobQueue,
        resolver: SettingsResolver,
        services: Services,
        events: EventBus,
        paths: mls_pipeline::ArtifactPaths,
        config: AgentConfig,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            services,
            events,
            paths,
            config,
        }
    }

    /// Takes the site slot under the new run's id, then creates the run row
    /// and its working directory. The slot stays held for the whole
    /// iteration chain; the worker picking up the job renews it.
    pub async fn create_run(&self, site_id: &str, max_iterations: Option<u32>) -> AgentResult<AgentRun> {
        let mut run = AgentRun::new(
            site_id,
            max_iterations.unwrap_or(self.config.default_max_iterations),
        );
        self.queue.acquire_slot(site_id, &run.id).await?;
        let workdir = self.paths.site_dir(site_id).join(format!("agent-{}", run.id));
        if let Err(err) = tokio::fs::create_dir_all(&workdir).await {
            let _ = self.queue.release_slot(site_id, &run.id).await;
            return Err(AgentError::NotResumable {
                run_id: run.id.clone(),
                reason: format!("workdir creation failed: {err}"),
            });
        }
        run.workdir = Some(workdir.to_string_lossy().to_string());
        if let Err(err) = self.store.insert_agent_run(&run).await {
            let _ = self.queue.release_slot(site_id, &run.id).await;
            return Err(err.into());
        }
        Ok(run)
    }

    /// Resumability gate: failed run whose working directory still exists.
    pub fn can_resume(run: &AgentRun) -> bool {
        run.phase == AgentPhase::Failed
            && run
                .workdir
                .as_deref()
                .is_some_and(|dir| Path::new(dir).is_dir())
    }

    /// Reopens a failed run at its checkpoint.
    pub async fn prepare_resume(&self, run_id: &str) -> AgentResult<AgentRun> {
        let run = self.store.get_agent_run(run_id).await?;
        if !Self::can_resume(&run) {
            return Err(AgentError::NotResumable {
                run_id: run_id.to_string(),
                reason: "run is not failed or its working directory is gone".to_string(),
            });
        }
        self.store.reopen_agent_run(run_id).await?;
        Ok(self.store.get_agent_run(run_id).await?)
    }

    /// Drives the run to a terminal phase. The checkpoint read at entry is
    /// the single source of truth: a resumed run continues exactly where
    /// the last durable write left it.
    pub async fn run(&self, run_id: &str, cancel: CancellationToken) -> AgentResult<AgentRun> {
        let mut run = self.store.get_agent_run(run_id).await?;
        let site_id = run.site_id.clone();
        let publisher =
            TopicPublisher::new(self.events.clone(), Topic::new(TopicKind::Agent, &site_id));

        let result = self.drive(&mut run, &publisher, &cancel).await;
        match result {
            Ok(()) => Ok(self.store.get_agent_run(run_id).await?),
            Err(err) => {
                let reason = match &err {
                    AgentError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                run.last_error = Some(reason.clone());
                run.phase = AgentPhase::Failed;
                let _ = self.store.update_agent_run(&run).await;
                publisher.publish(ProgressEvent::error(reason));
                self.observe(&run, "agent.failed", "failed");
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut AgentRun,
        publisher: &TopicPublisher,
        cancel: &CancellationToken,
    ) -> AgentResult<()> {
        let mut checkpoint = run.checkpoint.clone();
        let mut clock = Instant::now();

        while run.iteration < run.max_iterations {
            let iteration = run.iteration + 1;
            self.check_cancel(cancel)?;

            if iteration == 1 && checkpoint.history.is_empty() {
                self.set_phase(run, publisher, AgentPhase::Analyzing, iteration, &mut clock)
                .await?;
                let context = self.gather_context(run).await?;
                self.set_phase(run, publisher, AgentPhase::Planning, iteration, &mut clock)
                .await?;
                let plan = self.request_plan(run, publisher, &context).await?;
                checkpoint.settings = plan.settings.clone();
                checkpoint.plan_rationale = Some(plan.rationale.clone());
                checkpoint.tokens = run.checkpoint.tokens;
                self.resolver
                    .replace_site_settings(&run.site_id, &plan.settings, "agent")
                    .await?;
                publisher.log("info", "optimization plan applied to site settings");
            }

            // Durable checkpoint before the build phase: the resume anchor.
            checkpoint.iteration = iteration;
            self.store
                .write_agent_checkpoint(&run.id, &checkpoint)
                .await?;
            run.iteration = iteration;

            self.check_cancel(cancel)?;
            self.set_phase(run, publisher, AgentPhase::Building, iteration, &mut clock)
                .await?;
            let build = self.run_owned_build(run, cancel).await?;
            publisher.log(
                "info",
                format!("build {} finished with status {}", build.id, build.status.as_str()),
            );

            self.check_cancel(cancel)?;
            self.set_phase(run, publisher, AgentPhase::Verifying, iteration, &mut clock)
                .await?;
            publisher.publish(ProgressEvent::VerificationStart);
            let report = self.verify_build(&build).await?;
            publisher.publish(ProgressEvent::VerificationResult {
                payload: json!({
                    "visualFailures": report.visual_failures(),
                    "functionalFailures": report.functional_failures(),
                    "brokenLinks": report.broken_links(),
                    "clean": report.is_clean(),
                }),
            });

            self.check_cancel(cancel)?;
            self.set_phase(run, publisher, AgentPhase::Reviewing, iteration, &mut clock)
                .await?;
            let decision = self
                .request_review(run, publisher, iteration, &report, &checkpoint.history)
                .await?;

            checkpoint.history.push(IterationRecord {
                iteration,
                build_id: Some(build.id.clone()),
                verification: Some(report),
                verdict: Some(decision.verdict),
                reasoning: Some(decision.reasoning.clone()),
                settings_delta: decision.setting_delta.clone(),
            });
            checkpoint.tokens = run.checkpoint.tokens;
            self.store
                .write_agent_checkpoint(&run.id, &checkpoint)
                .await?;

            match decision.verdict {
                ReviewVerdict::Pass => {
                    self.set_phase(run, publisher, AgentPhase::Complete, iteration, &mut clock)
                        .await?;
                    publisher.publish(ProgressEvent::Done);
                    self.observe(run, "agent.completed", "pass");
                    return Ok(());
                }
                ReviewVerdict::CriticalFailure => {
                    publisher.log("error", format!("critical failure: {}", decision.reasoning));
                    return Err(AgentError::NotResumable {
                        run_id: run.id.clone(),
                        reason: format!("critical failure: {}", decision.reasoning),
                    });
                }
                ReviewVerdict::NeedsChanges => {
                    if let Some(delta) = &decision.setting_delta {
                        self.resolver
                            .write_site_settings(&run.site_id, delta, "agent")
                            .await?;
                        let site = self.store.get_site(&run.site_id).await?;
                        checkpoint.settings = site.settings.clone();
                        publisher.log(
                            "info",
                            format!("merged settings delta for iteration {}", iteration + 1),
                        );
                    }
                }
            }
        }

        // Iteration budget exhausted without a pass verdict.
        self.set_phase(run, publisher, AgentPhase::Complete, run.iteration, &mut clock)
            .await?;
        run.last_error = Some("maximum iterations reached".to_string());
        self.store.update_agent_run(run).await?;
        publisher.publish(ProgressEvent::Done);
        self.observe(run, "agent.completed", "max-iterations");
        Ok(())
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> AgentResult<()> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Advances the phase, attributing the elapsed wall time to the phase
    /// being left.
    async fn set_phase(
        &self,
        run: &mut AgentRun,
        publisher: &TopicPublisher,
        phase: AgentPhase,
        iteration: u32,
        clock: &mut Instant,
    ) -> AgentResult<()> {
        let elapsed = clock.elapsed().as_secs_f64();
        *clock = Instant::now();
        *run.phase_timings
            .entry(run.phase.as_str().to_string())
            .or_insert(0.0) += elapsed;
        self.store.update_agent_phase(&run.id, phase).await?;
        run.phase = phase;
        publisher.publish(ProgressEvent::phase_iteration(phase.as_str(), iteration));
        self.store.update_agent_run(run).await?;
        Ok(())
    }

    /// Inventory and measurement context from the most recent successful
    /// build, when one exists.
    async fn gather_context(&self, run: &AgentRun) -> AgentResult<(Option<SiteInventory>, Value)> {
        let inventory = match self.store.latest_successful_build(&run.site_id).await? {
            Some(build) => {
                let path = self.paths.inventory_path(&build.id);
                match tokio::fs::read_to_string(&path).await {
                    Ok(raw) => serde_json::from_str(&raw).ok(),
                    Err(_) => None,
                }
            }
            None => None,
        };
        let measurements = self
            .store
            .list_measurements(&run.site_id, 4)
            .await?
            .into_iter()
            .map(|m| {
                json!({
                    "strategy": m.strategy.as_str(),
                    "original": {"performance": m.original.performance, "lcpMs": m.original.vitals.lcp_ms},
                    "optimized": {"performance": m.optimized.performance, "lcpMs": m.optimized.vitals.lcp_ms},
                })
            })
            .collect::<Vec<_>>();
        Ok((inventory, Value::Array(measurements)))
    }

    async fn request_plan(
        &self,
        run: &mut AgentRun,
        publisher: &TopicPublisher,
        context: &(Option<SiteInventory>, Value),
    ) -> AgentResult<OptimizationPlan> {
        let site = self.store.get_site(&run.site_id).await?;
        let user = prompts::plan_user_content(context.0.as_ref(), &context.1, &site.settings);
        let mut last_err: Option<AgentError> = None;
        for attempt in 1..=self.config.oracle_attempts {
            match self.services.oracle.complete(prompts::PLAN_SYSTEM, &user).await {
                Ok(reply) => {
                    run.checkpoint.tokens.add(reply.usage);
                    match parse_plan(&reply.text) {
                        Ok(plan) => return Ok(plan),
                        Err(err) => {
                            publisher.log(
                                "warn",
                                format!("plan attempt {attempt} was malformed: {err}"),
                            );
                            last_err = Some(err.into());
                        }
                    }
                }
                Err(err) => {
                    publisher.log("warn", format!("plan attempt {attempt} failed: {err}"));
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or(AgentError::NotResumable {
            run_id: run.id.clone(),
            reason: "oracle produced no plan".to_string(),
        }))
    }

    async fn request_review(
        &self,
        run: &mut AgentRun,
        publisher: &TopicPublisher,
        iteration: u32,
        report: &VerificationReport,
        history: &[IterationRecord],
    ) -> AgentResult<AiReviewDecision> {
        let user = prompts::review_user_content(iteration, report, history);
        let mut last_err: Option<AgentError> = None;
        for attempt in 1..=self.config.oracle_attempts {
            match self
                .services
                .oracle
                .complete(prompts::REVIEW_SYSTEM, &user)
                .await
            {
                Ok(reply) => {
                    run.checkpoint.tokens.add(reply.usage);
                    match parse_review(&reply.text) {
                        Ok(decision) => return Ok(decision),
                        Err(err) => {
                            publisher.log(
                                "warn",
                                format!("review attempt {attempt} was malformed: {err}"),
                            );
                            last_err = Some(err.into());
                        }
                    }
                }
                Err(err) => {
                    publisher.log("warn", format!("review attempt {attempt} failed: {err}"));
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or(AgentError::NotResumable {
            run_id: run.id.clone(),
            reason: "oracle produced no review".to_string(),
        }))
    }

    /// Enqueues a full build under this run's slot and waits for a terminal
    /// status, event-driven with a poll fallback.
    async fn run_owned_build(
        &self,
        run: &mut AgentRun,
        cancel: &CancellationToken,
    ) -> AgentResult<Build> {
        let build = Build::new(&run.site_id, BuildScope::Full, BuildTrigger::Agent);
        self.store.insert_build(&build).await?;
        run.current_build_id = Some(build.id.clone());
        self.store.update_agent_run(run).await?;

        let build_topic = Topic::new(TopicKind::Build, &run.site_id);
        let mut rx = self.events.subscribe(&build_topic);
        self.queue
            .enqueue(
                JobKind::Build,
                &run.site_id,
                json!({"buildId": build.id, "ownedBy": run.id}),
                EnqueueOptions::default(),
            )
            .await?;

        loop {
            let current = self.store.get_build(&build.id).await?;
            if current.status.is_terminal() {
                return match current.status {
                    BuildStatus::Success => Ok(current),
                    BuildStatus::Cancelled => Err(AgentError::Cancelled),
                    _ => Err(AgentError::BuildFailed {
                        details: current.error_details.clone().unwrap_or(
                            mls_types::ErrorDetails {
                                phase: "unknown".to_string(),
                                step: "unknown".to_string(),
                                message: "build failed without details".to_string(),
                                retryable: false,
                            },
                        ),
                        build_id: current.id,
                    }),
                };
            }
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.build_poll) => {}
                _ = rx.recv() => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    async fn verify_build(&self, build: &Build) -> AgentResult<VerificationReport> {
        let raw = tokio::fs::read_to_string(self.paths.inventory_path(&build.id))
            .await
            .map_err(|err| AgentError::NotResumable {
                run_id: build.id.clone(),
                reason: format!("inventory unreadable: {err}"),
            })?;
        let inventory: SiteInventory =
            serde_json::from_str(&raw).map_err(|err| AgentError::NotResumable {
                run_id: build.id.clone(),
                reason: format!("inventory corrupt: {err}"),
            })?;
        let site = self.store.get_site(&build.site_id).await?;
        let edge_url = site.edge_url.ok_or_else(|| AgentError::NotResumable {
            run_id: build.id.clone(),
            reason: "no edge URL after successful build".to_string(),
        })?;
        let suite = VerificationSuite::new(self.services.clone());
        let report = suite
            .run(
                &inventory,
                &edge_url,
                self.paths.build_screenshots_dir(&build.id),
            )
            .await;
        Ok(report)
    }

    /// Final report for the status and report endpoints.
    pub async fn report(&self, site_id: &str) -> AgentResult<Option<AgentReport>> {
        let Some(run) = self.store.latest_agent_run(site_id).await? else {
            return Ok(None);
        };
        let final_verdict = run
            .checkpoint
            .history
            .last()
            .and_then(|record| record.verdict)
            .map(|verdict| verdict.as_str().to_string())
            .unwrap_or_else(|| run.phase.as_str().to_string());
        Ok(Some(AgentReport {
            run_id: run.id.clone(),
            site_id: site_id.to_string(),
            final_verdict,
            total_iterations: run.iteration,
            tokens: run.checkpoint.tokens,
            history: run.checkpoint.history,
        }))
    }

    fn observe(&self, run: &AgentRun, event: &str, status: &str) {
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent {
                event,
                component: "agent.loop",
                site_id: Some(&run.site_id),
                run_id: Some(&run.id),
                status: Some(status),
                ..Default::default()
            },
        );
    }
}
