use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use mls_adapters::Services;
use mls_events::TopicPublisher;
use mls_settings::SettingsResolver;
use mls_store::Store;
use mls_types::{Build, BuildLogLine, BuildPhase, ProgressEvent, Site, SiteSettings};

use crate::error::{PipelineError, PipelineResult};
use crate::fetch::Fetcher;
use crate::paths::ArtifactPaths;

#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub crawl: Duration,
    pub images: Duration,
    pub css: Duration,
    pub js: Duration,
    pub html: Duration,
    pub fonts: Duration,
    pub deploy: Duration,
    pub measure: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            crawl: Duration::from_secs(30 * 60),
            images: Duration::from_secs(20 * 60),
            css: Duration::from_secs(10 * 60),
            js: Duration::from_secs(10 * 60),
            html: Duration::from_secs(5 * 60),
            fonts: Duration::from_secs(5 * 60),
            deploy: Duration::from_secs(15 * 60),
            measure: Duration::from_secs(10 * 60),
        }
    }
}

impl PhaseTimeouts {
    pub fn budget(&self, phase: BuildPhase) -> Duration {
        match phase {
            BuildPhase::Crawl => self.crawl,
            BuildPhase::Images => self.images,
            BuildPhase::Css => self.css,
            BuildPhase::Js => self.js,
            BuildPhase::Html => self.html,
            BuildPhase::Fonts => self.fonts,
            BuildPhase::Deploy => self.deploy,
            BuildPhase::Measure => self.measure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineLimits {
    /// Bounded pool for independent asset work inside a phase.
    pub asset_pool_size: usize,
    pub phase_timeouts: PhaseTimeouts,
    /// Successful builds whose artifacts the sweep keeps.
    pub keep_artifacts: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            asset_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            phase_timeouts: PhaseTimeouts::default(),
            keep_artifacts: 10,
        }
    }
}

/// Everything a phase needs, passed explicitly. The build struct is the
/// working copy; the engine persists counters after every phase.
pub struct BuildContext {
    pub build: Build,
    pub site: Site,
    pub settings: SiteSettings,
    pub resolver: SettingsResolver,
    pub services: Services,
    pub store: Arc<Store>,
    pub paths: ArtifactPaths,
    pub publisher: TopicPublisher,
    pub cancel: CancellationToken,
    pub limits: PipelineLimits,
    pub fetcher: Fetcher,
    log_buffer: Vec<BuildLogLine>,
}

impl BuildContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build: Build,
        site: Site,
        settings: SiteSettings,
        resolver: SettingsResolver,
        services: Services,
        store: Arc<Store>,
        paths: ArtifactPaths,
        publisher: TopicPublisher,
        cancel: CancellationToken,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            build,
            site,
            settings,
            resolver,
            services,
            store,
            paths,
            publisher,
            cancel,
            limits,
            fetcher: Fetcher::new(),
            log_buffer: Vec::new(),
        }
    }

    /// Cancellation checkpoint; called between phases and at every network
    /// boundary inside them.
    pub fn check_cancelled(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.publisher.publish(event);
    }

    pub fn step_start(&self, phase: BuildPhase, description: &str) {
        self.emit(ProgressEvent::step_start(phase.as_str(), description));
    }

    pub fn step_complete(&self, phase: BuildPhase, result: Value) {
        self.emit(ProgressEvent::step_complete(phase.as_str(), result));
    }

    /// One log line: published on the topic and buffered for the build row.
    pub fn log(&mut self, level: &str, message: impl Into<String>) {
        let message = message.into();
        self.publisher.log(level, message.clone());
        self.log_buffer.push(BuildLogLine {
            ts: Utc::now(),
            level: level.to_string(),
            message,
        });
    }

    pub async fn flush_logs(&mut self) -> PipelineResult<()> {
        if self.log_buffer.is_empty() {
            return Ok(());
        }
        let lines = std::mem::take(&mut self.log_buffer);
        self.store
            .append_build_log(&self.build.id, &lines)
            .await
            .map_err(|err| PipelineError::from_store(BuildPhase::Crawl, "log-flush", err))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.paths.build_output_dir(&self.build.id)
    }

    pub fn output_path(&self, relative: &str) -> PathBuf {
        self.output_dir().join(relative)
    }

    pub async fn read_output(&self, relative: &str, phase: BuildPhase) -> PipelineResult<String> {
        tokio::fs::read_to_string(self.output_path(relative))
            .await
            .map_err(|err| PipelineError::from_io(phase, relative, err))
    }

    pub async fn write_output(
        &self,
        relative: &str,
        contents: &[u8],
        phase: BuildPhase,
    ) -> PipelineResult<()> {
        let path = self.output_path(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| PipelineError::from_io(phase, relative, err))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|err| PipelineError::from_io(phase, relative, err))
    }
}
