use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use mls_adapters::Services;
use mls_agent::{AgentConfig, AgentJobHandler, AgentLoop};
use mls_events::EventBus;
use mls_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use mls_pipeline::{ArtifactPaths, BuildJobHandler, PipelineEngine, PipelineLimits};
use mls_queue::{CancellationRegistry, JobKind, JobQueue, QueueConfig, WorkerPool};
use mls_server::{serve, AppState};
use mls_settings::SettingsResolver;
use mls_store::Store;

mod config;

use config::EngineConfig;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "mls-engine")]
#[command(about = "WordPress-to-static optimization engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server and worker pool.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
        #[arg(long, env = "MLS_DATA_ROOT")]
        data_root: Option<String>,
    },
    /// Validate configuration and exit.
    Check {
        #[arg(long, env = "MLS_DATA_ROOT")]
        data_root: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            data_root,
        } => {
            let data_root = resolve_data_root(data_root);
            let (_guard, log_info) = init_process_logging(
                ProcessKind::Engine,
                &canonical_logs_dir_from_root(&data_root),
                LOG_RETENTION_DAYS,
            )?;
            info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let config = EngineConfig::load(&data_root).context("configuration error")?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let shutdown = CancellationToken::new();
            let state = build_state(&data_root, &config, shutdown.clone()).await?;
            log_startup_paths(&data_root, &addr);
            let result = serve(addr, state).await;
            shutdown.cancel();
            result?;
        }
        Command::Check { data_root } => {
            let data_root = resolve_data_root(data_root);
            let config = EngineConfig::load(&data_root).context("configuration error")?;
            println!(
                "configuration ok: {} workers, oracle model {}",
                config.workers, config.oracle_model
            );
        }
    }

    Ok(())
}

fn resolve_data_root(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".mls")
}

fn log_startup_paths(data_root: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting mls-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} data_root={} config={}",
        exe.display(),
        cwd.display(),
        data_root.display(),
        data_root.join("config.json").display()
    );
}

async fn build_state(
    data_root: &PathBuf,
    config: &EngineConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<AppState> {
    let store = Arc::new(Store::open(&data_root.join("mls.db")).await?);
    let events = EventBus::new();
    let resolver = SettingsResolver::new(store.clone());
    let services = Services::from_config(&config.adapter_config());
    let paths = ArtifactPaths::new(data_root.clone());
    let queue = JobQueue::new(store.clone(), QueueConfig::default());
    let cancellations = CancellationRegistry::new();

    let limits = PipelineLimits {
        keep_artifacts: config.keep_artifacts,
        ..PipelineLimits::default()
    };
    let engine = PipelineEngine::new(
        store.clone(),
        resolver.clone(),
        services.clone(),
        events.clone(),
        paths.clone(),
        limits,
    );
    let agent = AgentLoop::new(
        store.clone(),
        queue.clone(),
        resolver.clone(),
        services.clone(),
        events.clone(),
        paths.clone(),
        AgentConfig::default(),
    );

    let mut pool = WorkerPool::new(queue.clone(), cancellations.clone());
    pool.register(
        JobKind::Build,
        Arc::new(BuildJobHandler::new(engine, queue.clone())),
    );
    pool.register(
        JobKind::Agent,
        Arc::new(AgentJobHandler::new(agent.clone(), queue.clone())),
    );
    let workers = pool.spawn(config.workers, shutdown);
    info!(count = workers.len(), "worker pool started");

    Ok(AppState::new(
        store,
        events,
        queue,
        resolver,
        services,
        paths,
        agent,
        cancellations,
        config.api_key.clone(),
    ))
}
