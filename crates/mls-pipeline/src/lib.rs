mod context;
mod engine;
mod error;
mod fetch;
mod handler;
mod paths;
mod phases;
mod state;

pub mod testing;

pub use context::{BuildContext, PhaseTimeouts, PipelineLimits};
pub use engine::PipelineEngine;
pub use error::{PipelineError, PipelineResult};
pub use fetch::{output_path_for, page_slug, resolve_url, same_origin, Fetcher};
pub use handler::BuildJobHandler;
pub use paths::{prune_build_artifacts, ArtifactPaths};
pub use phases::CrawlOutput;
pub use state::{can_transition, BuildStateMachine};
