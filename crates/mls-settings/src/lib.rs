mod diff;
mod error;
mod globs;
mod merge;
mod resolver;

pub use diff::overridden_leaves;
pub use error::SettingsError;
pub use globs::{compile_glob, glob_matches};
pub use merge::{deep_merge, merged};
pub use resolver::{enforce_page_builder_floor, SettingsResolver};
