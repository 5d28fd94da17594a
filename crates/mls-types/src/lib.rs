mod agent;
mod build;
mod events;
mod inventory;
mod measurement;
mod oracle;
mod records;
mod settings;
mod site;
mod verification;

pub use agent::*;
pub use build::*;
pub use events::*;
pub use inventory::*;
pub use measurement::*;
pub use oracle::*;
pub use records::*;
pub use settings::*;
pub use site::*;
pub use verification::*;

use uuid::Uuid;

/// Generates a prefixed opaque id, e.g. `site_9f2c…`.
pub fn prefixed_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn site_id() -> String {
    prefixed_id("site")
}

pub fn build_id() -> String {
    prefixed_id("build")
}

pub fn run_id() -> String {
    prefixed_id("run")
}

pub fn job_id() -> String {
    prefixed_id("job")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_carry_their_prefix() {
        assert!(site_id().starts_with("site_"));
        assert!(build_id().starts_with("build_"));
        let a = job_id();
        let b = job_id();
        assert_ne!(a, b);
    }
}
