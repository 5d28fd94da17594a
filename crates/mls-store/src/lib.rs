mod agents;
mod builds;
mod db;
mod error;
mod jobs;
mod locks;
mod records;
mod sites;

pub use db::Store;
pub use error::{StoreError, StoreResult};
pub use jobs::{JobKind, JobRecord, JobStatus};
pub use locks::SiteSlot;
