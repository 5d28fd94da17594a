mod error;
mod plans;
mod workspace;

pub use error::{WorkspaceError, WorkspaceResult};
pub use plans::{ChatPlanner, ExecuteOutcome, PlanOutput};
pub use workspace::{ApplyOutcome, EditError, FileEdit, LiveEditWorkspace};
