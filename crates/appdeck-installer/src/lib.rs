mod fetch;
mod layout;
mod locations;
mod reconciler;
mod registry;
mod scheduler;
mod tasks;
mod users;

pub use layout::InstallerPaths;
pub use locations::{
    disk_usage, DiskUsage, InstallationLocation, LocationKind, LocationRegistry, MountTable,
};
pub use reconciler::Reconciler;
pub use registry::{ApplicationRecord, ApplicationRegistry, FileApplicationRegistry};
pub use scheduler::{EngineSettings, TaskEngine, TaskEvent};
pub use tasks::{TaskKind, TaskState, TaskStatus};
pub use users::UserIdSeparation;

#[cfg(test)]
mod tests;
