mod error;
mod metadata;
mod report;
mod validators;

pub use error::{ErrorCode, TaskError};
pub use metadata::{is_valid_application_id, PackageHeader};
pub use report::InstallationReport;
pub use validators::{compare_versions, validate_dns_name};

#[cfg(test)]
mod tests;
