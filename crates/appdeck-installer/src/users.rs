use anyhow::{anyhow, Result};

use crate::registry::ApplicationRegistry;

// Configuration for per-application user-id separation. Every installed
// application gets its own uid out of [min_user_id, max_user_id] and shares
// one group, so applications cannot read each other's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdSeparation {
    pub min_user_id: u32,
    pub max_user_id: u32,
    pub common_group_id: u32,
}

impl UserIdSeparation {
    pub fn validate(&self) -> Result<()> {
        if self.min_user_id > self.max_user_id {
            return Err(anyhow!(
                "invalid user-id separation range {}..{}",
                self.min_user_id,
                self.max_user_id
            ));
        }
        Ok(())
    }
}

// Allocates the first uid in the range not claimed by any installed
// application. Uids are recorded in the installation reports, so a removed
// application automatically returns its uid to the pool.
pub(crate) fn find_unused_user_id(
    separation: &UserIdSeparation,
    registry: &dyn ApplicationRegistry,
) -> Result<u32> {
    let mut in_use: Vec<u32> = registry
        .applications()
        .iter()
        .filter_map(|record| record.report.as_ref().and_then(|report| report.user_id))
        .collect();
    in_use.sort_unstable();

    for candidate in separation.min_user_id..=separation.max_user_id {
        if !in_use.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(anyhow!(
        "no unused user-id left in the range {}..{}",
        separation.min_user_id,
        separation.max_user_id
    ))
}
