//! SQLite backed bookkeeping store and the bookkeeping schema scripts.
mod migration_store;

pub use migration_store::*;

use crate::common::{LEGACY_UPGRADE_SCRIPT, PATH_SEPARATOR};
use crate::resource::MemoryResourceProvider;

pub(crate) const CREATE_SCRIPT: &str = include_str!("scripts/create.sql");
const PATCH_3_0_SCRIPT: &str = include_str!("scripts/patch_3.0.sql");
const GUESS_1_0_SCRIPT: &str = include_str!("scripts/guess_1.0.sql");
const GUESS_1_1_SCRIPT: &str = include_str!("scripts/guess_1.1.sql");
const GUESS_3_0_SCRIPT: &str = include_str!("scripts/guess_3.0.sql");
const UPGRADE_1_1_SCRIPT: &str = include_str!("scripts/upgrade_1.1_to_3.0.sql");

/// Scripts migrating the bookkeeping tables themselves, under the `sqlite`
/// platform.
pub fn bookkeeping_resources() -> MemoryResourceProvider {
    let path = |name: &str| format!("sqlite{}{}", PATH_SEPARATOR, name);
    MemoryResourceProvider::new()
        .with(&path("create.sql"), CREATE_SCRIPT)
        .with(&path("patch_3.0.sql"), PATCH_3_0_SCRIPT)
        .with(&path("guess_1.0.sql"), GUESS_1_0_SCRIPT)
        .with(&path("guess_1.1.sql"), GUESS_1_1_SCRIPT)
        .with(&path("guess_3.0.sql"), GUESS_3_0_SCRIPT)
        .with(&path(LEGACY_UPGRADE_SCRIPT), UPGRADE_1_1_SCRIPT)
}
