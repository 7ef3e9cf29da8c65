// internal component
pub const DARWIN_COMPONENT: &str = "darwin";
pub const DARWIN_VERSION: &str = "3.0";

// forced upgrade of the bookkeeping schema created by 1.1-era releases
pub const LEGACY_UPGRADE_FROM: &str = "1.1";
pub const LEGACY_UPGRADE_TO: &str = "3.0";
pub const LEGACY_UPGRADE_SCRIPT: &str = "upgrade_1.1_to_3.0.sql";

// resource naming
pub const CREATE_RESOURCE: &str = "create.sql";
pub const PATCH_PREFIX: &str = "patch_";
pub const GUESS_PREFIX: &str = "guess_";
pub const SQL_SUFFIX: &str = ".sql";
pub const PATH_SEPARATOR: char = '/';

// version tokens
pub const SNAPSHOT_MARKER: &str = "SNAPSHOT";
pub const VERSION_SEPARATORS: [char; 3] = ['.', '_', '-'];

// locking
pub const MIGRATION_LOCK_SUFFIX: &str = ":migration";
pub const MAX_LEASE_RETRIES: u32 = 10;
pub const RENEWAL_PERIOD_PERCENT: u32 = 70;
pub const DEFAULT_MAX_RENEWALS: u32 = 100;
pub const DEFAULT_LEASE_DURATION_MILLIS: u64 = 5 * 60 * 1000;
pub const DEFAULT_LOCK_WAIT_MILLIS: u64 = 1000;

pub const DARWIN_CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the lock guarding migration of `component`.
pub fn migration_lock_name(component: &str) -> String {
    format!("{}{}", component, MIGRATION_LOCK_SUFFIX)
}
