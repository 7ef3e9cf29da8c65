use crate::errors::DarwinResult;
use crate::patch::{Patch, StatementRecord, StatementStatus};
use crate::version::VersionDescriptor;

/// Persistence of migration bookkeeping: component versions, applied patches
/// and the statements of each patch.
pub trait MigrationStore: Send + Sync {
    /// Recorded version of `component`, `None` if it was never recorded or
    /// the bookkeeping tables do not exist yet.
    fn get_version(&self, component: &str) -> DarwinResult<Option<VersionDescriptor>>;

    fn update_version(&self, component: &str, version: &VersionDescriptor) -> DarwinResult<()>;

    /// Returns the persisted twin of `patch`, inserting it when missing.
    ///
    /// A concurrent insert of the same patch collapses to a fetch; a missing
    /// component row is created before retrying.
    fn insert_or_fetch_patch(&self, patch: &Patch) -> DarwinResult<Patch>;

    fn find_patch(&self, name: &str, component: &str, platform: &str) -> DarwinResult<Option<Patch>>;

    /// Records `patch` as finished. Virtual patches are ignored.
    fn mark_patch_finished(&self, patch: &Patch) -> DarwinResult<()>;

    fn is_patch_finished(&self, patch: &Patch) -> DarwinResult<bool>;

    /// Whether `component` has a recorded create or evolve patch. Guess
    /// patches do not count.
    fn has_any_patch(&self, component: &str) -> DarwinResult<bool>;

    fn is_patch_recorded(&self, name: &str, component: &str) -> DarwinResult<bool>;

    /// Writes `record`, replacing an earlier row of the same statement.
    fn insert_statement(&self, record: &StatementRecord) -> DarwinResult<()>;

    /// Updates the row of `record`, writing it when it does not exist.
    fn update_statement(&self, record: &StatementRecord) -> DarwinResult<()>;

    fn statement_status(&self, patch_id: i64, hash: &str, occurrence: u32) -> DarwinResult<StatementStatus>;

    /// Uncached check that the patch and statement tables exist.
    fn bookkeeping_tables_exist(&self) -> DarwinResult<bool>;
}
