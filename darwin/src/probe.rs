use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::patch::{Patch, PatchCatalog};
use crate::resource::{classify_all, ResourceProvider, ResourceRole};
use crate::store::{BookkeepingDetector, Database, MigrationStore};
use crate::version::VersionDescriptor;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, LazyLock};

static ASSERTION_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*select\s+count\s*\("));

/// Detects the schema version of a component whose version was never
/// recorded, by running its guess scripts.
///
/// In a guess script every `select count(...)` statement is an assertion: a
/// zero count means the schema is not at the guessed version. Other
/// statements run for their side effects. A database error means the guess
/// failed, never that the migration failed.
#[derive(Clone)]
pub struct VersionProbe {
    database: Database,
    store: Arc<dyn MigrationStore>,
    catalog: PatchCatalog,
    bookkeeping: BookkeepingDetector,
}

impl VersionProbe {
    pub fn new(
        database: Database,
        store: Arc<dyn MigrationStore>,
        catalog: PatchCatalog,
        bookkeeping: BookkeepingDetector,
    ) -> VersionProbe {
        VersionProbe {
            database,
            store,
            catalog,
            bookkeeping,
        }
    }

    /// Runs the guess scripts in ascending version order and returns the
    /// highest version whose script, and every script before it, succeeded.
    pub fn guess_version(
        &self,
        component: &str,
        provider: &dyn ResourceProvider,
    ) -> DarwinResult<Option<VersionDescriptor>> {
        let mut best_guess = None;
        for patch in self.guess_patches(component, provider)? {
            if !self.run_guess(&patch, provider)? {
                break;
            }
            self.record_guess(&patch)?;
            best_guess = patch.version().cloned();
        }

        match &best_guess {
            Some(version) => log::info!("Guessed version {} for component {}", version, component),
            None => log::debug!("No guess script matched component {}", component),
        }
        Ok(best_guess)
    }

    /// Runs only the guess script for `target` and tells whether the schema
    /// already is at that version. `false` when no such script exists.
    pub fn guess_patch_already_applied(
        &self,
        component: &str,
        provider: &dyn ResourceProvider,
        target: &VersionDescriptor,
    ) -> DarwinResult<bool> {
        let guess = self
            .guess_patches(component, provider)?
            .into_iter()
            .find(|patch| patch.version() == Some(target));

        let Some(patch) = guess else {
            return Ok(false);
        };

        let applied = self.run_guess(&patch, provider)?;
        if applied {
            log::info!("Component {} already at version {}", component, target);
            self.record_guess(&patch)?;
        }
        Ok(applied)
    }

    /// Whether the patch and statement bookkeeping tables exist.
    pub fn exist_patch_and_sql_table(&self) -> DarwinResult<bool> {
        self.bookkeeping.exists()
    }

    fn guess_patches(&self, component: &str, provider: &dyn ResourceProvider) -> DarwinResult<Vec<Patch>> {
        let platform = self.database.dialect().platform();
        let resources = classify_all(&provider.list_sorted(platform)?)?;
        self.catalog
            .patches(&resources, component, platform, ResourceRole::Guess, false)
    }

    fn run_guess(&self, patch: &Patch, provider: &dyn ResourceProvider) -> DarwinResult<bool> {
        let assertion = ASSERTION_PATTERN.as_ref().map_err(|e| {
            DarwinError::new(
                &format!("Invalid assertion pattern: {}", e),
                ErrorKind::InternalError,
            )
        })?;

        for statement in provider.tokenize(&patch.resource_path())? {
            if assertion.is_match(&statement) {
                match self.database.query_count(&statement) {
                    Ok(0) => {
                        log::debug!("Guess {} failed assertion: {}", patch, statement);
                        return Ok(false);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Guess {} failed on {}: {}", patch, statement, e);
                        return Ok(false);
                    }
                }
            } else if let Err(e) = self.database.execute(&statement) {
                log::debug!("Guess {} failed on {}: {}", patch, statement, e);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record_guess(&self, patch: &Patch) -> DarwinResult<()> {
        if !self.bookkeeping.exists()? {
            return Ok(());
        }
        let mut persisted = self.store.insert_or_fetch_patch(patch)?;
        persisted.finish(0, Utc::now());
        self.store.mark_patch_finished(&persisted)
    }
}
