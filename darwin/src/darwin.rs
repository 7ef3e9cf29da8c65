use crate::common::{
    migration_lock_name, DARWIN_COMPONENT, DARWIN_CRATE_VERSION, DARWIN_VERSION, LEGACY_UPGRADE_FROM,
    LEGACY_UPGRADE_SCRIPT, LEGACY_UPGRADE_TO, PATH_SEPARATOR,
};
use crate::darwin_builder::DarwinBuilder;
use crate::darwin_config::DarwinConfig;
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::executor::PatchExecutor;
use crate::lock::{CompletionFlag, LeaseOutcome, Locker};
use crate::patch::{Patch, PatchCatalog};
use crate::probe::VersionProbe;
use crate::resource::{classify_all, ClassifiedResource, ResourceProvider, ResourceRole};
use crate::store::sqlite::bookkeeping_resources;
use crate::store::{BookkeepingDetector, Database, MigrationStore, SqliteMigrationStore};
use crate::version::VersionDescriptor;
use chrono::{TimeDelta, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Brings the schema of registered components to the version the
/// application expects.
///
/// `Darwin` uses the PIMPL (Pointer to Implementation) design pattern: clones
/// are cheap and share the same database, lock and configuration.
///
/// Every migration of a component runs under the cluster wide lock
/// `"<component>:migration"`. A process that cannot get the lock after its
/// retries skips the migration, since another member is doing the same work.
/// Before any component is touched, Darwin migrates its own bookkeeping
/// tables the same way.
///
/// # Examples
///
/// ```rust,ignore
/// use darwin::darwin::Darwin;
/// use darwin::resource::DirectoryResourceProvider;
/// use std::sync::Arc;
///
/// let darwin = Darwin::builder()
///     .component("shop", Arc::new(DirectoryResourceProvider::new("db/shop")))
///     .open_path("shop.db")?;
///
/// darwin.migrate("shop", "2.1")?;
/// assert_eq!(darwin.version("shop")?.map(|v| v.to_string()), Some("2.1".into()));
/// ```
#[derive(Clone)]
pub struct Darwin {
    inner: Arc<DarwinInner>,
}

impl Darwin {
    /// Creates a new `DarwinBuilder` for configuring and opening Darwin.
    pub fn builder() -> DarwinBuilder {
        DarwinBuilder::new()
    }

    pub(crate) fn new(config: DarwinConfig, database: Option<Database>) -> Self {
        let engine = database.map(|database| MigrationEngine::new(database, &config));
        Darwin {
            inner: Arc::new(DarwinInner {
                config,
                engine,
                enabled: AtomicBool::new(false),
            }),
        }
    }

    /// Checks the database, creates the lock table and migrates the
    /// bookkeeping tables to their current version.
    ///
    /// Running it again is harmless.
    ///
    /// # Errors
    ///
    /// Returns a [`ErrorKind::ConnectivityError`] when the database does not
    /// answer, unless `skip_if_unavailable` is set, in which case Darwin
    /// disables itself instead.
    pub fn initialize(&self) -> DarwinResult<()> {
        self.inner.initialize()
    }

    /// Migrates a registered component to `version`.
    ///
    /// # Errors
    ///
    /// Returns error if the component is not registered, the version cannot be
    /// parsed, a script is malformed or a statement fails. Contention on the
    /// migration lock is not an error.
    pub fn migrate(&self, component: &str, version: &str) -> DarwinResult<()> {
        let provider = self.inner.config.component(component)?;
        self.inner.migrate(component, version, provider.as_ref())
    }

    /// Migrates `component` to `version` with the scripts of `provider`.
    pub fn migrate_with(&self, component: &str, version: &str, provider: &dyn ResourceProvider) -> DarwinResult<()> {
        self.inner.migrate(component, version, provider)
    }

    /// Recorded version of `component`.
    pub fn version(&self, component: &str) -> DarwinResult<Option<VersionDescriptor>> {
        match &self.inner.engine {
            Some(engine) => engine.store.get_version(component),
            None => Ok(None),
        }
    }

    /// `false` once Darwin has disabled itself for an unreachable database.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> DarwinConfig {
        self.inner.config.clone()
    }

    pub fn database(&self) -> Option<Database> {
        self.inner.engine.as_ref().map(|engine| engine.database.clone())
    }

    pub fn locker(&self) -> Option<Locker> {
        self.inner.engine.as_ref().map(|engine| engine.locker.clone())
    }
}

/// Collaborators sharing one database.
struct MigrationEngine {
    database: Database,
    store: Arc<dyn MigrationStore>,
    catalog: PatchCatalog,
    bookkeeping: BookkeepingDetector,
    probe: VersionProbe,
    executor: PatchExecutor,
    locker: Locker,
}

impl MigrationEngine {
    fn new(database: Database, config: &DarwinConfig) -> MigrationEngine {
        let store: Arc<dyn MigrationStore> = Arc::new(SqliteMigrationStore::new(database.clone()));
        let catalog = PatchCatalog::new(store.clone());
        let bookkeeping = BookkeepingDetector::new(store.clone());
        let probe = VersionProbe::new(
            database.clone(),
            store.clone(),
            catalog.clone(),
            bookkeeping.clone(),
        );
        let executor = PatchExecutor::new(
            database.clone(),
            store.clone(),
            bookkeeping.clone(),
            config.transactional(),
        );
        let locker = Locker::with_max_renewals(database.clone(), config.max_renewals());

        MigrationEngine {
            database,
            store,
            catalog,
            bookkeeping,
            probe,
            executor,
            locker,
        }
    }

    fn platform(&self) -> &str {
        self.database.dialect().platform()
    }

    fn patches(&self, resources: &[ClassifiedResource], component: &str, role: ResourceRole) -> DarwinResult<Vec<Patch>> {
        let bookkeeping = self.bookkeeping.exists()?;
        self.catalog
            .patches(resources, component, self.platform(), role, bookkeeping)
    }

    // records a patch as finished without running it
    fn record_finished(&self, patch: &Patch) -> DarwinResult<()> {
        self.database.in_transaction(|_| {
            let mut persisted = self.store.insert_or_fetch_patch(patch)?;
            if !persisted.is_finished() {
                persisted.finish(0, Utc::now());
                self.store.mark_patch_finished(&persisted)?;
                log::debug!("Recorded patch {} as finished", persisted);
            }
            Ok(())
        })
    }

    fn is_applied(&self, patch: &Patch, current: Option<&VersionDescriptor>) -> DarwinResult<bool> {
        if self.bookkeeping.exists()? {
            let recorded = self
                .store
                .find_patch(patch.name(), patch.component(), patch.platform())?;
            return Ok(recorded.is_some_and(|p| p.is_finished()));
        }

        // without patch history the version is all we know
        Ok(match (patch.version(), current) {
            (Some(version), Some(current)) => version <= current,
            _ => false,
        })
    }
}

struct DarwinInner {
    config: DarwinConfig,
    /// `None` when the database could not be opened
    engine: Option<MigrationEngine>,
    enabled: AtomicBool,
}

impl DarwinInner {
    fn initialize(&self) -> DarwinResult<()> {
        self.config.mark_configured();

        let Some(engine) = &self.engine else {
            log::warn!("No database available, migrations are disabled");
            self.enabled.store(false, Ordering::Relaxed);
            return Ok(());
        };

        let platform = match engine.database.platform() {
            Ok(platform) => platform,
            Err(e) if self.config.skip_if_unavailable() => {
                log::warn!("Database unavailable, migrations are disabled: {}", e);
                self.enabled.store(false, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        engine.locker.initialize()?;
        let target = VersionDescriptor::parse(DARWIN_VERSION)?;
        self.migrate_component(engine, DARWIN_COMPONENT, &target, &bookkeeping_resources())?;

        self.enabled.store(true, Ordering::Relaxed);
        log::info!("Darwin {} initialized on {}", DARWIN_CRATE_VERSION, platform);
        Ok(())
    }

    fn migrate(&self, component: &str, version: &str, provider: &dyn ResourceProvider) -> DarwinResult<()> {
        if component.trim().is_empty() {
            log::error!("Component name cannot be empty");
            return Err(DarwinError::new(
                "Component name cannot be empty",
                ErrorKind::PatchFormat,
            ));
        }
        if component == DARWIN_COMPONENT {
            log::error!("Component {} is migrated by Darwin itself", DARWIN_COMPONENT);
            return Err(DarwinError::new(
                &format!("Component {} is migrated by Darwin itself", DARWIN_COMPONENT),
                ErrorKind::InvalidOperation,
            ));
        }
        let target = VersionDescriptor::parse(version)?;

        match &self.engine {
            Some(engine) if self.enabled.load(Ordering::Relaxed) => {
                self.migrate_component(engine, component, &target, provider)
            }
            _ => {
                log::info!("Migrations disabled, not migrating {} to {}", component, target);
                Ok(())
            }
        }
    }

    fn migrate_component(
        &self,
        engine: &MigrationEngine,
        component: &str,
        target: &VersionDescriptor,
        provider: &dyn ResourceProvider,
    ) -> DarwinResult<()> {
        let process = migration_lock_name(component);
        let lease = TimeDelta::from_std(self.config.lease_duration()).map_err(|e| {
            DarwinError::new(
                &format!("Lease duration out of range: {}", e),
                ErrorKind::InvalidOperation,
            )
        })?;

        let flag = CompletionFlag::new();
        let outcome = engine.locker.lease_with_restorer(
            &process,
            Utc::now() + lease,
            self.config.lock_wait(),
            Arc::new(flag.clone()),
        )?;
        let LeaseOutcome::Acquired(key) = outcome else {
            log::info!("Lock {} is held by another process, skipping migration of {}", process, component);
            return Ok(());
        };

        let result = self.migrate_locked(engine, component, target, provider);
        flag.finish();

        let released = engine.locker.release(&process, &key);
        if let Err(e) = &released {
            log::error!("Failed to release lock {}: {}", process, e);
        }
        result?;
        released
    }

    fn migrate_locked(
        &self,
        engine: &MigrationEngine,
        component: &str,
        target: &VersionDescriptor,
        provider: &dyn ResourceProvider,
    ) -> DarwinResult<()> {
        let resources = classify_all(&provider.list_sorted(engine.platform())?)?;
        log::info!("Migrating component {} to version {}", component, target);

        let mut stored = engine.store.get_version(component)?;
        if stored.is_none() {
            stored = engine.probe.guess_version(component, provider)?;
            match &stored {
                Some(guessed) => engine.store.update_version(component, guessed)?,
                None => stored = self.create(engine, &resources, component, target, provider)?,
            }
        }

        if component == DARWIN_COMPONENT {
            stored = self.upgrade_legacy_bookkeeping(engine, provider, stored)?;
        }

        let evolves = engine.patches(&resources, component, ResourceRole::Evolve)?;
        if let Some(version) = &stored {
            if engine.bookkeeping.exists()? {
                self.backfill(engine, &resources, &evolves, component, version)?;
            }
        }

        self.evolve(engine, provider, &evolves, component, target, stored)
    }

    // runs the create script; the schema it builds is the one of `target`
    fn create(
        &self,
        engine: &MigrationEngine,
        resources: &[ClassifiedResource],
        component: &str,
        target: &VersionDescriptor,
        provider: &dyn ResourceProvider,
    ) -> DarwinResult<Option<VersionDescriptor>> {
        let creates = engine.patches(resources, component, ResourceRole::Create)?;
        if creates.is_empty() {
            log::info!("No create script for component {}, building it from its patches", component);
            return Ok(None);
        }

        for patch in &creates {
            engine.executor.execute(provider, &patch.resource_path(), component)?;
        }
        engine.store.update_version(component, target)?;

        if engine.bookkeeping.exists()? {
            for patch in engine.patches(resources, component, ResourceRole::Evolve)? {
                if patch.version().is_some_and(|version| version <= target) {
                    engine.record_finished(&patch)?;
                }
            }
        }

        log::info!("Created component {} at version {}", component, target);
        Ok(Some(target.clone()))
    }

    fn upgrade_legacy_bookkeeping(
        &self,
        engine: &MigrationEngine,
        provider: &dyn ResourceProvider,
        stored: Option<VersionDescriptor>,
    ) -> DarwinResult<Option<VersionDescriptor>> {
        let from = VersionDescriptor::parse(LEGACY_UPGRADE_FROM)?;
        let to = VersionDescriptor::parse(LEGACY_UPGRADE_TO)?;

        match stored {
            Some(version) if version >= from && version < to => {
                log::info!("Rebuilding bookkeeping tables of version {} as {}", version, to);
                let path = format!("{}{}{}", engine.platform(), PATH_SEPARATOR, LEGACY_UPGRADE_SCRIPT);
                engine.executor.execute_then(provider, &path, DARWIN_COMPONENT, |_| {
                    engine.store.update_version(DARWIN_COMPONENT, &to)
                })?;
                Ok(Some(to))
            }
            other => Ok(other),
        }
    }

    // reconstructs patch history of components recorded before patches were
    // tracked
    fn backfill(
        &self,
        engine: &MigrationEngine,
        resources: &[ClassifiedResource],
        evolves: &[Patch],
        component: &str,
        stored: &VersionDescriptor,
    ) -> DarwinResult<()> {
        let creates = engine.patches(resources, component, ResourceRole::Create)?;

        if engine.store.has_any_patch(component)? {
            for patch in &creates {
                if !engine.store.is_patch_recorded(patch.name(), component)? {
                    engine.record_finished(patch)?;
                }
            }
            return Ok(());
        }

        log::info!("Backfilling patch history of component {} up to version {}", component, stored);
        let applied = evolves
            .iter()
            .filter(|patch| patch.version().is_some_and(|version| version <= stored));
        for patch in creates.iter().chain(applied) {
            engine.record_finished(patch)?;
        }
        Ok(())
    }

    fn evolve(
        &self,
        engine: &MigrationEngine,
        provider: &dyn ResourceProvider,
        evolves: &[Patch],
        component: &str,
        target: &VersionDescriptor,
        mut current: Option<VersionDescriptor>,
    ) -> DarwinResult<()> {
        for patch in evolves {
            let Some(version) = patch.version() else {
                continue;
            };
            if version > target || engine.is_applied(patch, current.as_ref())? {
                continue;
            }

            // out of order patches leave the version alone
            let newer = match &current {
                Some(current) => version > current,
                None => true,
            };
            // the version moves in the same transaction as the patch
            let advance = || {
                if newer {
                    engine.store.update_version(component, version)
                } else {
                    Ok(())
                }
            };

            if engine.probe.guess_patch_already_applied(component, provider, version)? {
                log::info!("Patch {} is already in effect, recording it without running", patch);
                let bookkeeping = engine.bookkeeping.exists()?;
                engine.database.in_transaction(|_| {
                    if bookkeeping {
                        engine.record_finished(patch)?;
                    }
                    advance()
                })?;
            } else {
                engine
                    .executor
                    .execute_then(provider, &patch.resource_path(), component, |_| advance())?;
            }

            if newer {
                current = Some(version.clone());
            }
        }

        match &current {
            Some(version) => log::info!("Component {} is at version {}", component, version),
            None => log::warn!("Component {} has no version, nothing to create it from", component),
        }
        Ok(())
    }
}
