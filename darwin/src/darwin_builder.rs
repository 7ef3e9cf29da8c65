use crate::darwin::Darwin;
use crate::darwin_config::DarwinConfig;
use crate::errors::{DarwinError, DarwinResult};
use crate::resource::ResourceProvider;
use crate::store::Database;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating and configuring a [`Darwin`] instance.
///
/// `DarwinBuilder` provides a fluent API for configuring migration options.
/// Configuration errors are captured and returned when the instance is opened.
///
/// # Examples
///
/// ```rust,ignore
/// use darwin::darwin_builder::DarwinBuilder;
/// use darwin::resource::DirectoryResourceProvider;
/// use std::sync::Arc;
///
/// let darwin = DarwinBuilder::new()
///     .component("shop", Arc::new(DirectoryResourceProvider::new("db/shop")))
///     .lease_duration(Duration::from_secs(60))
///     .open_path("shop.db")?;
/// darwin.migrate("shop", "2.1")?;
/// ```
#[derive(Default)]
pub struct DarwinBuilder {
    error: Option<DarwinError>,
    config: DarwinConfig,
}

impl DarwinBuilder {
    /// Creates a new `DarwinBuilder` with default configuration.
    ///
    /// Defaults: five minute leases, one second between lease attempts,
    /// transactional patches, and failing on an unreachable database.
    pub fn new() -> Self {
        DarwinBuilder {
            error: None,
            config: DarwinConfig::new(),
        }
    }

    fn apply<F>(mut self, setter: F) -> Self
    where
        F: FnOnce(&DarwinConfig) -> DarwinResult<()>,
    {
        if self.error.is_none() {
            if let Err(e) = setter(&self.config) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Registers the scripts of a component.
    pub fn component(self, name: &str, provider: Arc<dyn ResourceProvider>) -> Self {
        self.apply(|config| config.add_component(name, provider))
    }

    /// Sets how long a migration lease lasts before it must be renewed.
    pub fn lease_duration(self, duration: Duration) -> Self {
        self.apply(|config| config.set_lease_duration(duration))
    }

    /// Sets the pause between attempts to lease a busy migration lock.
    pub fn lock_wait(self, wait: Duration) -> Self {
        self.apply(|config| config.set_lock_wait(wait))
    }

    pub fn max_renewals(self, max_renewals: u32) -> Self {
        self.apply(|config| config.set_max_renewals(max_renewals))
    }

    /// Runs each patch in one transaction (default) or statement by statement
    /// in autocommit mode.
    pub fn transactional(self, transactional: bool) -> Self {
        self.apply(|config| config.set_transactional(transactional))
    }

    /// Disables migration for the run instead of failing when the database
    /// cannot be reached.
    pub fn skip_if_unavailable(self, skip: bool) -> Self {
        self.apply(|config| config.set_skip_if_unavailable(skip))
    }

    /// Creates a Darwin instance on an open database and migrates the
    /// bookkeeping schema.
    pub fn open(self, database: Database) -> DarwinResult<Darwin> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let darwin = Darwin::new(self.config, Some(database));
        darwin.initialize()?;
        Ok(darwin)
    }

    /// Like [`DarwinBuilder::open`], opening the SQLite file at `path`.
    ///
    /// With `skip_if_unavailable` set, a database that cannot be opened yields
    /// a disabled instance whose migrations do nothing.
    pub fn open_path<P: AsRef<Path>>(self, path: P) -> DarwinResult<Darwin> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let database = match Database::open(path.as_ref()) {
            Ok(database) => Some(database),
            Err(e) if self.config.skip_if_unavailable() => {
                log::warn!("Database {:?} unavailable, migrations disabled: {}", path.as_ref(), e);
                None
            }
            Err(e) => return Err(e),
        };

        let darwin = Darwin::new(self.config, database);
        darwin.initialize()?;
        Ok(darwin)
    }
}
