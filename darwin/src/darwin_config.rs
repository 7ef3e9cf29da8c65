//! Configuration management for Darwin.

use crate::common::{
    DARWIN_COMPONENT, DEFAULT_LEASE_DURATION_MILLIS, DEFAULT_LOCK_WAIT_MILLIS, DEFAULT_MAX_RENEWALS,
};
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::resource::ResourceProvider;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Public interface for Darwin configuration.
///
/// Settings can be changed until the configuration is handed to a running
/// [`crate::darwin::Darwin`]; after that every setter fails with
/// [`ErrorKind::InvalidOperation`].
///
/// # Examples
///
/// ```rust,ignore
/// use darwin::darwin_config::DarwinConfig;
/// use std::time::Duration;
///
/// let config = DarwinConfig::new();
/// config.set_lease_duration(Duration::from_secs(60))?;
/// config.set_transactional(false)?;
/// ```
#[derive(Clone)]
pub struct DarwinConfig {
    /// The pointer to implementation. Uses Arc for cheap cloning and thread safety.
    inner: Arc<DarwinConfigInner>,
}

impl Default for DarwinConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DarwinConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        DarwinConfig {
            inner: Arc::new(DarwinConfigInner::new()),
        }
    }

    /// How long a migration lease lasts before it must be renewed.
    pub fn lease_duration(&self) -> Duration {
        *self.inner.lease_duration.read()
    }

    /// Sets the lease duration.
    ///
    /// # Errors
    ///
    /// Returns error if already initialized or if the duration is zero.
    pub fn set_lease_duration(&self, duration: Duration) -> DarwinResult<()> {
        self.inner.check_not_configured("lease duration")?;
        if duration.is_zero() {
            log::error!("Lease duration cannot be zero");
            return Err(DarwinError::new(
                "Lease duration cannot be zero",
                ErrorKind::InvalidOperation,
            ));
        }
        *self.inner.lease_duration.write() = duration;
        Ok(())
    }

    /// Pause between two attempts to lease a busy migration lock.
    pub fn lock_wait(&self) -> Duration {
        *self.inner.lock_wait.read()
    }

    pub fn set_lock_wait(&self, wait: Duration) -> DarwinResult<()> {
        self.inner.check_not_configured("lock wait")?;
        *self.inner.lock_wait.write() = wait;
        Ok(())
    }

    /// Upper bound of automatic renewals of one migration lease.
    pub fn max_renewals(&self) -> u32 {
        self.inner.max_renewals.load(Ordering::Relaxed)
    }

    pub fn set_max_renewals(&self, max_renewals: u32) -> DarwinResult<()> {
        self.inner.check_not_configured("maximum renewals")?;
        self.inner.max_renewals.store(max_renewals, Ordering::Relaxed);
        Ok(())
    }

    /// Whether each patch runs inside one transaction.
    pub fn transactional(&self) -> bool {
        self.inner.transactional.load(Ordering::Relaxed)
    }

    /// Turns per-patch transactions on or off. Without them every statement
    /// commits as it runs.
    pub fn set_transactional(&self, transactional: bool) -> DarwinResult<()> {
        self.inner.check_not_configured("transactional mode")?;
        self.inner.transactional.store(transactional, Ordering::Relaxed);
        Ok(())
    }

    /// Whether an unreachable database disables Darwin instead of failing.
    pub fn skip_if_unavailable(&self) -> bool {
        self.inner.skip_if_unavailable.load(Ordering::Relaxed)
    }

    pub fn set_skip_if_unavailable(&self, skip: bool) -> DarwinResult<()> {
        self.inner.check_not_configured("skip if unavailable")?;
        self.inner.skip_if_unavailable.store(skip, Ordering::Relaxed);
        Ok(())
    }

    /// Registers the scripts of `component`.
    ///
    /// # Errors
    ///
    /// Returns error if already initialized, if the name is empty, or if it is
    /// the name of Darwin's own bookkeeping component.
    pub fn add_component(&self, component: &str, provider: Arc<dyn ResourceProvider>) -> DarwinResult<()> {
        self.inner.check_not_configured("components")?;
        if component.trim().is_empty() {
            log::error!("Component name cannot be empty");
            return Err(DarwinError::new(
                "Component name cannot be empty",
                ErrorKind::PatchFormat,
            ));
        }
        if component == DARWIN_COMPONENT {
            log::error!("Component name {} is reserved", DARWIN_COMPONENT);
            return Err(DarwinError::new(
                &format!("Component name {} is reserved", DARWIN_COMPONENT),
                ErrorKind::InvalidOperation,
            ));
        }
        self.inner.components.insert(component.to_string(), provider);
        Ok(())
    }

    /// Resource provider registered for `component`.
    ///
    /// # Errors
    ///
    /// Returns error if no provider is registered for the component.
    pub fn component(&self, component: &str) -> DarwinResult<Arc<dyn ResourceProvider>> {
        match self.inner.components.get(component) {
            Some(provider) => Ok(provider.value().clone()),
            None => {
                log::error!("No resources registered for component {}", component);
                Err(DarwinError::new(
                    &format!("No resources registered for component {}", component),
                    ErrorKind::NotFound,
                ))
            }
        }
    }

    /// Names of all registered components.
    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.components.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn mark_configured(&self) {
        self.inner.configured.store(true, Ordering::Relaxed);
    }
}

/// Private implementation of Darwin configuration.
struct DarwinConfigInner {
    /// Set once a running Darwin owns this configuration
    configured: AtomicBool,
    lease_duration: RwLock<Duration>,
    lock_wait: RwLock<Duration>,
    max_renewals: AtomicU32,
    transactional: AtomicBool,
    skip_if_unavailable: AtomicBool,
    /// Resource providers by component name
    components: DashMap<String, Arc<dyn ResourceProvider>>,
}

impl DarwinConfigInner {
    fn new() -> Self {
        DarwinConfigInner {
            configured: AtomicBool::from(false),
            lease_duration: RwLock::new(Duration::from_millis(DEFAULT_LEASE_DURATION_MILLIS)),
            lock_wait: RwLock::new(Duration::from_millis(DEFAULT_LOCK_WAIT_MILLIS)),
            max_renewals: AtomicU32::from(DEFAULT_MAX_RENEWALS),
            transactional: AtomicBool::from(true),
            skip_if_unavailable: AtomicBool::from(false),
            components: DashMap::new(),
        }
    }

    fn check_not_configured(&self, setting: &str) -> DarwinResult<()> {
        if self.configured.load(Ordering::Relaxed) {
            log::error!("{} cannot be changed after initialization", setting);
            return Err(DarwinError::new(
                &format!("{} cannot be changed after initialization", setting),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }
}
