use crate::common::{
    from_millis, to_millis, Scheduler, DEFAULT_MAX_RENEWALS, MAX_LEASE_RETRIES, RENEWAL_PERIOD_PERCENT,
};
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::lock::renewal::RenewalRegistry;
use crate::lock::{LeaseOutcome, LockRestorer, LockState};
use crate::store::Database;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Cluster wide lock made of lease rows in the `darwin_lock` table.
///
/// A lease is held until its expiry; a holder that crashes simply stops
/// renewing and the next process reclaims the expired row. Every timestamp is
/// shifted onto the database clock first, so members with skewed clocks agree
/// on expiry.
///
/// Background renewals run on a connection of their own, so a long statement
/// on the main connection does not hold them up. SQLite still admits one
/// writer at a time: a renewal due while another connection has a patch
/// transaction open waits for its commit, up to the busy timeout. Leases
/// should therefore outlast the longest single patch.
///
/// Clones share the same renewal registry and timer thread.
#[derive(Clone)]
pub struct Locker {
    inner: Arc<LockerInner>,
}

impl Locker {
    pub fn new(database: Database) -> Locker {
        Self::with_max_renewals(database, DEFAULT_MAX_RENEWALS)
    }

    /// Creates a locker whose auto-renewals stop after `max_renewals` renewals.
    pub fn with_max_renewals(database: Database, max_renewals: u32) -> Locker {
        let renewal_database = database.open_sibling().unwrap_or_else(|e| {
            log::warn!("Lease renewals share the main connection: {}", e);
            database.clone()
        });
        Locker {
            inner: Arc::new(LockerInner {
                database,
                renewal_database,
                scheduler: Scheduler::new(),
                renewals: RenewalRegistry::default(),
                max_renewals,
            }),
        }
    }

    /// Creates the lock table when missing.
    pub fn initialize(&self) -> DarwinResult<()> {
        self.inner.initialize()
    }

    pub fn state(&self, process: &str) -> DarwinResult<LockState> {
        let db_now = self.inner.database.current_time()?;
        self.inner.state_at(process, db_now)
    }

    /// Hint only: another process may take the lease right after this returns.
    pub fn can_lease(&self, process: &str) -> DarwinResult<bool> {
        Ok(self.state(process)? != LockState::Leased)
    }

    /// Single attempt to lease `process` until `until`.
    pub fn lease(&self, process: &str, until: DateTime<Utc>) -> DarwinResult<LeaseOutcome> {
        self.inner.lease(process, until)
    }

    /// Attempts the lease, retrying up to ten times with `wait` in between.
    pub fn lease_with_wait(&self, process: &str, until: DateTime<Utc>, wait: Duration) -> DarwinResult<LeaseOutcome> {
        self.inner.lease_with_wait(process, until, wait)
    }

    /// Like [`Locker::lease_with_wait`], and keeps renewing the lease in the
    /// background until `restorer` reports the work finished, the lease is
    /// released, or the renewal limit is reached.
    ///
    /// The first renewal happens after 70% of the lease duration.
    pub fn lease_with_restorer(
        &self,
        process: &str,
        until: DateTime<Utc>,
        wait: Duration,
        restorer: Arc<dyn LockRestorer>,
    ) -> DarwinResult<LeaseOutcome> {
        let duration = until - Utc::now();
        let outcome = self.inner.lease_with_wait(process, until, wait)?;

        if let LeaseOutcome::Acquired(key) = &outcome {
            self.schedule_renewal(process, key, duration, restorer)?;
            log::debug!("Lock {} leased with auto-renewal every {}% of {}", process, RENEWAL_PERIOD_PERCENT, duration);
        }
        Ok(outcome)
    }

    pub fn renew(&self, process: &str, key: &str, until: DateTime<Utc>) -> DarwinResult<()> {
        self.inner.renew(process, key, until)
    }

    pub fn release(&self, process: &str, key: &str) -> DarwinResult<()> {
        self.inner.release(process, key)
    }

    fn schedule_renewal(
        &self,
        process: &str,
        key: &str,
        duration: TimeDelta,
        restorer: Arc<dyn LockRestorer>,
    ) -> DarwinResult<()> {
        let Ok(lease_duration) = duration.to_std() else {
            log::warn!("Lease on {} has no time left, not renewing it", process);
            return Ok(());
        };
        let period = lease_duration * RENEWAL_PERIOD_PERCENT / 100;
        if period.is_zero() {
            log::warn!("Lease on {} is too short to renew", process);
            return Ok(());
        }

        self.inner.renewals.register(process, key, restorer, duration);

        let weak: Weak<LockerInner> = Arc::downgrade(&self.inner);
        let task_process = process.to_string();
        let task_key = key.to_string();
        let task = self.inner.scheduler.schedule_repeating(period, move || {
            if let Some(inner) = weak.upgrade() {
                inner.renew_tick(&task_process, &task_key);
            }
        });

        match task {
            Ok(task) => {
                if !self.inner.renewals.attach(process, key, task) {
                    log::debug!("Lock {} released before its renewal was scheduled", process);
                }
                Ok(())
            }
            Err(e) => {
                self.inner.renewals.remove(process, key);
                Err(e)
            }
        }
    }

    /// Whether the lease is still being renewed in the background.
    pub fn is_renewing(&self, process: &str, key: &str) -> bool {
        self.inner.renewals.contains(process, key)
    }
}

struct LockerInner {
    database: Database,
    renewal_database: Database,
    scheduler: Scheduler,
    renewals: RenewalRegistry,
    max_renewals: u32,
}

impl LockerInner {
    fn initialize(&self) -> DarwinResult<()> {
        let sql = self.database.dialect().create_lock_table();
        self.database.run(|conn| conn.execute_batch(sql))?;
        Ok(())
    }

    // shifts a local timestamp onto the database clock
    fn normalize(&self, until: DateTime<Utc>, db_now: DateTime<Utc>) -> DateTime<Utc> {
        until + (db_now - Utc::now())
    }

    fn state_at(&self, process: &str, db_now: DateTime<Utc>) -> DarwinResult<LockState> {
        let sql = self.database.dialect().select_lock();
        let lease_until: Option<i64> = self.database.run(|conn| {
            conn.query_row(sql, [process], |row| row.get::<_, i64>(0))
                .optional()
        })?;

        Ok(match lease_until {
            None => LockState::Available,
            Some(until) if from_millis(until) > db_now => LockState::Leased,
            Some(_) => LockState::LeasedExpired,
        })
    }

    fn lease(&self, process: &str, until: DateTime<Utc>) -> DarwinResult<LeaseOutcome> {
        let db_now = self.database.current_time()?;
        let until = self.normalize(until, db_now);

        match self.state_at(process, db_now)? {
            LockState::Leased => {
                log::debug!("Lock {} is leased by another process", process);
                return Ok(LeaseOutcome::Locked);
            }
            LockState::LeasedExpired => {
                log::warn!("Lease on {} expired, reclaiming it", process);
                let sql = self.database.dialect().delete_expired_lock();
                let deleted = self
                    .database
                    .run_raw(|conn| conn.execute(sql, params![process, to_millis(&db_now)]));
                match deleted {
                    Ok(_) => {}
                    Err(e) if self.database.dialect().is_busy(&e) => {
                        log::debug!("Database busy reclaiming lock {}", process);
                        return Ok(LeaseOutcome::Locked);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            LockState::Available => {}
        }

        let key = unlock_key(db_now);
        let sql = self.database.dialect().insert_lock();
        let inserted = self
            .database
            .run_raw(|conn| conn.execute(sql, params![process, to_millis(&until), key]));

        match inserted {
            Ok(_) => {
                log::debug!("Lock {} leased until {}", process, until);
                Ok(LeaseOutcome::Acquired(key))
            }
            Err(e) if self.database.dialect().is_unique_violation(&e) => {
                log::debug!("Lock {} was leased concurrently", process);
                Ok(LeaseOutcome::Locked)
            }
            Err(e) if self.database.dialect().is_busy(&e) => {
                log::debug!("Database busy leasing lock {}", process);
                Ok(LeaseOutcome::Locked)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease_with_wait(&self, process: &str, until: DateTime<Utc>, wait: Duration) -> DarwinResult<LeaseOutcome> {
        for attempt in 0..=MAX_LEASE_RETRIES {
            let outcome = self.lease(process, until)?;
            if outcome.is_acquired() {
                return Ok(outcome);
            }
            if attempt < MAX_LEASE_RETRIES {
                log::debug!("Lock {} busy, retry {} of {}", process, attempt + 1, MAX_LEASE_RETRIES);
                thread::sleep(wait);
            }
        }
        log::info!("Gave up leasing lock {} after {} retries", process, MAX_LEASE_RETRIES);
        Ok(LeaseOutcome::Locked)
    }

    fn renew(&self, process: &str, key: &str, until: DateTime<Utc>) -> DarwinResult<()> {
        self.renew_on(&self.database, process, key, until)
    }

    fn renew_on(&self, database: &Database, process: &str, key: &str, until: DateTime<Utc>) -> DarwinResult<()> {
        let db_now = database.current_time()?;
        let until = self.normalize(until, db_now);
        let sql = database.dialect().renew_lock();
        let updated = database
            .run(|conn| conn.execute(sql, params![process, key, to_millis(&until)]))?;

        if updated == 0 {
            log::error!("Cannot renew lock {}: key does not match", process);
            return Err(DarwinError::new(
                &format!("Lock {} is not held with the given key", process),
                ErrorKind::LockIntegrity,
            ));
        }
        log::debug!("Lock {} renewed until {}", process, until);
        Ok(())
    }

    fn release(&self, process: &str, key: &str) -> DarwinResult<()> {
        self.renewals.remove(process, key);

        let sql = self.database.dialect().delete_lock();
        let deleted = self
            .database
            .run(|conn| conn.execute(sql, params![process, key]))?;

        if deleted == 0 {
            log::error!("Cannot release lock {}: key does not match", process);
            return Err(DarwinError::new(
                &format!("Lock {} is not held with the given key", process),
                ErrorKind::LockIntegrity,
            ));
        }
        log::debug!("Lock {} released", process);
        Ok(())
    }

    fn renew_tick(&self, process: &str, key: &str) {
        let Some(duration) = self.renewals.next_renewal(process, key, self.max_renewals) else {
            return;
        };

        match self.renew_on(&self.renewal_database, process, key, Utc::now() + duration) {
            Ok(_) => {}
            Err(e) if e.kind() == &ErrorKind::LockIntegrity => {
                log::warn!("Lock {} is no longer held, stopping its renewal", process);
                self.renewals.remove(process, key);
            }
            // the next tick tries again
            Err(e) => log::warn!("Auto-renewal of lock {} failed: {}", process, e),
        }
    }
}

fn unlock_key(db_now: DateTime<Utc>) -> String {
    format!("{:x}-{}", to_millis(&db_now), Uuid::new_v4().simple())
}
