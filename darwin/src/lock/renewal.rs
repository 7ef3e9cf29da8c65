use crate::common::ScheduledTask;
use crate::lock::LockRestorer;
use chrono::TimeDelta;
use dashmap::DashMap;
use std::sync::Arc;

struct Renewal {
    restorer: Arc<dyn LockRestorer>,
    duration: TimeDelta,
    renewals: u32,
    task: Option<ScheduledTask>,
}

/// Auto-renewed leases, keyed by (process name, unlock key).
///
/// Removing an entry drops its scheduled task, which stops the renewal.
#[derive(Default)]
pub(crate) struct RenewalRegistry {
    entries: DashMap<(String, String), Renewal>,
}

impl RenewalRegistry {
    pub(crate) fn register(&self, process: &str, key: &str, restorer: Arc<dyn LockRestorer>, duration: TimeDelta) {
        self.entries.insert(
            (process.to_string(), key.to_string()),
            Renewal {
                restorer,
                duration,
                renewals: 0,
                task: None,
            },
        );
    }

    /// Hands the scheduled task to its entry. Returns `false`, dropping the
    /// task, when the entry is already gone.
    pub(crate) fn attach(&self, process: &str, key: &str, task: ScheduledTask) -> bool {
        match self.entries.get_mut(&(process.to_string(), key.to_string())) {
            Some(mut entry) => {
                entry.task = Some(task);
                true
            }
            None => false,
        }
    }

    /// Duration of the next renewal, or `None` when the lease must not be
    /// renewed any more. In that case the entry is removed.
    pub(crate) fn next_renewal(&self, process: &str, key: &str, max_renewals: u32) -> Option<TimeDelta> {
        let id = (process.to_string(), key.to_string());
        let next = {
            let mut entry = self.entries.get_mut(&id)?;
            if entry.restorer.is_finished() {
                log::debug!("Work under lock {} finished, stopping renewal", process);
                None
            } else if entry.renewals >= max_renewals {
                log::warn!("Lock {} renewed {} times, stopping renewal", process, entry.renewals);
                None
            } else {
                entry.renewals += 1;
                Some(entry.duration)
            }
        };

        if next.is_none() {
            self.entries.remove(&id);
        }
        next
    }

    pub(crate) fn remove(&self, process: &str, key: &str) -> bool {
        self.entries
            .remove(&(process.to_string(), key.to_string()))
            .is_some()
    }

    pub(crate) fn contains(&self, process: &str, key: &str) -> bool {
        self.entries
            .contains_key(&(process.to_string(), key.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
