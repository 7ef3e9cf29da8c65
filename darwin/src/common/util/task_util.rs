use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use std::time::Duration;
use timer::{Guard, Timer};

/// Handle of a repeating task. Dropping it stops further executions.
pub struct ScheduledTask {
    _guard: Guard,
}

/// Runs repeating background tasks on a single timer thread.
///
/// Every scheduler owns its own timer thread, so dropping the scheduler stops
/// the thread together with every task scheduled on it.
pub struct Scheduler {
    timer: Timer,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            timer: Timer::new(),
        }
    }

    /// Schedules `f` to run every `period`, the first run one `period` from now.
    #[inline]
    pub fn schedule_repeating<F>(&self, period: Duration, f: F) -> DarwinResult<ScheduledTask>
    where
        F: 'static + FnMut() + Send,
    {
        match chrono::Duration::from_std(period) {
            Ok(chrono_duration) => {
                let guard = self.timer.schedule_repeating(chrono_duration, f);
                Ok(ScheduledTask { _guard: guard })
            }
            Err(e) => {
                log::error!("Failed to convert duration to chrono::Duration: {}, skipping task scheduling", e);
                Err(DarwinError::new(
                    &format!("Invalid task period {:?}: {}", period, e),
                    ErrorKind::InvalidOperation,
                ))
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
