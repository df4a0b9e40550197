use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// When to run the next pass: on a fixed interval, or shortly after local edits settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub interval: Duration,
    pub debounce: Duration,
}

impl SchedulePolicy {
    pub fn new(interval: Duration, debounce: Duration) -> Self {
        Self { interval, debounce }
    }

    /// Instant (in Unix millis) the next pass is due.
    ///
    /// `last_sync` is the start of the last pass, `last_edit` the latest local change
    /// recorded after it. A pending edit pulls the deadline forward to `last_edit +
    /// debounce` but never past the interval deadline.
    pub fn next_trigger(&self, now: i64, last_sync: Option<i64>, last_edit: Option<i64>) -> i64 {
        let Some(last_sync) = last_sync else {
            return now;
        };
        let interval_due = last_sync.saturating_add(millis(self.interval));
        match last_edit {
            Some(edit) if edit >= last_sync => {
                interval_due.min(edit.saturating_add(millis(self.debounce)))
            }
            _ => interval_due,
        }
    }

    /// How long to sleep from `now` until the next pass is due.
    pub fn delay_until_next(
        &self,
        now: i64,
        last_sync: Option<i64>,
        last_edit: Option<i64>,
    ) -> Duration {
        let due = self.next_trigger(now, last_sync, last_edit);
        Duration::from_millis(due.saturating_sub(now).max(0) as u64)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Admits at most one pass at a time. Triggers that arrive while a pass runs are
/// dropped rather than queued.
#[derive(Debug, Clone, Default)]
pub struct PassGate {
    running: Arc<AtomicBool>,
}

impl PassGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<PassTicket> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassTicket {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct PassTicket {
    running: Arc<AtomicBool>,
}

impl Drop for PassTicket {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
