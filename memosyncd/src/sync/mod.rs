pub mod change_log;
pub mod event_capture;
pub mod local_watcher;
pub mod lock;
pub mod reconciler;
pub mod scheduler;

use time::OffsetDateTime;

/// Wall-clock time in Unix milliseconds, the unit of every item timestamp.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
