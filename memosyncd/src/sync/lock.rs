use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Keys whose local notifications are being produced by the reconciler itself.
///
/// A held key has no deadline. Once its guard drops the key stays suppressed for the
/// settle window, because watcher notifications arrive after the write completes.
#[derive(Debug, Clone)]
pub struct LockSet {
    inner: Arc<Mutex<HashMap<String, Option<Instant>>>>,
    settle: Duration,
}

impl LockSet {
    pub fn new(settle: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            settle,
        }
    }

    pub fn hold(&self, key: &str) -> LockGuard {
        self.entries().insert(key.to_string(), None);
        LockGuard {
            set: self.clone(),
            key: key.to_string(),
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.is_locked_at(key, Instant::now())
    }

    fn is_locked_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries();
        entries.retain(|_, deadline| deadline.is_none_or(|deadline| deadline > now));
        entries.contains_key(key)
    }

    fn release(&self, key: &str) {
        let deadline = Instant::now() + self.settle;
        if let Some(entry) = self.entries().get_mut(key) {
            *entry = Some(deadline);
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Option<Instant>>> {
        // A poisoned map is still a valid map.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct LockGuard {
    set: LockSet,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}
