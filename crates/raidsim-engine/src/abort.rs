//! Cooperative cancellation of running requests.
//!
//! Every running request registers its id and gets an [`AbortSignal`]. Workers
//! poll the signal between trials; a trial in progress always runs to
//! completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::HarnessError;

/// Shared flag observed by the workers of one request.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    /// A signal not tied to any registry.
    pub fn detached() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Request id to abort flag. Cheap to clone; clones share the table.
#[derive(Debug, Clone, Default)]
pub struct AbortRegistry {
    flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new request. Fails if the id is already running.
    pub fn register(&self, request_id: &str) -> Result<AbortSignal, HarnessError> {
        let mut table = self.table();
        if table.contains_key(request_id) {
            return Err(HarnessError::DuplicateRequest(request_id.to_owned()));
        }
        let flag = Arc::new(AtomicBool::new(false));
        table.insert(request_id.to_owned(), Arc::clone(&flag));
        debug!(request_id, "request registered");
        Ok(AbortSignal { flag })
    }

    /// Ask the workers of `request_id` to stop. Returns whether the id was
    /// running. Aborting twice is harmless.
    pub fn abort(&self, request_id: &str) -> bool {
        match self.table().get(request_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                debug!(request_id, "abort requested");
                true
            }
            None => {
                warn!(request_id, "abort for unknown request");
                false
            }
        }
    }

    pub fn is_aborted(&self, request_id: &str) -> bool {
        self.table()
            .get(request_id)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn is_running(&self, request_id: &str) -> bool {
        self.table().contains_key(request_id)
    }

    /// Forget a finished request so its id can be reused.
    pub fn unregister(&self, request_id: &str) {
        self.table().remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reaches_signal() {
        let registry = AbortRegistry::new();
        let signal = registry.register("r1").unwrap();
        assert!(!signal.is_aborted());
        assert!(registry.abort("r1"));
        assert!(registry.abort("r1"));
        assert!(signal.is_aborted());
        assert!(registry.is_aborted("r1"));
    }

    #[test]
    fn duplicate_ids_rejected_until_unregistered() {
        let registry = AbortRegistry::new();
        let _first = registry.register("r1").unwrap();
        assert!(matches!(
            registry.register("r1"),
            Err(HarnessError::DuplicateRequest(id)) if id == "r1"
        ));
        registry.unregister("r1");
        assert!(!registry.is_running("r1"));
        assert!(registry.register("r1").is_ok());
    }

    #[test]
    fn unknown_abort_is_reported() {
        let registry = AbortRegistry::new();
        assert!(!registry.abort("missing"));
        assert!(!registry.is_aborted("missing"));
    }

    #[test]
    fn detached_signal_triggers_locally() {
        let signal = AbortSignal::detached();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_aborted());
    }
}
