use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use conduit_protocol::{OperationKey, OperationUpdate};
use parking_lot::Mutex;
use tracing::warn;

pub type Listener = Arc<dyn Fn(&OperationUpdate) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: Mutex<u64>,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Listener) -> u64 {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.entries.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Calls every listener outside the lock. A listener that panics is
    /// dropped; the others still run.
    pub(crate) fn notify(&self, key: &OperationKey, update: &OperationUpdate) {
        let current: Vec<(u64, Listener)> = self.entries.lock().clone();
        for (id, listener) in current {
            if catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                warn!(
                    target: "conduit::ops",
                    key = %key,
                    listener = id,
                    "listener panicked; unsubscribing it"
                );
                self.remove(id);
            }
        }
    }
}

/// Keeps a listener registered until dropped or explicitly unsubscribed.
#[must_use = "dropping the guard unsubscribes the listener"]
pub struct ListenerGuard {
    id: u64,
    set: Weak<ListenerSet>,
}

impl ListenerGuard {
    pub(crate) fn new(id: u64, set: &Arc<ListenerSet>) -> Self {
        Self {
            id,
            set: Arc::downgrade(set),
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::{OperationSnapshot, ProgressEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn update() -> OperationUpdate {
        let key = OperationKey::model_pull("m");
        OperationUpdate {
            seq: 1,
            event: ProgressEvent::progress(10.0, ""),
            snapshot: OperationSnapshot::new(key),
        }
    }

    #[test]
    fn panicking_listener_is_removed_and_others_still_run() {
        let set = Arc::new(ListenerSet::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _bad = ListenerGuard::new(set.add(Arc::new(|_| panic!("listener bug"))), &set);
        let _good = ListenerGuard::new(
            set.add(Arc::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
            &set,
        );

        let key = OperationKey::model_pull("m");
        set.notify(&key, &update());
        set.notify(&key, &update());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn dropping_guard_unsubscribes() {
        let set = Arc::new(ListenerSet::default());
        let guard = ListenerGuard::new(set.add(Arc::new(|_| {})), &set);
        assert_eq!(set.len(), 1);
        guard.unsubscribe();
        assert_eq!(set.len(), 0);
    }
}
