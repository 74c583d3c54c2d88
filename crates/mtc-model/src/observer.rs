//! Change observers for long-poll streaming
//!
//! A consumer creates a [`ChangeObserver`], attaches it to the data items it
//! cares about, and awaits signals. Data items hold weak references only;
//! dropping the observer unregisters it. Signaling with sequence 0 is the
//! shutdown sentinel that releases blocked waiters for good.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::data_item::DataItem;

pub(crate) struct ObserverInner {
    notify: Notify,
    /// Lowest signaled sequence since the last take
    sequence: Mutex<Option<u64>>,
}

impl ObserverInner {
    pub(crate) fn signal(&self, sequence: u64) {
        {
            let mut slot = self.sequence.lock();
            *slot = Some(match *slot {
                Some(current) => current.min(sequence),
                None => sequence,
            });
        }
        self.notify.notify_one();
    }
}

/// Waits for admissions against a set of data items
pub struct ChangeObserver {
    inner: Arc<ObserverInner>,
}

impl ChangeObserver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                notify: Notify::new(),
                sequence: Mutex::new(None),
            }),
        }
    }

    /// Register with a data item. May be called for any number of items.
    pub fn observe(&self, item: &DataItem) {
        item.add_observer(Arc::downgrade(&self.inner));
    }

    /// Take the lowest signaled sequence, clearing the pending state.
    pub fn take_sequence(&self) -> Option<u64> {
        self.inner.sequence.lock().take()
    }

    /// True if a signal is pending
    pub fn was_signaled(&self) -> bool {
        self.inner.sequence.lock().is_some()
    }

    /// Wait up to `timeout` for a signal. Returns the lowest signaled
    /// sequence, or `None` on timeout. A returned 0 means shutdown.
    pub async fn wait_for(&self, timeout: Duration) -> Option<u64> {
        if let Some(sequence) = self.take_sequence() {
            return Some(sequence);
        }
        match tokio::time::timeout(timeout, self.inner.notify.notified()).await {
            Ok(()) => self.take_sequence(),
            Err(_) => self.take_sequence(),
        }
    }
}

impl Default for ChangeObserver {
    fn default() -> Self {
        Self::new()
    }
}
