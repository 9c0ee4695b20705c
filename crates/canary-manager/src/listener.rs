//! Listener registry with snapshot dispatch

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canary_core::Frame;
use parking_lot::RwLock;
use tracing::error;

/// A frame together with the link it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub link: Arc<str>,
    pub frame: Frame,
}

impl fmt::Display for ReceivedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.link, self.frame)
    }
}

pub type Listener = Arc<dyn Fn(&ReceivedFrame) + Send + Sync>;

/// Handle returned by `register_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Copy-on-write list: dispatch iterates a snapshot, registration swaps the list
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Arc<Vec<(ListenerId, Listener)>>>,
}

impl ListenerRegistry {
    pub(crate) fn register(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write();
        let mut next = listeners.as_ref().clone();
        next.push((id, listener));
        *listeners = Arc::new(next);
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next = listeners
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *listeners = Arc::new(next);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Call every listener; a panicking listener is logged and skipped
    pub(crate) fn dispatch(&self, received: &ReceivedFrame) {
        let snapshot = self.listeners.read().clone();
        for (id, listener) in snapshot.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(received))).is_err() {
                error!(
                    link = %received.link,
                    listener = id.0,
                    frame = %received.frame,
                    "Listener panicked"
                );
            }
        }
    }
}
