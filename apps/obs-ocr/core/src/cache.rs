use std::sync::Arc;

use parking_lot::Mutex;

/// Single-slot store for the most recent screenshot seen on a session.
///
/// Both read loops of a session go through the one mutex. The lock is only
/// held while the slot itself is swapped or cloned; the payload is
/// reference counted so readers never copy the image under the lock.
#[derive(Debug, Default)]
pub struct ScreenshotCache {
    slot: Mutex<Option<Arc<str>>>,
}

impl ScreenshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever is stored with `payload`.
    pub fn store(&self, payload: impl Into<Arc<str>>) {
        let payload = payload.into();
        let previous = std::mem::replace(&mut *self.slot.lock(), Some(payload));
        // released outside the lock
        drop(previous);
    }

    /// Latest stored payload, if a screenshot has arrived yet.
    pub fn current(&self) -> Option<Arc<str>> {
        self.slot.lock().clone()
    }
}
