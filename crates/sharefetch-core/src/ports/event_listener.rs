//! Share event listener port.
//!
//! Listeners receive every [`ShareEvent`] through a single callback and
//! switch on [`ShareEvent::kind`]. The engine dispatches events from a
//! background task, so a slow listener never stalls a download, but a
//! listener that blocks still delays the events queued behind it.
//!
//! [`ShareEvent::kind`]: crate::events::ShareEvent::kind

use crate::events::ShareEvent;

/// Port for observing downloads.
pub trait ShareEventListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &ShareEvent);
}

/// A listener that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl NoopListener {
    /// Create a new no-op listener.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ShareEventListener for NoopListener {
    fn on_event(&self, _event: &ShareEvent) {
        // Intentionally do nothing
    }
}
