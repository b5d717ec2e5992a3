//! Background event dispatch.
//!
//! Engine code emits [`ShareEvent`]s without waiting on listeners: events go
//! into an unbounded channel drained by one task that calls the listener in
//! emission order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sharefetch_core::{ShareEvent, ShareEventListener};

/// Fire-and-continue event emitter.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<ShareEvent>,
    closed: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventDispatcher {
    /// Start the dispatch task for `listener`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(listener: Arc<dyn ShareEventListener>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ShareEvent>();
        let closed = CancellationToken::new();
        let stop = closed.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => listener.on_event(&event),
                        None => break,
                    },
                    () = stop.cancelled() => {
                        // Deliver whatever was emitted before shutdown
                        while let Ok(event) = rx.try_recv() {
                            listener.on_event(&event);
                        }
                        break;
                    }
                }
            }
            debug!("Event dispatcher stopped");
        });

        Self {
            tx,
            closed,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue an event for the listener. Never blocks.
    pub fn emit(&self, event: ShareEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            debug!(kind = kind.as_str(), "Event dropped, dispatcher closed");
        }
    }

    /// Deliver queued events and stop the dispatch task.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event dispatcher task failed");
            }
        }
    }
}
