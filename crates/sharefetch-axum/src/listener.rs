//! Event listener that writes every share event to the tracing log.

use tracing::{debug, info, warn};

use sharefetch_core::{ShareEvent, ShareEventListener};

/// Logs share events with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventListener;

impl TracingEventListener {
    pub const fn new() -> Self {
        Self
    }
}

impl ShareEventListener for TracingEventListener {
    fn on_event(&self, event: &ShareEvent) {
        let kind = event.kind();
        let resource = event.resource();

        if kind.is_error() {
            warn!(
                event = kind.as_str(),
                uri = %resource.uri,
                error_kind = event.error_kind().unwrap_or_default(),
                message = event.message().unwrap_or_default(),
                "Share event"
            );
            return;
        }

        match event {
            ShareEvent::DownloadSuccess { duration, .. } => info!(
                event = kind.as_str(),
                uri = %resource.uri,
                file = %resource.file.display(),
                duration_ms = duration.as_millis(),
                "Share event"
            ),
            ShareEvent::SharedDownloadSuccess { bytes, .. }
            | ShareEvent::LocalDownload { bytes, .. } => debug!(
                event = kind.as_str(),
                uri = %resource.uri,
                bytes,
                "Share event"
            ),
            _ => debug!(event = kind.as_str(), uri = %resource.uri, "Share event"),
        }
    }
}
