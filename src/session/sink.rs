//! Observable state boundary
//!
//! The coordinator publishes immutable copies of its state here. Sinks are
//! called from the worker thread and from completion watchers, so they must
//! hand values off rather than block.

use crate::capture::traits::AuthorizationStatus;
use crate::session::operation::CaptureOperation;
use crate::session::state::SessionSnapshot;
use crate::utils::error::ErrorReport;
use tokio::sync::broadcast;

/// Receiver of session updates, callable from any thread
pub trait StateSink: Send + Sync {
    fn publish_snapshot(&self, snapshot: SessionSnapshot);

    /// Called on every transition of a capture operation
    fn publish_capture(&self, operation: CaptureOperation);

    fn publish_authorization(&self, status: AuthorizationStatus);

    /// Non-fatal failure notification
    fn publish_error(&self, report: ErrorReport);
}

/// Events emitted by the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session configuration changed
    Snapshot(SessionSnapshot),
    /// A capture operation changed phase
    Capture(CaptureOperation),
    /// Access permission resolved
    Authorization(AuthorizationStatus),
    /// A request failed without stopping the session
    Error(ErrorReport),
}

/// Sink that fans events out over a tokio broadcast channel
pub struct BroadcastSink {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(100)
    }
}

impl StateSink for BroadcastSink {
    fn publish_snapshot(&self, snapshot: SessionSnapshot) {
        self.emit(SessionEvent::Snapshot(snapshot));
    }

    fn publish_capture(&self, operation: CaptureOperation) {
        tracing::debug!(
            "Capture {} ({:?}) is {}",
            operation.id,
            operation.kind,
            operation.phase()
        );
        self.emit(SessionEvent::Capture(operation));
    }

    fn publish_authorization(&self, status: AuthorizationStatus) {
        self.emit(SessionEvent::Authorization(status));
    }

    fn publish_error(&self, report: ErrorReport) {
        tracing::warn!("Session error [{}]: {}", report.code, report.message);
        self.emit(SessionEvent::Error(report));
    }
}
