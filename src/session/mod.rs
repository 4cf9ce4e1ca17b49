//! Capture session coordination
//!
//! The controller serializes every reconfiguration onto one worker, tracks
//! in-flight captures and publishes state to observers.

pub mod controller;
pub mod operation;
pub mod queue;
pub mod sink;
pub mod state;

pub use controller::SessionController;
pub use operation::{CaptureKind, CaptureOperation, CapturePhase, CaptureStatus, OperationId};
pub use queue::{QueueHandle, ReconfigurationQueue, Reply, WeakQueueHandle};
pub use sink::{BroadcastSink, SessionEvent, StateSink};
pub use state::{SessionSnapshot, SessionState, ZoomRange};
