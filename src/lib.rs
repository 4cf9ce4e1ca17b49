//! Camera session - a device-session coordinator for streaming capture hardware.
//!
//! Commands from the UI are serialized onto a dedicated worker, applied to the
//! capture backend and published back as immutable snapshots and capture events.

pub mod capture;
pub mod config;
pub mod session;
pub mod utils;

pub use capture::{CaptureBackend, VirtualBackend};
pub use config::SessionConfig;
pub use session::{BroadcastSink, SessionController, SessionEvent, SessionSnapshot, StateSink};
pub use utils::{ErrorKind, ErrorReport, SessionError, SessionResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber
///
/// Honors `RUST_LOG`. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camera_session=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    tracing::debug!("Camera session v{}", env!("CARGO_PKG_VERSION"));
}
