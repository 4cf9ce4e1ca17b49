//! Capture hardware abstraction
//!
//! The backend trait the session drives, device claims, and an in-process
//! virtual backend for tests and headless use.

pub mod device;
pub mod traits;
pub mod virtual_device;

pub use device::{DeviceHandle, DeviceRegistry};
pub use traits::{
    Artifact, AuthorizationStatus, CaptureBackend, Completion, DeviceCapabilities,
    DeviceDescriptor, DevicePosition, DeviceRole, FileArtifact, FlashMode, ImageArtifact,
    OutputKind, PhotoSettings, QualityPrioritization,
};
pub use virtual_device::VirtualBackend;
