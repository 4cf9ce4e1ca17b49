//! Capture trait definitions
//!
//! Platform-agnostic interface to capture hardware, plus the descriptors,
//! settings and artifacts that cross it.

use crate::capture::device::DeviceHandle;
use crate::utils::error::SessionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// File extension used for persisted photos
pub const IMAGE_EXTENSION: &str = "png";

/// File extension used for recorded movies
pub const MOVIE_EXTENSION: &str = "mov";

/// Logical placement of a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePosition {
    Back,
    Front,
    /// Devices without a facing, such as microphones
    Unspecified,
}

impl DevicePosition {
    /// The camera on the other side of the device
    pub fn opposite(self) -> Self {
        match self {
            DevicePosition::Back => DevicePosition::Front,
            DevicePosition::Front => DevicePosition::Back,
            DevicePosition::Unspecified => DevicePosition::Back,
        }
    }
}

/// What kind of input a device provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Video,
    Audio,
}

/// Hardware limits reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub has_flash: bool,
}

impl DeviceCapabilities {
    pub fn camera(max_zoom: f64, has_flash: bool) -> Self {
        Self {
            min_zoom: 1.0,
            max_zoom,
            has_flash,
        }
    }

    pub fn microphone() -> Self {
        Self {
            min_zoom: 1.0,
            max_zoom: 1.0,
            has_flash: false,
        }
    }
}

/// Information about a capture device, before it is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Unique device ID
    pub id: String,

    /// Human readable name
    pub name: String,

    pub role: DeviceRole,

    pub position: DevicePosition,

    pub capabilities: DeviceCapabilities,
}

/// Access permission for capture hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
    #[default]
    NotDetermined,
    Authorized,
    Denied,
    Restricted,
}

impl AuthorizationStatus {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthorizationStatus::Authorized)
    }

    /// Whether the user has already answered (or policy has answered for them)
    pub fn is_determined(&self) -> bool {
        !matches!(self, AuthorizationStatus::NotDetermined)
    }
}

/// Flash behaviour for still captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    #[default]
    Off,
    On,
    Auto,
}

impl FlashMode {
    /// Cycle to the next mode: Off -> On -> Auto -> Off
    pub fn next(self) -> Self {
        match self {
            FlashMode::Off => FlashMode::On,
            FlashMode::On => FlashMode::Auto,
            FlashMode::Auto => FlashMode::Off,
        }
    }
}

/// How the hardware trades capture latency against image quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPrioritization {
    Speed,
    Balanced,
    #[default]
    Quality,
}

/// Per-request settings for a still capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoSettings {
    pub flash_mode: FlashMode,
    pub high_resolution: bool,
    pub quality: QualityPrioritization,
}

/// Outputs a session can stream into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Photo,
    Movie,
}

/// An encoded still image
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageArtifact {
    pub id: Uuid,
    pub width: u32,
    pub height: u32,

    /// Encoded image bytes
    #[serde(skip_serializing)]
    pub data: Arc<[u8]>,
}

impl ImageArtifact {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            width,
            height,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write the image to `dir`, named after its id
    pub fn persist(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}", self.id, IMAGE_EXTENSION));
        std::fs::write(&path, &self.data)?;
        tracing::debug!("Persisted photo {} to {:?}", self.id, path);
        Ok(path)
    }
}

/// A finished movie file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileArtifact {
    pub id: Uuid,
    pub path: PathBuf,
    pub bytes_written: u64,
    pub duration_ms: f64,
}

/// Output of a finished capture
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Artifact {
    Image(ImageArtifact),
    Movie(FileArtifact),
}

impl Artifact {
    pub fn as_image(&self) -> Option<&ImageArtifact> {
        match self {
            Artifact::Image(image) => Some(image),
            Artifact::Movie(_) => None,
        }
    }

    pub fn as_movie(&self) -> Option<&FileArtifact> {
        match self {
            Artifact::Movie(movie) => Some(movie),
            Artifact::Image(_) => None,
        }
    }
}

/// Result-bearing completion channel for a long-running hardware request
pub type Completion<T> = oneshot::Receiver<SessionResult<T>>;

/// Sending half of a [`Completion`]
pub type CompletionSender<T> = oneshot::Sender<SessionResult<T>>;

/// Create a linked completion pair
pub fn completion<T>() -> (CompletionSender<T>, Completion<T>) {
    oneshot::channel()
}

/// Interface to the capture hardware stack
///
/// Calls other than [`CaptureBackend::request_access`] are made from the
/// session worker thread, one at a time. Implementations must be cheap to call
/// and hand long-running work back through a [`Completion`].
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    // ===== Permissions =====

    /// Current access permission, without prompting
    fn authorization_status(&self) -> AuthorizationStatus;

    /// Prompt for access. Resolves once the user has answered.
    async fn request_access(&self) -> bool;

    // ===== Enumeration =====

    /// Find a device for `role`, optionally at a specific position
    fn enumerate(&self, role: DeviceRole, position: Option<DevicePosition>) -> Option<DeviceDescriptor>;

    /// Open a device and claim it exclusively
    fn open(&self, descriptor: &DeviceDescriptor) -> SessionResult<DeviceHandle>;

    // ===== Configuration =====

    fn begin_configuration(&self);

    fn commit_configuration(&self);

    fn add_input(&self, handle: &DeviceHandle) -> SessionResult<()>;

    fn remove_input(&self, handle: &DeviceHandle);

    fn add_output(&self, output: OutputKind) -> SessionResult<()>;

    fn set_zoom(&self, handle: &DeviceHandle, factor: f64) -> SessionResult<()>;

    /// Largest zoom factor the active format of `handle` supports
    fn max_zoom_factor(&self, handle: &DeviceHandle) -> f64 {
        handle.capabilities().max_zoom
    }

    // ===== Streaming =====

    fn start_streaming(&self) -> SessionResult<()>;

    fn stop_streaming(&self);

    fn is_streaming(&self) -> bool;

    // ===== Capture =====

    /// Issue a still capture. The returned channel resolves exactly once.
    fn capture_photo(&self, settings: &PhotoSettings) -> SessionResult<Completion<ImageArtifact>>;

    /// Start writing a movie to `path`
    ///
    /// The returned channel resolves after [`CaptureBackend::stop_recording`]
    /// or when the device fails fatally mid-recording.
    fn start_recording(&self, path: &Path) -> SessionResult<Completion<FileArtifact>>;

    /// Ask the active recording to finish
    fn stop_recording(&self) -> SessionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_cycle_has_period_three() {
        for start in [FlashMode::Off, FlashMode::On, FlashMode::Auto] {
            assert_eq!(start.next().next().next(), start);
        }
        assert_eq!(FlashMode::Off.next(), FlashMode::On);
        assert_eq!(FlashMode::On.next(), FlashMode::Auto);
    }

    #[test]
    fn test_opposite_position() {
        assert_eq!(DevicePosition::Back.opposite(), DevicePosition::Front);
        assert_eq!(DevicePosition::Front.opposite(), DevicePosition::Back);
    }

    #[test]
    fn test_image_persist_uses_id() {
        let dir = tempfile::tempdir().unwrap();
        let image = ImageArtifact::new(2, 2, vec![1, 2, 3]);

        let path = image.persist(dir.path()).unwrap();

        assert_eq!(path.extension().unwrap(), IMAGE_EXTENSION);
        assert!(path.to_string_lossy().contains(&image.id.to_string()));
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_authorization_serializes_camel_case() {
        let json = serde_json::to_string(&AuthorizationStatus::NotDetermined).unwrap();
        assert_eq!(json, "\"notDetermined\"");
    }
}
