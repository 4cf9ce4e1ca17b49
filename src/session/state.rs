//! Session state management
//!
//! The mutable session record owned by the worker thread, and the immutable
//! snapshot copies handed to observers.

use crate::capture::device::DeviceHandle;
use crate::capture::traits::{AuthorizationStatus, DeviceDescriptor, DeviceRole, FlashMode};
use crate::session::operation::CaptureOperation;
use crate::utils::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};

/// Bounds a zoom request must be clamped into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomRange {
    pub min: f64,
    pub max: f64,
}

impl ZoomRange {
    /// Effective range for a device: `[max(policy_min, device_min), min(device_max, policy_max)]`
    pub fn effective(policy_min: f64, policy_max: f64, device_min: f64, device_max: f64) -> Self {
        let min = policy_min.max(device_min);
        let max = policy_max.min(device_max).max(min);
        Self { min, max }
    }

    /// Clamp a raw request. NaN maps to the lower bound.
    pub fn clamp(&self, requested: f64) -> f64 {
        if requested.is_nan() {
            return self.min;
        }
        requested.clamp(self.min, self.max)
    }
}

/// Current session configuration, mutated only on the worker thread
#[derive(Debug, Default)]
pub struct SessionState {
    pub authorization: AuthorizationStatus,

    pub running: bool,

    video: Option<DeviceHandle>,

    audio: Option<DeviceHandle>,

    /// Whether photo and movie outputs have been added to the session
    pub outputs_ready: bool,

    pub zoom_factor: f64,

    pub flash_mode: FlashMode,

    /// In-flight still capture
    pub photo: Option<CaptureOperation>,

    /// In-flight recording
    pub recording: Option<CaptureOperation>,

    /// Stop was requested for the in-flight recording; waiting on its completion
    pub stop_requested: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            zoom_factor: 1.0,
            ..Default::default()
        }
    }

    pub fn video_device(&self) -> Option<&DeviceHandle> {
        self.video.as_ref()
    }

    pub fn audio_device(&self) -> Option<&DeviceHandle> {
        self.audio.as_ref()
    }

    /// Attach a device into the slot for its role
    ///
    /// At most one video and one audio device may be attached at a time.
    pub fn attach(&mut self, handle: DeviceHandle) -> SessionResult<()> {
        let slot = match handle.role() {
            DeviceRole::Video => &mut self.video,
            DeviceRole::Audio => &mut self.audio,
        };
        if let Some(existing) = slot {
            return Err(SessionError::ConfigurationFailed(format!(
                "{} is already attached as {:?} input",
                existing.name(),
                handle.role()
            )));
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Detach the device holding `role`, handing ownership back to the caller
    pub fn detach(&mut self, role: DeviceRole) -> Option<DeviceHandle> {
        match role {
            DeviceRole::Video => self.video.take(),
            DeviceRole::Audio => self.audio.take(),
        }
    }

    /// Immutable copy for observers
    pub fn snapshot(&self, zoom: ZoomRange) -> SessionSnapshot {
        SessionSnapshot {
            authorization: self.authorization,
            running: self.running,
            video_device: self.video.as_ref().map(|h| h.descriptor().clone()),
            audio_attached: self.audio.is_some(),
            zoom_factor: self.zoom_factor,
            max_zoom_factor: zoom.max,
            flash_mode: self.flash_mode,
            photo_in_flight: self.photo.is_some(),
            is_recording: self.recording.is_some(),
        }
    }
}

/// Published view of the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub authorization: AuthorizationStatus,
    pub running: bool,
    pub video_device: Option<DeviceDescriptor>,
    pub audio_attached: bool,
    pub zoom_factor: f64,
    pub max_zoom_factor: f64,
    pub flash_mode: FlashMode,
    pub photo_in_flight: bool,
    pub is_recording: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionState::new().snapshot(ZoomRange { min: 1.0, max: 1.0 })
    }
}
