//! Session configuration
//!
//! Policy knobs for the coordinator. All fields have defaults, so a config
//! file only needs to name what it changes.

use crate::capture::traits::{DevicePosition, QualityPrioritization};
use crate::utils::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Lower zoom bound
    pub min_zoom: f64,

    /// Policy upper zoom bound; the effective max is also capped by the device
    pub max_zoom: f64,

    /// Camera to start with
    pub preferred_position: DevicePosition,

    /// Whether to attach a microphone when one exists
    pub capture_audio: bool,

    /// Where movie files are created (OS temp dir when unset)
    pub artifact_dir: Option<PathBuf>,

    pub high_resolution_photos: bool,

    pub quality_prioritization: QualityPrioritization,

    /// Start the session as soon as access is granted
    pub start_on_authorization: bool,

    /// Buffered events per broadcast subscriber
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_zoom: 1.0,
            max_zoom: 5.0,
            preferred_position: DevicePosition::Back,
            capture_audio: true,
            artifact_dir: None,
            high_resolution_photos: true,
            quality_prioritization: QualityPrioritization::Quality,
            start_on_authorization: true,
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> SessionResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file
    pub fn load(path: &Path) -> SessionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        tracing::debug!("Loaded session config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if !(self.min_zoom > 0.0) || !self.min_zoom.is_finite() {
            return Err(SessionError::Config(format!(
                "minZoom must be a positive number, got {}",
                self.min_zoom
            )));
        }
        if !(self.max_zoom >= self.min_zoom) || !self.max_zoom.is_finite() {
            return Err(SessionError::Config(format!(
                "maxZoom ({}) must be at least minZoom ({})",
                self.max_zoom, self.min_zoom
            )));
        }
        if self.preferred_position == DevicePosition::Unspecified {
            return Err(SessionError::Config(
                "preferredPosition must be front or back".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::Config(
                "eventCapacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory movie files are written to
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
