//! Capture operation state machine
//!
//! One in-flight photo or video capture, from request to completion.
//! Transitions only move forward: Pending -> Running -> (Completed | Failed).

use crate::capture::traits::{Artifact, IMAGE_EXTENSION, MOVIE_EXTENSION};
use crate::utils::error::{ErrorKind, SessionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a capture operation
pub type OperationId = Uuid;

/// What a capture produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Photo,
    Video,
}

impl CaptureKind {
    /// File extension of the artifact container for this kind
    pub fn extension(&self) -> &'static str {
        match self {
            CaptureKind::Photo => IMAGE_EXTENSION,
            CaptureKind::Video => MOVIE_EXTENSION,
        }
    }
}

/// Lifecycle phase of an operation, without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CapturePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CapturePhase::Completed | CapturePhase::Failed)
    }
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapturePhase::Pending => "pending",
            CapturePhase::Running => "running",
            CapturePhase::Completed => "completed",
            CapturePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Current status of an operation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CaptureStatus {
    Pending,
    Running,
    Completed { artifact: Artifact },
    Failed { kind: ErrorKind, reason: String },
}

impl CaptureStatus {
    pub fn phase(&self) -> CapturePhase {
        match self {
            CaptureStatus::Pending => CapturePhase::Pending,
            CaptureStatus::Running => CapturePhase::Running,
            CaptureStatus::Completed { .. } => CapturePhase::Completed,
            CaptureStatus::Failed { .. } => CapturePhase::Failed,
        }
    }
}

/// Illegal operation transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot move {kind:?} capture {id} from {from} to {to}")]
pub struct TransitionError {
    pub id: OperationId,
    pub kind: CaptureKind,
    pub from: CapturePhase,
    pub to: CapturePhase,
}

/// A single photo or video capture
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOperation {
    pub id: OperationId,
    pub kind: CaptureKind,
    pub status: CaptureStatus,

    /// Where the movie is being written, for video captures
    pub output_path: Option<PathBuf>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CaptureOperation {
    pub fn photo() -> Self {
        Self::new(CaptureKind::Photo, None)
    }

    pub fn video(output_path: PathBuf) -> Self {
        Self::new(CaptureKind::Video, Some(output_path))
    }

    fn new(kind: CaptureKind, output_path: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: CaptureStatus::Pending,
            output_path,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.status.phase()
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match &self.status {
            CaptureStatus::Completed { artifact } => Some(artifact),
            _ => None,
        }
    }

    fn refuse(&self, to: CapturePhase) -> TransitionError {
        TransitionError {
            id: self.id,
            kind: self.kind,
            from: self.phase(),
            to,
        }
    }

    /// Pending -> Running, once the hardware accepted the request
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.phase() != CapturePhase::Pending {
            return Err(self.refuse(CapturePhase::Running));
        }
        self.status = CaptureStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Completed
    pub fn complete(&mut self, artifact: Artifact) -> Result<(), TransitionError> {
        if self.phase() != CapturePhase::Running {
            return Err(self.refuse(CapturePhase::Completed));
        }
        self.status = CaptureStatus::Completed { artifact };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Pending or Running -> Failed
    pub fn fail(&mut self, error: &SessionError) -> Result<(), TransitionError> {
        if self.phase().is_terminal() {
            return Err(self.refuse(CapturePhase::Failed));
        }
        self.status = CaptureStatus::Failed {
            kind: error.kind(),
            reason: error.reason(),
        };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Resolve a running operation from a hardware result
    pub fn resolve(&mut self, result: Result<Artifact, SessionError>) -> Result<(), TransitionError> {
        match result {
            Ok(artifact) => self.complete(artifact),
            Err(error) => self.fail(&error),
        }
    }
}
