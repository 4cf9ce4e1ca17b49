//! Software capture backend
//!
//! Behaves like a phone camera stack without touching hardware: a back camera,
//! a front camera and a microphone. Photos are synthetic frames encoded as PNG,
//! movies are written to disk by a writer thread. Faults can be injected to
//! exercise the recovery paths of the session coordinator.

use crate::capture::device::{DeviceHandle, DeviceRegistry};
use crate::capture::traits::{
    completion, AuthorizationStatus, CaptureBackend, Completion, CompletionSender,
    DeviceCapabilities, DeviceDescriptor, DevicePosition, DeviceRole, FileArtifact, FlashMode,
    ImageArtifact, OutputKind, PhotoSettings,
};
use crate::utils::error::{SessionError, SessionResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default still resolution for synthetic photos
const DEFAULT_FRAME_SIZE: (u32, u32) = (64, 48);

/// Default time between a photo request and its completion
const DEFAULT_PHOTO_LATENCY: Duration = Duration::from_millis(20);

/// Default time between two movie frames
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct PermissionState {
    status: AuthorizationStatus,
    grant_on_request: bool,
}

#[derive(Debug, Default)]
struct Faults {
    unopenable: HashSet<String>,
    rejected_inputs: HashSet<String>,
    rejected_outputs: HashSet<OutputKind>,
    fail_streaming: bool,
    fail_next_photo: Option<String>,
    fail_next_recording: Option<String>,
}

#[derive(Debug, Default)]
struct VirtualSession {
    configuration_depth: u32,
    inputs: Vec<(String, DeviceRole)>,
    outputs: HashSet<OutputKind>,
    streaming: bool,
    zoom: HashMap<String, f64>,
    recorder: Option<MovieWriter>,
    last_photo_settings: Option<PhotoSettings>,
}

/// Background writer for an active recording
#[derive(Debug)]
struct MovieWriter {
    running: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    frames: Arc<AtomicU64>,
}

impl MovieWriter {
    fn spawn(
        path: PathBuf,
        frame_interval: Duration,
        tx: CompletionSender<FileArtifact>,
    ) -> SessionResult<Self> {
        let mut file = File::create(&path).map_err(|e| {
            SessionError::CaptureFailed(format!("Failed to create {:?}: {}", path, e))
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let failure = Arc::new(Mutex::new(None::<String>));
        let frames = Arc::new(AtomicU64::new(0));

        let writer = Self {
            running: running.clone(),
            failure: failure.clone(),
            frames: frames.clone(),
        };

        thread::Builder::new()
            .name("virtual-movie-writer".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut bytes_written = 0u64;

                let outcome = loop {
                    if let Some(reason) = failure.lock().take() {
                        break Err(SessionError::CaptureFailed(reason));
                    }
                    if !running.load(Ordering::SeqCst) {
                        break Ok(());
                    }

                    let index = frames.fetch_add(1, Ordering::SeqCst);
                    let frame = format!("frame {:08}\n", index);
                    if let Err(e) = file.write_all(frame.as_bytes()) {
                        break Err(SessionError::CaptureFailed(format!("Write failed: {}", e)));
                    }
                    bytes_written += frame.len() as u64;
                    thread::sleep(frame_interval);
                };

                let result = outcome
                    .and_then(|_| file.sync_all().map_err(SessionError::from))
                    .map_err(SessionError::into_capture_failure)
                    .map(|_| {
                        let id = path
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .and_then(|s| Uuid::parse_str(s).ok())
                            .unwrap_or_else(Uuid::new_v4);
                        FileArtifact {
                            id,
                            path: path.clone(),
                            bytes_written,
                            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                        }
                    });

                tracing::debug!(
                    "Virtual movie writer finished: {} frames, {} bytes",
                    frames.load(Ordering::SeqCst),
                    bytes_written
                );
                let _ = tx.send(result);
            })?;

        Ok(writer)
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn interrupt(&self, reason: String) {
        *self.failure.lock() = Some(reason);
    }
}

/// A capture backend backed entirely by software
pub struct VirtualBackend {
    devices: Vec<DeviceDescriptor>,
    registry: DeviceRegistry,
    permission: Mutex<PermissionState>,
    faults: Mutex<Faults>,
    session: Mutex<VirtualSession>,
    commits: AtomicU64,
    frame_size: (u32, u32),
    photo_latency: Duration,
    frame_interval: Duration,
}

impl VirtualBackend {
    /// Back camera with flash, front camera without, and a microphone
    pub fn new() -> Self {
        Self::with_devices(Self::default_devices())
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            registry: DeviceRegistry::new(),
            permission: Mutex::new(PermissionState {
                status: AuthorizationStatus::NotDetermined,
                grant_on_request: true,
            }),
            faults: Mutex::new(Faults::default()),
            session: Mutex::new(VirtualSession::default()),
            commits: AtomicU64::new(0),
            frame_size: DEFAULT_FRAME_SIZE,
            photo_latency: DEFAULT_PHOTO_LATENCY,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    pub fn default_devices() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor {
                id: "virtual-back".to_string(),
                name: "Virtual Back Camera".to_string(),
                role: DeviceRole::Video,
                position: DevicePosition::Back,
                capabilities: DeviceCapabilities::camera(10.0, true),
            },
            DeviceDescriptor {
                id: "virtual-front".to_string(),
                name: "Virtual Front Camera".to_string(),
                role: DeviceRole::Video,
                position: DevicePosition::Front,
                capabilities: DeviceCapabilities::camera(3.0, false),
            },
            DeviceDescriptor {
                id: "virtual-mic".to_string(),
                name: "Virtual Microphone".to_string(),
                role: DeviceRole::Audio,
                position: DevicePosition::Unspecified,
                capabilities: DeviceCapabilities::microphone(),
            },
        ]
    }

    /// Answer to give when the permission prompt is shown
    pub fn with_permission_response(self, grant: bool) -> Self {
        self.permission.lock().grant_on_request = grant;
        self
    }

    pub fn with_authorization(self, status: AuthorizationStatus) -> Self {
        self.permission.lock().status = status;
        self
    }

    pub fn with_photo_latency(mut self, latency: Duration) -> Self {
        self.photo_latency = latency;
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = (width.max(1), height.max(1));
        self
    }

    // ===== Fault injection =====

    /// Simulate the user changing the permission in system settings
    pub fn set_authorization(&self, status: AuthorizationStatus) {
        self.permission.lock().status = status;
    }

    pub fn make_unavailable(&self, device_id: &str) {
        self.faults.lock().unopenable.insert(device_id.to_string());
    }

    /// Open succeeds but the session refuses the device as an input
    pub fn reject_input(&self, device_id: &str) {
        self.faults.lock().rejected_inputs.insert(device_id.to_string());
    }

    /// Clear `make_unavailable` and `reject_input` for a device
    pub fn make_available(&self, device_id: &str) {
        let mut faults = self.faults.lock();
        faults.unopenable.remove(device_id);
        faults.rejected_inputs.remove(device_id);
    }

    pub fn reject_output(&self, output: OutputKind) {
        self.faults.lock().rejected_outputs.insert(output);
    }

    pub fn fail_streaming(&self, fail: bool) {
        self.faults.lock().fail_streaming = fail;
    }

    pub fn fail_next_photo(&self, reason: &str) {
        self.faults.lock().fail_next_photo = Some(reason.to_string());
    }

    pub fn fail_next_recording(&self, reason: &str) {
        self.faults.lock().fail_next_recording = Some(reason.to_string());
    }

    /// Kill the active recording as if the device failed mid-capture
    pub fn interrupt_recording(&self, reason: &str) -> bool {
        match self.session.lock().recorder.take() {
            Some(recorder) => {
                recorder.interrupt(reason.to_string());
                true
            }
            None => false,
        }
    }

    // ===== Inspection =====

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn input_ids(&self) -> Vec<String> {
        self.session.lock().inputs.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn has_output(&self, output: OutputKind) -> bool {
        self.session.lock().outputs.contains(&output)
    }

    pub fn is_configuring(&self) -> bool {
        self.session.lock().configuration_depth > 0
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn zoom_of(&self, device_id: &str) -> Option<f64> {
        self.session.lock().zoom.get(device_id).copied()
    }

    pub fn last_photo_settings(&self) -> Option<PhotoSettings> {
        self.session.lock().last_photo_settings
    }

    pub fn is_recording(&self) -> bool {
        self.session.lock().recorder.is_some()
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a gradient frame and encode it as PNG
fn encode_frame(width: u32, height: u32, flash: FlashMode) -> SessionResult<Vec<u8>> {
    let boost: u8 = match flash {
        FlashMode::Off => 0,
        FlashMode::On | FlashMode::Auto => 64,
    };

    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let r = ((x * 255) / width.max(1)) as u8;
            let g = ((y * 255) / height.max(1)) as u8;
            pixels.extend_from_slice(&[r.saturating_add(boost), g.saturating_add(boost), 128, 255]);
        }
    }

    let mut data = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut data, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| SessionError::CaptureFailed(format!("PNG header: {}", e)))?;
        writer
            .write_image_data(&pixels)
            .map_err(|e| SessionError::CaptureFailed(format!("PNG encode: {}", e)))?;
    }
    Ok(data)
}

#[async_trait]
impl CaptureBackend for VirtualBackend {
    fn authorization_status(&self) -> AuthorizationStatus {
        self.permission.lock().status
    }

    async fn request_access(&self) -> bool {
        // The prompt is answered off the caller's poll
        tokio::task::yield_now().await;

        let mut permission = self.permission.lock();
        if permission.status == AuthorizationStatus::NotDetermined {
            permission.status = if permission.grant_on_request {
                AuthorizationStatus::Authorized
            } else {
                AuthorizationStatus::Denied
            };
        }
        permission.status.is_authorized()
    }

    fn enumerate(&self, role: DeviceRole, position: Option<DevicePosition>) -> Option<DeviceDescriptor> {
        self.devices
            .iter()
            .find(|d| d.role == role && position.map_or(true, |p| d.position == p))
            .cloned()
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> SessionResult<DeviceHandle> {
        if self.faults.lock().unopenable.contains(&descriptor.id) {
            return Err(SessionError::DeviceUnavailable(format!(
                "{} could not be opened",
                descriptor.name
            )));
        }
        self.registry.claim(descriptor.clone())
    }

    fn begin_configuration(&self) {
        self.session.lock().configuration_depth += 1;
    }

    fn commit_configuration(&self) {
        let mut session = self.session.lock();
        session.configuration_depth = session.configuration_depth.saturating_sub(1);
        if session.configuration_depth == 0 {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn add_input(&self, handle: &DeviceHandle) -> SessionResult<()> {
        if self.faults.lock().rejected_inputs.contains(handle.id()) {
            return Err(SessionError::ConfigurationFailed(format!(
                "Session cannot use {} as an input",
                handle.name()
            )));
        }

        let mut session = self.session.lock();
        if session.inputs.iter().any(|(_, role)| *role == handle.role()) {
            return Err(SessionError::ConfigurationFailed(format!(
                "Session already has a {:?} input",
                handle.role()
            )));
        }
        session.inputs.push((handle.id().to_string(), handle.role()));
        session.zoom.insert(handle.id().to_string(), handle.capabilities().min_zoom);
        Ok(())
    }

    fn remove_input(&self, handle: &DeviceHandle) {
        let mut session = self.session.lock();
        session.inputs.retain(|(id, _)| id != handle.id());
        session.zoom.remove(handle.id());
    }

    fn add_output(&self, output: OutputKind) -> SessionResult<()> {
        if self.faults.lock().rejected_outputs.contains(&output) {
            return Err(SessionError::ConfigurationFailed(format!(
                "Cannot add {:?} output",
                output
            )));
        }
        self.session.lock().outputs.insert(output);
        Ok(())
    }

    fn set_zoom(&self, handle: &DeviceHandle, factor: f64) -> SessionResult<()> {
        let caps = handle.capabilities();
        if !(caps.min_zoom..=caps.max_zoom).contains(&factor) {
            return Err(SessionError::ConfigurationFailed(format!(
                "Zoom {} outside [{}, {}]",
                factor, caps.min_zoom, caps.max_zoom
            )));
        }

        let mut session = self.session.lock();
        match session.zoom.get_mut(handle.id()) {
            Some(zoom) => {
                *zoom = factor;
                Ok(())
            }
            None => Err(SessionError::ConfigurationFailed(format!(
                "{} is not attached",
                handle.name()
            ))),
        }
    }

    fn start_streaming(&self) -> SessionResult<()> {
        if self.faults.lock().fail_streaming {
            return Err(SessionError::ConfigurationFailed(
                "Streaming could not start".to_string(),
            ));
        }

        let mut session = self.session.lock();
        if !session.inputs.iter().any(|(_, role)| *role == DeviceRole::Video) {
            return Err(SessionError::ConfigurationFailed(
                "No video input attached".to_string(),
            ));
        }
        session.streaming = true;
        Ok(())
    }

    fn stop_streaming(&self) {
        let mut session = self.session.lock();
        session.streaming = false;
        if let Some(recorder) = session.recorder.take() {
            recorder.finish();
        }
    }

    fn is_streaming(&self) -> bool {
        self.session.lock().streaming
    }

    fn capture_photo(&self, settings: &PhotoSettings) -> SessionResult<Completion<ImageArtifact>> {
        {
            let mut session = self.session.lock();
            if !session.streaming {
                return Err(SessionError::CaptureFailed("Session is not streaming".to_string()));
            }
            if !session.outputs.contains(&OutputKind::Photo) {
                return Err(SessionError::CaptureFailed("No photo output".to_string()));
            }
            session.last_photo_settings = Some(*settings);
        }

        let failure = self.faults.lock().fail_next_photo.take();
        let (tx, rx) = completion();
        let (width, height) = self.frame_size;
        let latency = self.photo_latency;
        let flash = settings.flash_mode;

        thread::Builder::new()
            .name("virtual-photo".to_string())
            .spawn(move || {
                thread::sleep(latency);
                let result = match failure {
                    Some(reason) => Err(SessionError::CaptureFailed(reason)),
                    None => encode_frame(width, height, flash)
                        .map(|data| ImageArtifact::new(width, height, data)),
                };
                let _ = tx.send(result);
            })?;

        Ok(rx)
    }

    fn start_recording(&self, path: &Path) -> SessionResult<Completion<FileArtifact>> {
        let mut session = self.session.lock();
        if !session.streaming {
            return Err(SessionError::CaptureFailed("Session is not streaming".to_string()));
        }
        if !session.outputs.contains(&OutputKind::Movie) {
            return Err(SessionError::CaptureFailed("No movie output".to_string()));
        }
        if session.recorder.is_some() {
            return Err(SessionError::CaptureFailed("Already recording".to_string()));
        }
        if let Some(reason) = self.faults.lock().fail_next_recording.take() {
            return Err(SessionError::CaptureFailed(reason));
        }

        let (tx, rx) = completion();
        let writer = MovieWriter::spawn(path.to_path_buf(), self.frame_interval, tx)?;
        session.recorder = Some(writer);

        tracing::debug!("Virtual recording started: {:?}", path);
        Ok(rx)
    }

    fn stop_recording(&self) -> SessionResult<()> {
        match self.session.lock().recorder.take() {
            Some(recorder) => {
                recorder.finish();
                Ok(())
            }
            None => Err(SessionError::CaptureFailed("No active recording".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_backend() -> (VirtualBackend, DeviceHandle) {
        let backend = VirtualBackend::new();
        let descriptor = backend
            .enumerate(DeviceRole::Video, Some(DevicePosition::Back))
            .unwrap();
        let handle = backend.open(&descriptor).unwrap();
        backend.begin_configuration();
        backend.add_input(&handle).unwrap();
        backend.add_output(OutputKind::Photo).unwrap();
        backend.add_output(OutputKind::Movie).unwrap();
        backend.commit_configuration();
        backend.start_streaming().unwrap();
        (backend, handle)
    }

    fn settings() -> PhotoSettings {
        PhotoSettings {
            flash_mode: FlashMode::Off,
            high_resolution: true,
            quality: Default::default(),
        }
    }

    #[test]
    fn test_enumerate_by_position() {
        let backend = VirtualBackend::new();
        let front = backend
            .enumerate(DeviceRole::Video, Some(DevicePosition::Front))
            .unwrap();
        assert_eq!(front.id, "virtual-front");
        assert!(backend.enumerate(DeviceRole::Audio, None).is_some());
    }

    #[test]
    fn test_unavailable_device_fails_open() {
        let backend = VirtualBackend::new();
        backend.make_unavailable("virtual-front");
        let front = backend
            .enumerate(DeviceRole::Video, Some(DevicePosition::Front))
            .unwrap();

        let result = backend.open(&front);
        assert!(matches!(result, Err(SessionError::DeviceUnavailable(_))));
        assert!(!backend.registry().is_claimed("virtual-front"));
    }

    #[test]
    fn test_second_video_input_rejected() {
        let (backend, _handle) = started_backend();
        let front = backend
            .enumerate(DeviceRole::Video, Some(DevicePosition::Front))
            .unwrap();
        let front = backend.open(&front).unwrap();

        assert!(matches!(
            backend.add_input(&front),
            Err(SessionError::ConfigurationFailed(_))
        ));
    }

    #[test]
    fn test_zoom_outside_hardware_range_rejected() {
        let (backend, handle) = started_backend();
        assert!(backend.set_zoom(&handle, 11.0).is_err());
        backend.set_zoom(&handle, 2.5).unwrap();
        assert_eq!(backend.zoom_of("virtual-back"), Some(2.5));
    }

    #[test]
    fn test_commit_counts_outermost_bracket() {
        let backend = VirtualBackend::new();
        backend.begin_configuration();
        backend.begin_configuration();
        backend.commit_configuration();
        assert!(backend.is_configuring());
        assert_eq!(backend.commit_count(), 0);
        backend.commit_configuration();
        assert!(!backend.is_configuring());
        assert_eq!(backend.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_photo_completes_with_png() {
        let (backend, _handle) = started_backend();
        let rx = backend.capture_photo(&settings()).unwrap();

        let image = rx.await.unwrap().unwrap();
        assert!(!image.is_empty());
        assert_eq!(&image.data[1..4], b"PNG");
        assert_eq!((image.width, image.height), DEFAULT_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_injected_photo_failure_is_async() {
        let (backend, _handle) = started_backend();
        backend.fail_next_photo("sensor timeout");

        let rx = backend.capture_photo(&settings()).unwrap();
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(SessionError::CaptureFailed(ref r)) if r == "sensor timeout"));
    }

    #[test]
    fn test_rejected_input_until_available() {
        let backend = VirtualBackend::new();
        backend.reject_input("virtual-back");
        let back = backend
            .enumerate(DeviceRole::Video, Some(DevicePosition::Back))
            .unwrap();
        let handle = backend.open(&back).unwrap();

        assert!(matches!(
            backend.add_input(&handle),
            Err(SessionError::ConfigurationFailed(_))
        ));
        assert!(backend.input_ids().is_empty());

        backend.make_available("virtual-back");
        backend.add_input(&handle).unwrap();
        assert_eq!(backend.input_ids(), vec!["virtual-back"]);
    }

    #[tokio::test]
    async fn test_photo_uses_frame_size() {
        let backend = VirtualBackend::new().with_frame_size(8, 4);
        let back = backend
            .enumerate(DeviceRole::Video, Some(DevicePosition::Back))
            .unwrap();
        let handle = backend.open(&back).unwrap();
        backend.add_input(&handle).unwrap();
        backend.add_output(OutputKind::Photo).unwrap();
        backend.start_streaming().unwrap();

        let image = backend.capture_photo(&settings()).unwrap().await.unwrap().unwrap();
        assert_eq!((image.width, image.height), (8, 4));
    }

    #[test]
    fn test_photo_requires_streaming() {
        let backend = VirtualBackend::new();
        assert!(backend.capture_photo(&settings()).is_err());
    }

    #[tokio::test]
    async fn test_recording_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{}.mov", Uuid::new_v4()));
        let (backend, _handle) = started_backend();

        let rx = backend.start_recording(&path).unwrap();
        assert!(path.exists());
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.stop_recording().unwrap();

        let movie = rx.await.unwrap().unwrap();
        assert_eq!(movie.path, path);
        assert!(movie.bytes_written > 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), movie.bytes_written);
    }

    #[tokio::test]
    async fn test_interrupted_recording_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _handle) = started_backend();

        let rx = backend.start_recording(&dir.path().join("take.mov")).unwrap();
        assert!(backend.interrupt_recording("device disconnected"));

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(SessionError::CaptureFailed(_))));
        assert!(backend.stop_recording().is_err());
    }

    #[tokio::test]
    async fn test_request_access_answers_once() {
        let backend = VirtualBackend::new().with_permission_response(false);
        assert!(!backend.request_access().await);
        assert_eq!(backend.authorization_status(), AuthorizationStatus::Denied);

        backend.set_authorization(AuthorizationStatus::Authorized);
        assert!(backend.request_access().await);
    }
}
