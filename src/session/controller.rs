//! Session coordinator
//!
//! Accepts commands, serializes them onto the reconfiguration queue, keeps the
//! session state consistent with the hardware, tracks capture operations and
//! publishes every change to the state sink.

use super::operation::{CaptureKind, CaptureOperation, CapturePhase, CaptureStatus, OperationId};
use super::queue::{ReconfigurationQueue, Reply, WeakQueueHandle};
use super::sink::{BroadcastSink, StateSink};
use super::state::{SessionSnapshot, SessionState, ZoomRange};
use crate::capture::device::DeviceHandle;
use crate::capture::traits::{
    Artifact, AuthorizationStatus, CaptureBackend, Completion, DevicePosition, DeviceRole,
    FlashMode, OutputKind, PhotoSettings,
};
use crate::config::SessionConfig;
use crate::utils::error::{ErrorReport, SessionError, SessionResult};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

/// Name of the worker thread
const WORKER_NAME: &str = "camera-session";

/// Begin/commit bracket around a hardware reconfiguration
///
/// Commits on drop, so early returns still close the bracket.
struct Reconfiguration<'a> {
    backend: &'a dyn CaptureBackend,
}

impl<'a> Reconfiguration<'a> {
    fn begin(backend: &'a dyn CaptureBackend) -> Self {
        backend.begin_configuration();
        Self { backend }
    }
}

impl Drop for Reconfiguration<'_> {
    fn drop(&mut self) {
        self.backend.commit_configuration();
    }
}

/// Open a camera at exactly `position` and add it to the session
fn attach_camera(backend: &dyn CaptureBackend, position: DevicePosition) -> SessionResult<DeviceHandle> {
    let descriptor = backend
        .enumerate(DeviceRole::Video, Some(position))
        .ok_or_else(|| SessionError::DeviceUnavailable(format!("No {:?} camera", position)))?;
    let handle = backend.open(&descriptor)?;
    backend.add_input(&handle)?;
    Ok(handle)
}

/// Open the default microphone. Missing audio is not an error.
fn attach_microphone(backend: &dyn CaptureBackend) -> Option<DeviceHandle> {
    let descriptor = backend.enumerate(DeviceRole::Audio, None)?;
    match backend
        .open(&descriptor)
        .and_then(|handle| backend.add_input(&handle).map(|_| handle))
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Continuing without audio: {}", e);
            None
        }
    }
}

/// Everything queued tasks operate on; lives on the worker thread
struct SessionWorker {
    state: SessionState,
    backend: Arc<dyn CaptureBackend>,
    sink: Arc<dyn StateSink>,
    config: SessionConfig,
    published: Arc<RwLock<SessionSnapshot>>,
    runtime: Handle,
    queue: WeakQueueHandle<SessionWorker>,
}

impl SessionWorker {
    fn zoom_range(&self) -> ZoomRange {
        let (min, max) = (self.config.min_zoom, self.config.max_zoom);
        match self.state.video_device() {
            Some(video) => ZoomRange::effective(
                min,
                max,
                video.capabilities().min_zoom,
                self.backend.max_zoom_factor(video),
            ),
            None => ZoomRange::effective(min, max, min, max),
        }
    }

    /// Copy the state out to observers
    fn publish(&self) {
        let snapshot = self.state.snapshot(self.zoom_range());
        *self.published.write() = snapshot.clone();
        self.sink.publish_snapshot(snapshot);
    }

    fn report(&self, error: &SessionError) {
        self.sink.publish_error(ErrorReport::from(error));
    }

    fn ensure_authorized(&self) -> SessionResult<()> {
        match self.state.authorization {
            AuthorizationStatus::Authorized => Ok(()),
            status => Err(SessionError::PermissionDenied(format!(
                "Camera access is {:?}",
                status
            ))),
        }
    }

    fn ensure_no_capture(&self) -> SessionResult<()> {
        if let Some(photo) = &self.state.photo {
            return Err(SessionError::OperationInProgress(format!(
                "Photo capture {} is {}",
                photo.id,
                photo.phase()
            )));
        }
        if let Some(recording) = &self.state.recording {
            return Err(SessionError::OperationInProgress(format!(
                "Recording {} is {}",
                recording.id,
                recording.phase()
            )));
        }
        Ok(())
    }

    fn ensure_running(&self) -> SessionResult<()> {
        if !self.state.running || self.state.video_device().is_none() {
            return Err(SessionError::DeviceUnavailable(
                "Session is not running".to_string(),
            ));
        }
        Ok(())
    }

    /// Reset zoom to the lower bound of the attached camera
    fn reset_zoom(&mut self) {
        let zoom = self.zoom_range().min;
        self.apply_zoom(zoom);
    }

    /// Push a zoom factor to the attached camera, clamped into its range
    fn apply_zoom(&mut self, requested: f64) {
        let zoom = self.zoom_range().clamp(requested);
        if let Some(video) = self.state.video_device() {
            if let Err(e) = self.backend.set_zoom(video, zoom) {
                tracing::warn!("Failed to set zoom on {}: {}", video.name(), e);
            }
        }
        self.state.zoom_factor = zoom;
    }

    fn apply_authorization(&mut self, status: AuthorizationStatus) {
        tracing::info!("Camera authorization: {:?}", status);
        self.state.authorization = status;
        self.sink.publish_authorization(status);
        self.publish();

        if status.is_authorized() && self.config.start_on_authorization && !self.state.running {
            if let Err(e) = self.start_session() {
                tracing::warn!("Automatic session start failed: {}", e);
                self.report(&e);
            }
        }
    }

    fn start_session(&mut self) -> SessionResult<()> {
        self.ensure_authorized()?;
        if self.state.running {
            tracing::debug!("Session already running");
            return Ok(());
        }

        tracing::info!("Starting capture session");
        let backend = self.backend.clone();
        let preferred = self.config.preferred_position;

        let (video, audio) = {
            let _bracket = Reconfiguration::begin(backend.as_ref());

            let video = match attach_camera(backend.as_ref(), preferred) {
                Ok(video) => video,
                Err(e) => {
                    tracing::warn!("Preferred {:?} camera unavailable: {}", preferred, e);
                    attach_camera(backend.as_ref(), preferred.opposite())?
                }
            };

            if !self.state.outputs_ready {
                for output in [OutputKind::Photo, OutputKind::Movie] {
                    if let Err(e) = backend.add_output(output) {
                        backend.remove_input(&video);
                        return Err(e);
                    }
                }
                self.state.outputs_ready = true;
            }

            let audio = if self.config.capture_audio {
                attach_microphone(backend.as_ref())
            } else {
                None
            };
            (video, audio)
        };

        if let Err(e) = backend.start_streaming() {
            let _bracket = Reconfiguration::begin(backend.as_ref());
            backend.remove_input(&video);
            if let Some(audio) = &audio {
                backend.remove_input(audio);
            }
            return Err(SessionError::ConfigurationFailed(format!(
                "Streaming did not start: {}",
                e.reason()
            )));
        }

        tracing::info!(
            "Session running with {}{}",
            video.name(),
            audio
                .as_ref()
                .map(|a| format!(" and {}", a.name()))
                .unwrap_or_default()
        );
        self.state.attach(video)?;
        if let Some(audio) = audio {
            self.state.attach(audio)?;
        }
        self.state.running = true;
        self.reset_zoom();
        self.publish();
        Ok(())
    }

    /// Remove and release every attached input
    fn release_inputs(&mut self) {
        let backend = self.backend.clone();
        let _bracket = Reconfiguration::begin(backend.as_ref());
        for role in [DeviceRole::Audio, DeviceRole::Video] {
            if let Some(handle) = self.state.detach(role) {
                backend.remove_input(&handle);
            }
        }
    }

    fn stop_session(&mut self) -> SessionResult<()> {
        let attached = self.state.video_device().is_some() || self.state.audio_device().is_some();
        if !self.state.running && !attached {
            tracing::debug!("Session already stopped");
            return Ok(());
        }

        tracing::info!("Stopping capture session");
        if self.state.recording.is_some() {
            // Completion is still delivered through the recording's watcher
            if let Err(e) = self.stop_recording() {
                tracing::warn!("Recording did not stop cleanly: {}", e);
            }
        }

        if self.state.running {
            self.backend.stop_streaming();
        }
        self.release_inputs();

        self.state.running = false;
        self.publish();
        Ok(())
    }

    fn switch_camera(&mut self) -> SessionResult<DevicePosition> {
        self.ensure_authorized()?;
        self.ensure_running()?;
        let current = self
            .state
            .detach(DeviceRole::Video)
            .ok_or_else(|| SessionError::DeviceUnavailable("No camera attached".to_string()))?;
        let target = current.position().opposite();
        tracing::info!("Switching from {} to {:?} camera", current.name(), target);

        let backend = self.backend.clone();
        let outcome = {
            let _bracket = Reconfiguration::begin(backend.as_ref());
            backend.remove_input(&current);

            match attach_camera(backend.as_ref(), target) {
                Ok(next) => {
                    drop(current);
                    self.state.attach(next).map(|_| target)
                }
                Err(error) => {
                    tracing::warn!("Cannot switch to {:?} camera: {}", target, error);
                    match backend.add_input(&current) {
                        Ok(()) => {
                            self.state.attach(current)?;
                            Err(SessionError::DeviceUnavailable(error.reason()))
                        }
                        Err(restore_error) => {
                            tracing::error!(
                                "Failed to restore {}: {}",
                                current.name(),
                                restore_error
                            );
                            Err(SessionError::DeviceUnavailable(format!(
                                "Neither camera could be attached: {}",
                                error.reason()
                            )))
                        }
                    }
                }
            }
        };

        if self.state.video_device().is_none() {
            // Total failure: nothing left to stream from
            backend.stop_streaming();
            self.release_inputs();
            self.state.running = false;
        } else if outcome.is_ok() {
            self.reset_zoom();
        } else {
            // Re-adding the input reset the hardware zoom
            self.apply_zoom(self.state.zoom_factor);
        }
        self.publish();
        outcome
    }

    fn set_zoom(&mut self, requested: f64) -> SessionResult<f64> {
        let clamped = self.zoom_range().clamp(requested);
        let video = self.state.video_device().ok_or_else(|| {
            SessionError::DeviceUnavailable("No camera attached to zoom".to_string())
        })?;

        self.backend.set_zoom(video, clamped)?;
        if clamped != requested {
            tracing::debug!("Zoom {} clamped to {}", requested, clamped);
        }
        self.state.zoom_factor = clamped;
        self.publish();
        Ok(clamped)
    }

    fn set_flash_mode(&mut self, mode: FlashMode) -> FlashMode {
        self.state.flash_mode = mode;
        tracing::debug!("Flash mode set to {:?}", mode);
        self.publish();
        mode
    }

    fn photo_settings(&self) -> PhotoSettings {
        let has_flash = self
            .state
            .video_device()
            .map(|video| video.capabilities().has_flash)
            .unwrap_or(false);
        PhotoSettings {
            flash_mode: if has_flash {
                self.state.flash_mode
            } else {
                FlashMode::Off
            },
            high_resolution: self.config.high_resolution_photos,
            quality: self.config.quality_prioritization,
        }
    }

    fn capture_photo(&mut self) -> SessionResult<CaptureOperation> {
        self.ensure_authorized()?;
        self.ensure_no_capture()?;
        self.ensure_running()?;

        let settings = self.photo_settings();
        let mut operation = CaptureOperation::photo();
        self.sink.publish_capture(operation.clone());

        match self.backend.capture_photo(&settings) {
            Ok(completion) => {
                operation
                    .start()
                    .map_err(|e| SessionError::CaptureFailed(e.to_string()))?;
                tracing::info!("Photo capture {} issued ({:?} flash)", operation.id, settings.flash_mode);
                self.sink.publish_capture(operation.clone());
                self.watch(operation.id, completion, Artifact::Image);
                self.state.photo = Some(operation.clone());
                self.publish();
                Ok(operation)
            }
            Err(error) => Err(self.reject_capture(operation, error)),
        }
    }

    fn start_recording(&mut self) -> SessionResult<CaptureOperation> {
        self.ensure_authorized()?;
        self.ensure_no_capture()?;
        self.ensure_running()?;

        let dir = self.config.artifact_dir();
        std::fs::create_dir_all(&dir).map_err(|e| SessionError::from(e).into_capture_failure())?;
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), CaptureKind::Video.extension()));

        let mut operation = CaptureOperation::video(path.clone());
        self.sink.publish_capture(operation.clone());

        match self.backend.start_recording(&path) {
            Ok(completion) => {
                operation
                    .start()
                    .map_err(|e| SessionError::CaptureFailed(e.to_string()))?;
                tracing::info!("Recording {} to {:?}", operation.id, path);
                self.sink.publish_capture(operation.clone());
                self.watch(operation.id, completion, Artifact::Movie);
                self.state.recording = Some(operation.clone());
                self.state.stop_requested = false;
                self.publish();
                Ok(operation)
            }
            Err(error) => Err(self.reject_capture(operation, error)),
        }
    }

    fn stop_recording(&mut self) -> SessionResult<Option<OperationId>> {
        let Some(id) = self
            .state
            .recording
            .as_ref()
            .filter(|op| op.phase() == CapturePhase::Running)
            .map(|op| op.id)
        else {
            tracing::debug!("No active recording to stop");
            return Ok(None);
        };

        if self.state.stop_requested {
            return Ok(Some(id));
        }

        match self.backend.stop_recording() {
            Ok(()) => {
                tracing::info!("Stopping recording {}", id);
                self.state.stop_requested = true;
                Ok(Some(id))
            }
            Err(error) => {
                // The recording stays Running; its watcher delivers the real outcome
                tracing::warn!("Backend refused to stop recording {}: {}", id, error);
                Err(error.into_capture_failure())
            }
        }
    }

    /// Fail an operation the hardware refused outright
    fn reject_capture(&self, mut operation: CaptureOperation, error: SessionError) -> SessionError {
        let error = error.into_capture_failure();
        if let Err(e) = operation.fail(&error) {
            tracing::warn!("{}", e);
        }
        self.sink.publish_capture(operation);
        error
    }

    /// Forward a hardware completion back onto the queue
    fn watch<T, F>(&self, id: OperationId, completion: Completion<T>, into_artifact: F)
    where
        T: Send + 'static,
        F: FnOnce(T) -> Artifact + Send + 'static,
    {
        // Weak, so a pending completion never keeps a dropped session alive
        let queue = self.queue.clone();

        self.runtime.spawn(async move {
            let result = match completion.await {
                Ok(result) => result.map(into_artifact),
                Err(_) => Err(SessionError::CaptureFailed(
                    "Capture backend dropped the request".to_string(),
                )),
            };
            let submitted = queue.upgrade().map(|queue| {
                queue.submit(move |worker: &mut SessionWorker| worker.finish_capture(id, result))
            });
            if !matches!(submitted, Some(Ok(()))) {
                tracing::warn!("Session closed before capture {} finished", id);
            }
        });
    }

    /// Resolve an in-flight operation and hand its result to the sink
    fn finish_capture(&mut self, id: OperationId, result: SessionResult<Artifact>) {
        let slot = if self.state.photo.as_ref().is_some_and(|op| op.id == id) {
            &mut self.state.photo
        } else if self.state.recording.as_ref().is_some_and(|op| op.id == id) {
            self.state.stop_requested = false;
            &mut self.state.recording
        } else {
            tracing::warn!("Ignoring completion for unknown capture {}", id);
            return;
        };

        let Some(mut operation) = slot.take() else {
            return;
        };
        let result = match result {
            Ok(Artifact::Image(image)) => {
                let dir = self.config.artifact_dir();
                image
                    .persist(&dir)
                    .map(|path| {
                        operation.output_path = Some(path);
                        Artifact::Image(image)
                    })
                    .map_err(|e| SessionError::from(e).into_capture_failure())
            }
            other => other,
        };
        if let Err(e) = operation.resolve(result) {
            tracing::warn!("{}", e);
        }

        match &operation.status {
            CaptureStatus::Failed { reason, .. } => {
                tracing::warn!("Capture {} failed: {}", id, reason)
            }
            _ => tracing::info!("Capture {} {}", id, operation.phase()),
        }
        self.sink.publish_capture(operation);
        self.publish();
    }
}

/// Coordinator for one capture session
///
/// Every mutating call returns immediately with a [`Reply`]; the work runs on
/// the session worker in call order. Results are also published to the sink.
pub struct SessionController {
    queue: ReconfigurationQueue<SessionWorker>,
    backend: Arc<dyn CaptureBackend>,
    published: Arc<RwLock<SessionSnapshot>>,
    config: SessionConfig,
}

impl SessionController {
    /// Create a controller. Must be called from within a tokio runtime.
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn CaptureBackend>,
        sink: Arc<dyn StateSink>,
    ) -> SessionResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SessionError::Runtime(e.to_string()))?;

        let mut state = SessionState::new();
        state.zoom_factor = config.min_zoom;
        let initial = state.snapshot(ZoomRange::effective(
            config.min_zoom,
            config.max_zoom,
            config.min_zoom,
            config.max_zoom,
        ));
        let published = Arc::new(RwLock::new(initial));

        let worker_backend = backend.clone();
        let worker_published = published.clone();
        let worker_config = config.clone();
        let queue = ReconfigurationQueue::spawn_with(WORKER_NAME, move |queue| SessionWorker {
            state,
            backend: worker_backend,
            sink,
            config: worker_config,
            published: worker_published,
            runtime,
            queue,
        })?;

        tracing::info!("Session controller ready");
        Ok(Self {
            queue,
            backend,
            published,
            config,
        })
    }

    /// Create a controller publishing to a fresh [`BroadcastSink`]
    pub fn with_broadcast(
        config: SessionConfig,
        backend: Arc<dyn CaptureBackend>,
    ) -> SessionResult<(Self, Arc<BroadcastSink>)> {
        let sink = Arc::new(BroadcastSink::new(config.event_capacity));
        let controller = Self::new(config, backend, sink.clone())?;
        Ok((controller, sink))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Latest published state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.published.read().clone()
    }

    /// Queue a task, reporting its failure to the sink
    fn dispatch<F, R>(&self, name: &'static str, task: F) -> Reply<SessionResult<R>>
    where
        F: FnOnce(&mut SessionWorker) -> SessionResult<R> + Send + 'static,
        R: Send + 'static,
    {
        tracing::debug!("Queueing {}", name);
        self.queue.run(move |worker| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(worker))).unwrap_or_else(|_| {
                Err(SessionError::ConfigurationFailed(format!("{} panicked", name)))
            });
            if let Err(error) = &result {
                tracing::warn!("{} failed: {}", name, error);
                worker.report(error);
            }
            result
        })
    }

    /// Resolve camera access, prompting the user if nobody has answered yet
    ///
    /// Authorized is final. A stored denial is re-checked against the backend
    /// in case access was granted externally, but the prompt is not shown again.
    pub async fn request_authorization(&self) -> SessionResult<AuthorizationStatus> {
        let stored = self.snapshot().authorization;
        if stored.is_authorized() {
            return Ok(stored);
        }

        let status = match self.backend.authorization_status() {
            AuthorizationStatus::NotDetermined if stored.is_determined() => stored,
            AuthorizationStatus::NotDetermined => {
                tracing::info!("Requesting camera access");
                if self.backend.request_access().await {
                    AuthorizationStatus::Authorized
                } else {
                    match self.backend.authorization_status() {
                        AuthorizationStatus::Restricted => AuthorizationStatus::Restricted,
                        _ => AuthorizationStatus::Denied,
                    }
                }
            }
            status => status,
        };

        self.queue
            .run(move |worker| worker.apply_authorization(status))
            .wait()
            .await?;
        Ok(status)
    }

    /// Attach the default camera (and microphone) and start streaming
    pub fn start_session(&self) -> Reply<SessionResult<()>> {
        self.dispatch("startSession", |worker| worker.start_session())
    }

    /// Stop streaming and release every device
    pub fn stop_session(&self) -> Reply<SessionResult<()>> {
        self.dispatch("stopSession", |worker| worker.stop_session())
    }

    /// Swap to the camera on the other side; the old one stays on failure
    pub fn switch_camera(&self) -> Reply<SessionResult<DevicePosition>> {
        self.dispatch("switchCamera", |worker| worker.switch_camera())
    }

    /// Apply a zoom factor, clamped into the allowed range. Replies with the applied value.
    pub fn set_zoom(&self, requested: f64) -> Reply<SessionResult<f64>> {
        self.dispatch("setZoom", move |worker| worker.set_zoom(requested))
    }

    /// Flash mode for subsequent photos
    pub fn set_flash_mode(&self, mode: FlashMode) -> Reply<SessionResult<FlashMode>> {
        self.dispatch("setFlashMode", move |worker| Ok(worker.set_flash_mode(mode)))
    }

    /// Advance flash: off -> on -> auto -> off
    pub fn cycle_flash(&self) -> Reply<SessionResult<FlashMode>> {
        self.dispatch("cycleFlash", |worker| {
            let next = worker.state.flash_mode.next();
            Ok(worker.set_flash_mode(next))
        })
    }

    /// Take a still photo; the result arrives through the sink
    pub fn capture_photo(&self) -> Reply<SessionResult<CaptureOperation>> {
        self.dispatch("capturePhoto", |worker| worker.capture_photo())
    }

    /// Start recording a movie to a fresh file in the artifact directory
    pub fn start_recording(&self) -> Reply<SessionResult<CaptureOperation>> {
        self.dispatch("startRecording", |worker| worker.start_recording())
    }

    /// Stop the active recording. Without one this is a no-op replying `None`.
    pub fn stop_recording(&self) -> Reply<SessionResult<Option<OperationId>>> {
        self.dispatch("stopRecording", |worker| worker.stop_recording())
    }

    /// Resolves once everything queued before it has run
    pub fn flush(&self) -> Reply<()> {
        self.queue.flush()
    }

    /// Stop the session and release the controller
    pub async fn close(self) -> SessionResult<()> {
        self.stop_session().outcome().await
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Runs ahead of the worker exiting, so devices and recordings are released
        let submitted = self.queue.submit(|worker| {
            if let Err(e) = worker.stop_session() {
                tracing::warn!("Session teardown failed: {}", e);
            }
        });
        if submitted.is_err() {
            tracing::warn!("Session worker already gone at teardown");
        }
    }
}
