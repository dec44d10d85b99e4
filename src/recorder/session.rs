use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;

use super::aiff::{AiffSpec, AiffWriter};
use super::control::{
    ControlAck, ControlChannel, ControlEndpoint, ControlSignal, HandshakeError, SessionState,
    control_channel,
};
use super::errors::{RecorderError, Result};
use super::source::{SampleSource, SampleStream, StreamParams};

type FileWriter = AiffWriter<BufWriter<File>>;

/// One capture lifecycle: a device, a destination file and the thread that fills it.
#[derive(Debug)]
pub struct RecordingSession {
    id: String,
    device_index: usize,
    started_at: DateTime<Local>,
    control: ControlChannel,
    /// Loop side of the handshake, handed to the capture thread on start.
    endpoint: Mutex<Option<ControlEndpoint>>,
    fields: Mutex<SessionFields>,
    frames_written: Arc<AtomicU64>,
}

#[derive(Debug, Default)]
struct SessionFields {
    recording: bool,
    file_path: Option<PathBuf>,
    capture: Option<JoinHandle<()>>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub device_index: usize,
    pub started_at: DateTime<Local>,
    pub file_path: Option<PathBuf>,
    pub recording: bool,
    pub state: SessionState,
    pub frames_written: u64,
}

/// How the stop handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopOutcome {
    /// The capture thread has exited or is about to; joining it is bounded.
    Finished,
    /// The capture thread never answered; it was left to kill itself.
    Abandoned,
}

impl RecordingSession {
    pub fn new(id: impl Into<String>, device_index: usize) -> Self {
        let (control, endpoint) = control_channel();

        RecordingSession {
            id: id.into(),
            device_index,
            started_at: Local::now(),
            control,
            endpoint: Mutex::new(Some(endpoint)),
            fields: Mutex::new(SessionFields::default()),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn is_recording(&self) -> bool {
        self.fields.lock().recording
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.fields.lock().file_path.clone()
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> SessionInfo {
        let fields = self.fields.lock();
        SessionInfo {
            id: self.id.clone(),
            device_index: self.device_index,
            started_at: self.started_at,
            file_path: fields.file_path.clone(),
            recording: fields.recording,
            state: self.control.state(),
            frames_written: self.frames_written(),
        }
    }

    /// Creates the container at `destination` and starts the capture thread.
    ///
    /// Returns once the device stream is open, so device errors reach the caller.
    /// If `destination` already exists a numbered sibling is used instead; the
    /// returned path is the file actually being written. A session can only be
    /// started once.
    #[tracing::instrument(skip(self, source), fields(session = %self.id))]
    pub fn start(
        &self,
        source: Arc<dyn SampleSource>,
        destination: PathBuf,
        spec: AiffSpec,
        params: StreamParams,
        ack_timeout: Option<Duration>,
    ) -> Result<PathBuf> {
        let mut fields = self.fields.lock();

        if self.endpoint.lock().is_none() {
            tracing::error!("Session {} was already started", self.id);
            return Err(RecorderError::AlreadyExists(self.id.clone()));
        }

        if params.channels != spec.channels {
            return Err(RecorderError::InvalidChannelCount(params.channels));
        }
        let (writer, destination) = AiffWriter::create_unique(&destination, spec)?;

        // only taken once the container exists, so a failed start can be retried
        let Some(endpoint) = self.endpoint.lock().take() else {
            drop(writer);
            discard_placeholder(&destination);
            return Err(RecorderError::AlreadyExists(self.id.clone()));
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let capture = CaptureLoop {
            session_id: self.id.clone(),
            device_index: self.device_index,
            params,
            destination: destination.clone(),
            endpoint,
            ack_timeout,
            frames_written: self.frames_written.clone(),
        };

        tracing::debug!("Spawning capture thread");
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", self.id))
            .spawn(move || capture.run(source, writer, ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!("Failed to spawn capture thread: {}", error);
                discard_placeholder(&destination);
                return Err(error.into());
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let _ = handle.join();
                return Err(error);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(RecorderError::CapturePanicked(self.id.clone()));
            }
        }

        fields.recording = true;
        fields.file_path = Some(destination.clone());
        fields.capture = Some(handle);
        tracing::info!("Recording started");
        Ok(destination)
    }

    /// Runs the stop handshake and returns the finished file path.
    ///
    /// When a phase of the handshake exceeds `timeout` the request is escalated to
    /// a kill. If that is not answered either, the capture thread is detached and
    /// `StopTimedOut` is returned; the thread finalizes the file when it wakes up.
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub fn stop(&self, timeout: Option<Duration>) -> Result<PathBuf> {
        if !self.is_recording() {
            return Err(RecorderError::NotRecording(self.id.clone()));
        }

        let outcome = match self.control.request(ControlSignal::Stop, timeout) {
            Ok(ack) => {
                tracing::debug!("Capture loop acknowledged stop with {:?}", ack);
                StopOutcome::Finished
            }
            Err(HandshakeError::Disconnected) => {
                tracing::warn!("Capture loop had already exited");
                StopOutcome::Finished
            }
            Err(HandshakeError::Rejected(state)) => match state {
                SessionState::Stopped | SessionState::Killed => StopOutcome::Finished,
                SessionState::StopRequested | SessionState::KillRequested => {
                    return Err(RecorderError::StopInProgress(self.id.clone()));
                }
                SessionState::Idle | SessionState::Recording => {
                    return Err(RecorderError::NotRecording(self.id.clone()));
                }
            },
            Err(HandshakeError::TimedOut) => {
                tracing::warn!("Stop was not acknowledged within {:?}, escalating to kill", timeout);
                self.escalate(timeout)
            }
        };

        // held across the join: the path is only reported once the file is final
        let mut fields = self.fields.lock();
        if !fields.recording {
            return Err(RecorderError::NotRecording(self.id.clone()));
        }

        let handle = fields.capture.take();
        let mut panicked = false;
        match outcome {
            StopOutcome::Finished => {
                if let Some(handle) = handle {
                    panicked = handle.join().is_err();
                }
            }
            StopOutcome::Abandoned => {
                tracing::error!("Capture thread did not respond, detaching it");
                drop(handle);
            }
        }

        fields.recording = false;
        let path = fields
            .file_path
            .clone()
            .ok_or_else(|| RecorderError::NotRecording(self.id.clone()))?;
        drop(fields);

        if panicked {
            return Err(RecorderError::CapturePanicked(self.id.clone()));
        }
        if let StopOutcome::Abandoned = outcome {
            return Err(RecorderError::StopTimedOut {
                id: self.id.clone(),
                path,
                timeout: timeout.unwrap_or_default(),
            });
        }

        tracing::info!("Recording stopped, file at {}", path.display());
        Ok(path)
    }

    fn escalate(&self, timeout: Option<Duration>) -> StopOutcome {
        match self.control.request(ControlSignal::Kill, timeout) {
            Ok(ack) => {
                tracing::debug!("Capture loop acknowledged kill with {:?}", ack);
                StopOutcome::Finished
            }
            Err(HandshakeError::Disconnected) => StopOutcome::Finished,
            Err(HandshakeError::Rejected(state)) if state.is_terminal() => StopOutcome::Finished,
            Err(error) => {
                tracing::warn!("Kill was not acknowledged: {:?}", error);
                StopOutcome::Abandoned
            }
        }
    }
}

/// Removes a container that never recorded, and its session directory if that
/// is now empty.
fn discard_placeholder(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
        return;
    }
    if let Some(dir) = path.parent() {
        // fails while earlier takes are still in there
        if fs::remove_dir(dir).is_ok() {
            tracing::debug!("Removed empty directory {}", dir.display());
        }
    }
}

/// Everything the capture thread owns.
struct CaptureLoop {
    session_id: String,
    device_index: usize,
    params: StreamParams,
    destination: PathBuf,
    endpoint: ControlEndpoint,
    ack_timeout: Option<Duration>,
    frames_written: Arc<AtomicU64>,
}

impl CaptureLoop {
    fn run(self, source: Arc<dyn SampleSource>, writer: FileWriter, ready: Sender<Result<()>>) {
        let stream = match source.open(self.device_index, self.params) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    "Session {}: failed to open device {}: {}",
                    self.session_id,
                    self.device_index,
                    error
                );
                drop(writer);
                discard_placeholder(&self.destination);
                let _ = ready.send(Err(error));
                return;
            }
        };

        self.endpoint.begin();
        let _ = ready.send(Ok(()));
        self.capture(stream, writer);
    }

    fn capture(&self, mut stream: Box<dyn SampleStream>, writer: FileWriter) {
        tracing::info!(
            "Session {}: capturing from device {}",
            self.session_id,
            self.device_index
        );

        // Finalizes on every exit path that does not do it inline.
        let mut guard = FinalizeGuard {
            writer: Some(writer),
            endpoint: &self.endpoint,
            clean_stop: false,
            session_id: &self.session_id,
        };
        let mut batch = vec![0i32; self.params.batch_samples()];

        loop {
            if let Err(error) = stream.read_batch(&mut batch) {
                tracing::error!(
                    "Session {}: device read failed, finalizing: {}",
                    self.session_id,
                    error
                );
                self.halt(stream.as_mut());
                guard.finalize_now();
                return;
            }

            let Some(writer) = guard.writer.as_mut() else {
                return;
            };
            if let Err(error) = writer.append_frames(&batch) {
                tracing::error!(
                    "Session {}: container write failed, finalizing: {}",
                    self.session_id,
                    error
                );
                self.halt(stream.as_mut());
                guard.finalize_now();
                return;
            }
            self.frames_written
                .store(u64::from(writer.frames_written()), Ordering::Relaxed);

            match self.endpoint.poll() {
                Some(ControlSignal::Stop) => {
                    tracing::debug!("Session {}: stop received", self.session_id);
                    self.halt(stream.as_mut());
                    guard.clean_stop = true;
                    self.endpoint
                        .acknowledge(ControlAck::FullyStopped, self.ack_timeout);
                    return;
                }
                Some(ControlSignal::Kill) => {
                    tracing::debug!("Session {}: kill received", self.session_id);
                    self.halt(stream.as_mut());
                    guard.finalize_now();
                    self.endpoint
                        .acknowledge(ControlAck::KillProcessed, self.ack_timeout);
                    return;
                }
                None => {}
            }

            if self.endpoint.kill_pending() {
                tracing::warn!(
                    "Session {}: kill requested out of band, finalizing",
                    self.session_id
                );
                self.halt(stream.as_mut());
                guard.finalize_now();
                return;
            }
        }
    }

    fn halt(&self, stream: &mut dyn SampleStream) {
        if let Err(error) = stream.stop() {
            tracing::error!("Session {}: failed to stop stream: {}", self.session_id, error);
        }
    }
}

struct FinalizeGuard<'a> {
    writer: Option<FileWriter>,
    endpoint: &'a ControlEndpoint,
    clean_stop: bool,
    session_id: &'a str,
}

impl FinalizeGuard<'_> {
    fn finalize_now(&mut self) {
        if let Some(writer) = self.writer.take() {
            let frames = writer.frames_written();
            let closed = writer
                .finalize()
                .and_then(|sink| sink.into_inner().map_err(|e| e.into_error().into()))
                .and_then(|file| file.sync_all().map_err(RecorderError::from));

            match closed {
                Ok(()) => tracing::info!(
                    "Session {}: container finalized with {} frames",
                    self.session_id,
                    frames
                ),
                Err(error) => tracing::error!(
                    "Session {}: failed to finalize container: {}",
                    self.session_id,
                    error
                ),
            }
        }

        let state = self.endpoint.settle(self.clean_stop);
        tracing::debug!("Session {}: final state {:?}", self.session_id, state);
    }
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.finalize_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::recorder::aiff::AiffSummary;
    use crate::recorder::synthetic::SyntheticSource;

    fn spec(channels: u16) -> AiffSpec {
        AiffSpec {
            channels,
            bits_per_sample: 16,
            sample_rate: 48_000,
        }
    }

    fn params(channels: u16) -> StreamParams {
        StreamParams {
            channels,
            sample_rate: 48_000,
            batch_frames: 64,
        }
    }

    #[test]
    #[traced_test]
    fn rejected_start_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("mic").join("device_0_take.aiff");
        let source: Arc<dyn SampleSource> = Arc::new(SyntheticSource::default());
        let session = RecordingSession::new("mic", 0);

        let err = session
            .start(source.clone(), destination.clone(), spec(1), params(2), None)
            .unwrap_err();
        assert!(matches!(err, RecorderError::InvalidChannelCount(2)));
        assert!(!destination.exists());
        assert!(!session.is_recording());

        let path = session
            .start(source.clone(), destination.clone(), spec(1), params(1), None)
            .unwrap();
        assert_eq!(path, destination);
        assert!(session.is_recording());

        // a running session cannot be started twice
        assert!(matches!(
            session.start(source, destination.clone(), spec(1), params(1), None),
            Err(RecorderError::AlreadyExists(_))
        ));

        assert_eq!(session.stop(Some(Duration::from_secs(2))).unwrap(), destination);
        let summary = AiffSummary::read_file(&destination).unwrap();
        assert_eq!(summary.form_size, 46 + 2 * summary.frames);
    }
}
