/// Streaming AIFF container writer.
pub mod aiff;

/// Stop/kill handshake and session state machine.
pub mod control;

/// Device listing and lookup on the manager.
mod devices;

/// Error types shared by the recorder.
pub mod errors;

/// Path building and sample conversion helpers.
pub mod helpers;

/// One capture lifecycle.
pub mod session;

/// Host audio capability consumed by sessions.
pub mod source;

/// Tone generator implementing the source traits.
pub mod synthetic;

/// Hardware capture through cpal.
#[cfg(feature = "cpal")]
pub mod cpal_source;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::RecorderConfig;
use errors::{RecorderError, Result};
use session::{RecordingSession, SessionInfo};
use source::{DeviceSelector, SampleSource};

/// Registry of recording sessions keyed by session id.
///
/// Each session captures on its own thread. Operations here run on the caller's
/// thread and only ever wait on the handshake with the session they target.
pub struct Recorder {
    config: RecorderConfig,
    source: Arc<dyn SampleSource>,
    sessions: RwLock<HashMap<String, Arc<RecordingSession>>>,
}

/// Result of [`Recorder::stop_all`].
#[derive(Debug, Default)]
pub struct StopAllReport {
    /// Final file path per stopped session.
    pub stopped: BTreeMap<String, PathBuf>,
    /// Sessions that could not be stopped, with the reason.
    pub failed: Vec<(String, RecorderError)>,
}

impl StopAllReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Splits the report into the stopped paths and an aggregate error, if any.
    pub fn into_parts(self) -> (BTreeMap<String, PathBuf>, Option<RecorderError>) {
        let error = (!self.failed.is_empty()).then(|| RecorderError::StopAll(self.failed));
        (self.stopped, error)
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("config", &self.config)
            .field("sessions", &self.session_ids())
            .finish()
    }
}

impl Recorder {
    /// Creates a recorder over an injected audio backend.
    pub fn new(config: RecorderConfig, source: Arc<dyn SampleSource>) -> Self {
        Recorder {
            config,
            source,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a recorder on the default cpal host.
    #[cfg(feature = "cpal")]
    pub fn with_cpal(config: RecorderConfig) -> Self {
        Self::new(config, Arc::new(cpal_source::CpalSource::new()))
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Registers a new, not yet started session.
    ///
    /// The id becomes a directory name under `record_path`, so it must be a
    /// single plain path component.
    ///
    /// # Errors
    /// `InvalidSessionId` for ids that are empty or contain separators or `..`,
    /// `AlreadyExists` if the id is registered.
    #[tracing::instrument(skip(self))]
    pub fn create_session(&self, id: &str, device_index: usize) -> Result<Arc<RecordingSession>> {
        helpers::validate_session_id(id)?;

        let mut sessions = self.sessions.write();
        if sessions.contains_key(id) {
            tracing::warn!("Session {} already exists", id);
            return Err(RecorderError::AlreadyExists(id.to_string()));
        }

        let session = Arc::new(RecordingSession::new(id, device_index));
        sessions.insert(id.to_string(), session.clone());
        tracing::debug!("Session {} registered", id);
        Ok(session)
    }

    /// Creates and starts a session, returning the path it records to.
    ///
    /// # Errors
    /// Configuration errors for invalid ids, unknown devices or unsupported
    /// formats, `AlreadyExists` for a live id, or the device error that prevented capture.
    #[tracing::instrument(skip(self))]
    pub fn start_session(&self, id: &str, device: DeviceSelector) -> Result<PathBuf> {
        tracing::info!("Starting session {}", id);

        helpers::validate_session_id(id)?;
        let device_index = self.resolve_device(device)?;
        let session = self.create_session(id, device_index)?;

        let destination = helpers::session_file_path(
            &self.config.record_path,
            id,
            device_index,
            &session.started_at(),
        );

        match session.start(
            self.source.clone(),
            destination,
            self.config.aiff_spec(),
            self.config.stream_params(),
            self.config.stop_timeout,
        ) {
            Ok(path) => Ok(path),
            Err(error) => {
                tracing::error!("Failed to start session {}: {}", id, error);
                self.unregister(id);
                Err(error)
            }
        }
    }

    /// Starts a session on the first device whose name contains `name`.
    pub fn start_session_by_name(&self, id: &str, name: &str) -> Result<PathBuf> {
        let device_index = self.device_index_by_name(name)?;
        tracing::info!("Resolved device name {:?} -> index {}", name, device_index);
        self.start_session(id, DeviceSelector::Index(device_index))
    }

    /// Stops a recording session and returns its finished file.
    ///
    /// The file is finalized and closed before this returns.
    ///
    /// # Errors
    /// `NotFound`, `NotRecording`, `StopInProgress`, or `StopTimedOut` when the
    /// capture thread did not answer within the configured timeout.
    #[tracing::instrument(skip(self))]
    pub fn stop_session(&self, id: &str) -> Result<PathBuf> {
        tracing::info!("Stopping session {}", id);

        let session = self.session(id)?;
        let result = session.stop(self.config.stop_timeout);

        match &result {
            Ok(_) | Err(RecorderError::StopTimedOut { .. }) | Err(RecorderError::CapturePanicked(_)) => {
                self.unregister(id);
            }
            Err(_) => {}
        }
        result
    }

    /// Stops every recording session, one after another.
    ///
    /// Sessions that were registered but never started are left alone and do not
    /// appear in the report.
    #[tracing::instrument(skip(self))]
    pub fn stop_all(&self) -> StopAllReport {
        // snapshot so the registry lock is not held across handshakes
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        tracing::info!("Stopping {} session(s)", ids.len());

        let mut report = StopAllReport::default();
        for id in ids {
            match self.session(&id) {
                Ok(session) if !session.is_recording() => {
                    tracing::debug!("Session {} is not recording, skipping", id);
                    continue;
                }
                Ok(_) => {}
                // stopped concurrently since the snapshot
                Err(RecorderError::NotFound(_)) => continue,
                Err(error) => {
                    report.failed.push((id, error));
                    continue;
                }
            }

            match self.stop_session(&id) {
                Ok(path) => {
                    report.stopped.insert(id, path);
                }
                Err(error) => {
                    tracing::error!("Failed to stop session {}: {}", id, error);
                    report.failed.push((id, error));
                }
            }
        }
        report
    }

    pub fn session(&self, id: &str) -> Result<Arc<RecordingSession>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RecorderError::NotFound(id.to_string()))
    }

    pub fn session_info(&self, id: &str) -> Result<SessionInfo> {
        self.session(id).map(|session| session.info())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<RecordingSession>> =
            self.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn unregister(&self, id: &str) {
        if self.sessions.write().remove(id).is_some() {
            tracing::debug!("Session {} unregistered", id);
        }
    }
}
