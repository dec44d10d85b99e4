use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Broad classes of failure, used by callers to decide whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad parameters or devices. Never retried.
    Configuration,
    /// Registry and lifecycle conflicts. The caller decides what to do.
    Concurrency,
    /// Sink or device failures. Fatal to the affected session only.
    Io,
    /// Several sessions failed during a batch stop.
    Aggregate,
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("unsupported bits per sample: {0}")]
    UnsupportedBitDepth(u16),

    #[error("invalid channel count: {0}")]
    InvalidChannelCount(u16),

    #[error("device index {index} out of range ({available} devices available)")]
    DeviceOutOfRange { index: usize, available: usize },

    #[error("no input device matching {0:?}")]
    DeviceNotFound(String),

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} is not recording")]
    NotRecording(String),

    #[error("session {0} is already being stopped")]
    StopInProgress(String),

    #[error("session {id} did not acknowledge stop within {timeout:?}, forced kill requested for {path:?}")]
    StopTimedOut {
        id: String,
        path: PathBuf,
        timeout: Duration,
    },

    #[error("capture thread for session {0} panicked")]
    CapturePanicked(String),

    #[error("container I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container size limit reached after {0} frames")]
    ContainerFull(u32),

    #[error("batch of {len} samples is not a whole number of {channels}-channel frames")]
    PartialFrame { len: usize, channels: u16 },

    #[error("device read failed: {0}")]
    DeviceRead(String),

    #[error("post-processing failed: {0}")]
    PostProcess(String),

    #[error("failed to stop {} session(s): {}", .0.len(), describe_failures(.0))]
    StopAll(Vec<(String, RecorderError)>),
}

impl RecorderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecorderError::UnsupportedSampleRate(_)
            | RecorderError::UnsupportedBitDepth(_)
            | RecorderError::InvalidChannelCount(_)
            | RecorderError::DeviceOutOfRange { .. }
            | RecorderError::DeviceNotFound(_)
            | RecorderError::Device(_)
            | RecorderError::Config(_)
            | RecorderError::InvalidSessionId(_) => ErrorKind::Configuration,
            RecorderError::AlreadyExists(_)
            | RecorderError::NotFound(_)
            | RecorderError::NotRecording(_)
            | RecorderError::StopInProgress(_)
            | RecorderError::StopTimedOut { .. }
            | RecorderError::CapturePanicked(_) => ErrorKind::Concurrency,
            RecorderError::Io(_)
            | RecorderError::ContainerFull(_)
            | RecorderError::PartialFrame { .. }
            | RecorderError::DeviceRead(_)
            | RecorderError::PostProcess(_) => ErrorKind::Io,
            RecorderError::StopAll(_) => ErrorKind::Aggregate,
        }
    }

    /// Session ids named by an aggregate stop failure.
    pub fn failed_sessions(&self) -> Vec<&str> {
        match self {
            RecorderError::StopAll(failures) => {
                failures.iter().map(|(id, _)| id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[(String, RecorderError)]) -> String {
    failures
        .iter()
        .map(|(id, error)| format!("{id} ({error})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_error_names_every_failed_session() {
        let error = RecorderError::StopAll(vec![
            ("a".to_string(), RecorderError::NotFound("a".to_string())),
            ("b".to_string(), RecorderError::CapturePanicked("b".to_string())),
        ]);

        assert_eq!(error.kind(), ErrorKind::Aggregate);
        assert_eq!(error.failed_sessions(), vec!["a", "b"]);

        let message = error.to_string();
        assert!(message.starts_with("failed to stop 2 session(s)"));
        assert!(message.contains("a (session a not found)"));
        assert!(message.contains("b (capture thread for session b panicked)"));
    }

    #[test]
    fn taxonomy_matches_error_classes() {
        assert_eq!(
            RecorderError::UnsupportedSampleRate(12_345).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            RecorderError::AlreadyExists("x".into()).kind(),
            ErrorKind::Concurrency
        );
        assert_eq!(
            RecorderError::DeviceRead("gone".into()).kind(),
            ErrorKind::Io
        );
    }
}
