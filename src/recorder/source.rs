use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::errors::{RecorderError, Result};

/// An input device as reported by the host audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: u32,
    pub host_api: String,
}

/// Which device a session should capture from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    Default,
    Index(usize),
}

impl From<usize> for DeviceSelector {
    fn from(index: usize) -> Self {
        DeviceSelector::Index(index)
    }
}

/// Parameters for opening a capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames returned by each `read_batch`.
    pub batch_frames: usize,
}

impl StreamParams {
    pub fn batch_samples(&self) -> usize {
        self.batch_frames * usize::from(self.channels)
    }
}

/// Host audio capability consumed by the recorder.
///
/// Implementations are shared between sessions, so any process-wide setup must go
/// through an [`InitGate`].
pub trait SampleSource: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    fn default_device(&self) -> Result<DeviceInfo>;

    /// Opens a stream on `device_index`. Called from the capture thread that will
    /// read it, so the stream itself does not need to be `Send`.
    fn open(&self, device_index: usize, params: StreamParams) -> Result<Box<dyn SampleStream>>;
}

/// A running capture stream.
pub trait SampleStream {
    /// Blocks until `buf` is filled with interleaved samples.
    fn read_batch(&mut self, buf: &mut [i32]) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

/// Runs a fallible initializer at most once; later callers get the cached outcome.
#[derive(Debug, Default)]
pub struct InitGate {
    outcome: OnceLock<std::result::Result<(), String>>,
}

impl InitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure<F>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), String>,
    {
        self.outcome
            .get_or_init(init)
            .clone()
            .map_err(RecorderError::Device)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.outcome.get(), Some(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn init_gate_runs_once_across_threads() {
        let gate = Arc::new(InitGate::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    gate.ensure(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gate.is_initialized());
    }

    #[test]
    fn init_failure_is_cached() {
        let gate = InitGate::new();
        assert!(gate.ensure(|| Err("no backend".to_string())).is_err());

        let err = gate.ensure(|| Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "device error: no backend");
        assert!(!gate.is_initialized());
    }
}
