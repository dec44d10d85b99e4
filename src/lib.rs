//! # Session Recorder Library
//!
//! The `session-recorder-rs` library records audio from several capture devices at
//! once, one independent session per device, each streaming into its own AIFF file.
//!
//! ## Usage
//!
//! Build a [`Recorder`] from a [`RecorderConfig`] and a [`SampleSource`] (the cpal
//! backend behind the `cpal` feature, or [`SyntheticSource`] without hardware), then
//! call `start_session` with an id and a device. Each session runs its own capture
//! thread. `stop_session` performs a stop handshake with that thread and returns the
//! path of the finalized file; `stop_all` does the same for every running session.
//!
//! Files land under `<record_path>/<session id>/device_<index>_<timestamp>.aiff`.

pub mod config;
pub mod postprocess;
pub mod recorder;

pub use config::{ConfigError, RecorderConfig};
pub use postprocess::Denoiser;
pub use recorder::aiff::{AiffSpec, AiffSummary, AiffWriter};
pub use recorder::control::SessionState;
pub use recorder::errors::{ErrorKind, RecorderError, Result};
pub use recorder::session::{RecordingSession, SessionInfo};
pub use recorder::source::{
    DeviceInfo, DeviceSelector, InitGate, SampleSource, SampleStream, StreamParams,
};
pub use recorder::synthetic::{Stall, SyntheticBehavior, SyntheticSource};
pub use recorder::{Recorder, StopAllReport};

#[cfg(feature = "cpal")]
pub use recorder::cpal_source::CpalSource;
