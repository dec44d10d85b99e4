//! A tone generator that behaves like a host audio backend.
//!
//! Useful on machines without capture hardware and for exercising the failure
//! paths of the recorder: each device can be told to fail or stall after a number
//! of batches.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use dasp_sample::Sample;

use super::errors::{RecorderError, Result};
use super::source::{DeviceInfo, InitGate, SampleSource, SampleStream, StreamParams};

pub const SYNTHETIC_HOST_API: &str = "Synthetic";

/// Pause a stream once, before producing batch number `after_batches`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    pub after_batches: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticBehavior {
    pub frequency_hz: f32,
    pub amplitude: f32,
    /// Sleep before each batch, standing in for the device clock.
    pub batch_interval: Duration,
    /// Every read after this many batches fails.
    pub fail_after: Option<u64>,
    pub stall: Option<Stall>,
}

impl Default for SyntheticBehavior {
    fn default() -> Self {
        SyntheticBehavior {
            frequency_hz: 440.0,
            amplitude: 0.5,
            batch_interval: Duration::from_millis(2),
            fail_after: None,
            stall: None,
        }
    }
}

#[derive(Debug)]
pub struct SyntheticSource {
    devices: Vec<DeviceInfo>,
    default_index: usize,
    fallback: SyntheticBehavior,
    behaviors: HashMap<usize, SyntheticBehavior>,
    gate: InitGate,
    init_calls: AtomicUsize,
    opened: AtomicUsize,
}

impl SyntheticSource {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| DeviceInfo {
                index,
                name: name.into(),
                max_input_channels: 2,
                default_sample_rate: 48_000,
                host_api: SYNTHETIC_HOST_API.to_string(),
            })
            .collect();

        SyntheticSource {
            devices,
            default_index: 0,
            fallback: SyntheticBehavior::default(),
            behaviors: HashMap::new(),
            gate: InitGate::new(),
            init_calls: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        }
    }

    /// Behavior for devices without their own override.
    pub fn with_default_behavior(mut self, behavior: SyntheticBehavior) -> Self {
        self.fallback = behavior;
        self
    }

    pub fn with_behavior(mut self, device_index: usize, behavior: SyntheticBehavior) -> Self {
        self.behaviors.insert(device_index, behavior);
        self
    }

    pub fn with_default_device(mut self, device_index: usize) -> Self {
        self.default_index = device_index;
        self
    }

    /// Overrides the advertised input channel count, e.g. 0 for an output-only device.
    pub fn with_input_channels(mut self, device_index: usize, channels: u16) -> Self {
        if let Some(device) = self.devices.get_mut(device_index) {
            device.max_input_channels = channels;
        }
        self
    }

    /// How many times the backend initializer actually ran.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn opened_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices
            .get(index)
            .ok_or(RecorderError::DeviceOutOfRange {
                index,
                available: self.devices.len(),
            })
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        SyntheticSource::new(["Synthetic Mic A (hw:0,0)", "Synthetic Mic B (hw:1,0)"])
    }
}

impl SampleSource for SyntheticSource {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn default_device(&self) -> Result<DeviceInfo> {
        self.device(self.default_index).cloned()
    }

    fn open(&self, device_index: usize, params: StreamParams) -> Result<Box<dyn SampleStream>> {
        self.gate.ensure(|| {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Synthetic backend initialized");
            Ok(())
        })?;

        let device = self.device(device_index)?;
        if params.channels == 0 || params.channels > device.max_input_channels {
            return Err(RecorderError::Device(format!(
                "{} supports at most {} input channels, {} requested",
                device.name, device.max_input_channels, params.channels
            )));
        }

        let behavior = self
            .behaviors
            .get(&device_index)
            .unwrap_or(&self.fallback)
            .clone();
        self.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Opened synthetic stream on {}", device.name);

        Ok(Box::new(SyntheticStream {
            phase: 0.0,
            phase_step: TAU * behavior.frequency_hz / params.sample_rate as f32,
            behavior,
            channels: usize::from(params.channels),
            batches: 0,
            stopped: false,
        }))
    }
}

struct SyntheticStream {
    behavior: SyntheticBehavior,
    channels: usize,
    phase: f32,
    phase_step: f32,
    batches: u64,
    stopped: bool,
}

impl SampleStream for SyntheticStream {
    fn read_batch(&mut self, buf: &mut [i32]) -> Result<()> {
        if self.stopped {
            return Err(RecorderError::DeviceRead("stream is stopped".to_string()));
        }
        if self
            .behavior
            .fail_after
            .is_some_and(|limit| self.batches >= limit)
        {
            return Err(RecorderError::DeviceRead(format!(
                "synthetic device failed after {} batches",
                self.batches
            )));
        }
        if let Some(stall) = self.behavior.stall {
            if stall.after_batches == self.batches {
                tracing::debug!("Synthetic stream stalling for {:?}", stall.duration);
                thread::sleep(stall.duration);
            }
        }
        if !self.behavior.batch_interval.is_zero() {
            thread::sleep(self.behavior.batch_interval);
        }

        for frame in buf.chunks_mut(self.channels) {
            let value = (self.phase.sin() * self.behavior.amplitude).to_sample::<i32>();
            frame.fill(value);
            self.phase = (self.phase + self.phase_step) % TAU;
        }
        self.batches += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}
