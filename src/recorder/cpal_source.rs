use std::collections::VecDeque;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::errors::{RecorderError, Result};
use super::helpers::convert_samples;
use super::source::{DeviceInfo, InitGate, SampleSource, SampleStream, StreamParams};

/// Longest wait for the device callback before a read counts as failed.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds an input stream for every sample format cpal can deliver, converting
/// each callback's data to `i32` and forwarding it over `$tx`.
macro_rules! build_input_stream_for {
    ($device:expr, $format:expr, $config:expr, $tx:expr, $err_tx:expr) => {{
        macro_rules! build {
            ($sample:ty) => {{
                let tx = $tx.clone();
                let err_tx = $err_tx.clone();
                $device.build_input_stream(
                    $config,
                    move |data: &[$sample], _: &_| {
                        let mut converted = Vec::with_capacity(data.len());
                        convert_samples(data, &mut converted);
                        if let Err(e) = tx.send(converted) {
                            tracing::error!("Failed to send data: {}", e);
                        }
                    },
                    move |err| {
                        tracing::error!("an error occurred on stream: {}", err);
                        let _ = err_tx.try_send(err.to_string());
                    },
                    None,
                )
            }};
        }

        match $format {
            cpal::SampleFormat::I8 => Ok(build!(i8)),
            cpal::SampleFormat::I16 => Ok(build!(i16)),
            cpal::SampleFormat::I32 => Ok(build!(i32)),
            cpal::SampleFormat::I64 => Ok(build!(i64)),
            cpal::SampleFormat::U8 => Ok(build!(u8)),
            cpal::SampleFormat::U16 => Ok(build!(u16)),
            cpal::SampleFormat::U32 => Ok(build!(u32)),
            cpal::SampleFormat::U64 => Ok(build!(u64)),
            cpal::SampleFormat::F32 => Ok(build!(f32)),
            cpal::SampleFormat::F64 => Ok(build!(f64)),
            sf => Err(RecorderError::Device(format!(
                "Unsupported sample format '{sf:?}'"
            ))),
        }
    }};
}

/// Capture from the default cpal host.
#[derive(Debug, Default)]
pub struct CpalSource {
    gate: InitGate,
}

impl CpalSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn host(&self) -> Result<cpal::Host> {
        self.gate.ensure(|| {
            let host = cpal::default_host();
            tracing::info!("Audio host {} initialized", host.id().name());
            Ok(())
        })?;
        Ok(cpal::default_host())
    }

    fn input_devices(&self) -> Result<Vec<cpal::Device>> {
        let host = self.host()?;
        let devices = host.input_devices().map_err(|e| {
            tracing::error!("Failed to enumerate input devices: {}", e);
            RecorderError::Device(e.to_string())
        })?;
        Ok(devices.collect())
    }

    fn describe(index: usize, device: &cpal::Device) -> DeviceInfo {
        let name = device.name().unwrap_or(String::from("Unknown"));
        let (max_input_channels, default_sample_rate) = match device.default_input_config() {
            Ok(config) => (config.channels(), config.sample_rate().0),
            Err(error) => {
                tracing::warn!("No default input config for {}: {}", name, error);
                (0, 0)
            }
        };
        let max_input_channels = device
            .supported_input_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0)
            .max(max_input_channels);

        DeviceInfo {
            index,
            name,
            max_input_channels,
            default_sample_rate,
            host_api: cpal::default_host().id().name().to_string(),
        }
    }
}

impl SampleSource for CpalSource {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .input_devices()?
            .iter()
            .enumerate()
            .map(|(index, device)| Self::describe(index, device))
            .collect())
    }

    fn default_device(&self) -> Result<DeviceInfo> {
        let host = self.host()?;
        let default = host.default_input_device().ok_or_else(|| {
            tracing::error!("Failed to get default input device");
            RecorderError::Device("No default input device found".to_string())
        })?;
        let default_name = default.name().ok();

        let devices = self.input_devices()?;
        let index = devices
            .iter()
            .position(|device| device.name().ok() == default_name)
            .ok_or_else(|| {
                tracing::error!("Default input device {:?} is not in the device list", default_name);
                RecorderError::Device("default input device not found in device list".to_string())
            })?;
        Ok(Self::describe(index, &default))
    }

    fn open(&self, device_index: usize, params: StreamParams) -> Result<Box<dyn SampleStream>> {
        let mut devices = self.input_devices()?;
        let available = devices.len();
        if device_index >= available {
            return Err(RecorderError::DeviceOutOfRange {
                index: device_index,
                available,
            });
        }
        let device = devices.swap_remove(device_index);

        tracing::debug!(
            "Using input device: {:?}",
            device.name().unwrap_or(String::from("Unknown"))
        );

        let format = device
            .default_input_config()
            .map_err(|e| {
                tracing::error!("Failed to get default input config: {}", e);
                RecorderError::Device(e.to_string())
            })?
            .sample_format();

        let config = cpal::StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (data_tx, data_rx) = crossbeam_channel::unbounded::<Vec<i32>>();
        let (err_tx, err_rx) = crossbeam_channel::bounded::<String>(1);

        let stream = build_input_stream_for!(device, format, &config, data_tx, err_tx)?
            .map_err(|e| {
                tracing::error!("Failed to build input stream: {}", e);
                RecorderError::Device(e.to_string())
            })?;

        stream.play().map_err(|e| {
            tracing::error!("Failed to start input stream: {}", e);
            RecorderError::Device(e.to_string())
        })?;

        Ok(Box::new(CpalStream {
            stream,
            data_rx,
            err_rx,
            pending: VecDeque::new(),
            _data_tx: data_tx,
            _err_tx: err_tx,
        }))
    }
}

struct CpalStream {
    stream: cpal::Stream,
    data_rx: Receiver<Vec<i32>>,
    err_rx: Receiver<String>,
    pending: VecDeque<i32>,
    // kept so a quiet device times out instead of disconnecting
    _data_tx: Sender<Vec<i32>>,
    _err_tx: Sender<String>,
}

impl SampleStream for CpalStream {
    fn read_batch(&mut self, buf: &mut [i32]) -> Result<()> {
        while self.pending.len() < buf.len() {
            if let Ok(message) = self.err_rx.try_recv() {
                return Err(RecorderError::DeviceRead(message));
            }
            match self.data_rx.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(RecorderError::DeviceRead(format!(
                        "no data from device within {READ_TIMEOUT:?}"
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RecorderError::DeviceRead("stream closed".to_string()));
                }
            }
        }

        for (slot, sample) in buf.iter_mut().zip(self.pending.drain(..buf.len())) {
            *slot = sample;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.pause().map_err(|e| {
            tracing::error!("Failed to pause input stream: {}", e);
            RecorderError::Device(e.to_string())
        })
    }
}
