use super::Recorder;
use super::errors::{RecorderError, Result};
use super::source::{DeviceInfo, DeviceSelector};

/// Marker in ALSA-style names of physical capture devices.
const HARDWARE_MARKER: &str = "hw:";

impl Recorder {
    /// Lists every input device the backend reports, in index order.
    #[tracing::instrument(skip(self))]
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.source.list_devices()?;
        tracing::debug!("Found {} input device(s)", devices.len());
        Ok(devices)
    }

    pub fn default_device(&self) -> Result<DeviceInfo> {
        self.source.default_device()
    }

    /// Input devices backed by hardware, as opposed to mixers and plugins.
    pub fn hardware_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter(|device| {
                device.max_input_channels > 0
                    && device.name.to_lowercase().contains(HARDWARE_MARKER)
            })
            .collect())
    }

    /// Device list as pretty-printed JSON.
    pub fn devices_json(&self) -> Result<String> {
        let devices = self.list_devices()?;
        serde_json::to_string_pretty(&devices)
            .map_err(|e| RecorderError::Device(format!("failed to serialize device list: {e}")))
    }

    /// Index of the first device whose name contains `name`, ignoring case.
    pub fn device_index_by_name(&self, name: &str) -> Result<usize> {
        let needle = name.to_lowercase();
        self.list_devices()?
            .into_iter()
            .find(|device| device.name.to_lowercase().contains(&needle))
            .map(|device| device.index)
            .ok_or_else(|| {
                tracing::warn!("No input device matches {:?}", name);
                RecorderError::DeviceNotFound(name.to_string())
            })
    }

    /// Turns a selector into a concrete, in-range device index.
    pub(super) fn resolve_device(&self, selector: DeviceSelector) -> Result<usize> {
        match selector {
            DeviceSelector::Default => {
                let device = self.default_device()?;
                tracing::debug!("Using default input device {} ({})", device.index, device.name);
                Ok(device.index)
            }
            DeviceSelector::Index(index) => {
                let available = self.list_devices()?.len();
                if index >= available {
                    tracing::error!("Device index {} out of range", index);
                    return Err(RecorderError::DeviceOutOfRange { index, available });
                }
                Ok(index)
            }
        }
    }
}
