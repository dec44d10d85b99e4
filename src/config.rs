//! Recorder configuration
//!
//! Loaded from environment variables, with an optional `.env` file.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::recorder::aiff::AiffSpec;
use crate::recorder::source::StreamParams;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("Unsupported {0}: {1}")]
    Unsupported(String, String),
}

pub const RECORD_PATH: &str = "SYS_RECORD_PATH";
pub const AUDIO_CHANNEL: &str = "SYS_AUDIO_CHANNEL";
pub const AUDIO_SAMPLE_RATE: &str = "SYS_AUDIO_SAMPLE_RATE";
pub const AUDIO_BITS_PER_SAMPLE: &str = "SYS_AUDIO_BITS_PER_SAMPLE";
pub const AUDIO_INPUT_BUFFER_SIZE: &str = "SYS_AUDIO_INPUT_BUFFER_SIZE";
pub const STOP_TIMEOUT_MS: &str = "SYS_STOP_TIMEOUT_MS";
pub const ENABLE_DENOISING: &str = "SYS_ENABLE_DENOISING";

/// Recorder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Root directory; each session writes into `<record_path>/<session id>/`
    pub record_path: PathBuf,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Frames pulled from the device per batch
    pub input_buffer_size: usize,
    /// Bound on each phase of the stop handshake. `None` waits forever.
    pub stop_timeout: Option<Duration>,
    /// Run the external denoiser on finished files
    pub enable_denoising: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            record_path: PathBuf::from("recordings"),
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 32,
            input_buffer_size: 1024,
            stop_timeout: Some(Duration::from_secs(5)),
            enable_denoising: false,
        }
    }
}

impl RecorderConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key/value lookup, falling back to defaults for
    /// missing or empty keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RecorderConfig::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let record_path = get(RECORD_PATH)
            .map(PathBuf::from)
            .unwrap_or(defaults.record_path);

        let channels = parse_or(&get, AUDIO_CHANNEL, defaults.channels)?;
        let sample_rate = parse_or(&get, AUDIO_SAMPLE_RATE, defaults.sample_rate)?;
        let bits_per_sample = parse_or(&get, AUDIO_BITS_PER_SAMPLE, defaults.bits_per_sample)?;
        let input_buffer_size =
            parse_or(&get, AUDIO_INPUT_BUFFER_SIZE, defaults.input_buffer_size)?;

        let stop_timeout = match get(STOP_TIMEOUT_MS) {
            Some(raw) => {
                let millis: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(STOP_TIMEOUT_MS.to_string(), raw))?;
                (millis > 0).then(|| Duration::from_millis(millis))
            }
            None => defaults.stop_timeout,
        };

        let enable_denoising = match get(ENABLE_DENOISING) {
            Some(raw) => parse_flag(&raw)
                .ok_or_else(|| ConfigError::InvalidValue(ENABLE_DENOISING.to_string(), raw))?,
            None => defaults.enable_denoising,
        };

        let config = RecorderConfig {
            record_path,
            channels,
            sample_rate,
            bits_per_sample,
            input_buffer_size,
            stop_timeout,
            enable_denoising,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the container writer or capture loop cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                AUDIO_INPUT_BUFFER_SIZE.to_string(),
                "0".to_string(),
            ));
        }

        self.aiff_spec().validate().map_err(|error| {
            let key = match error {
                crate::RecorderError::UnsupportedSampleRate(_) => AUDIO_SAMPLE_RATE,
                crate::RecorderError::UnsupportedBitDepth(_) => AUDIO_BITS_PER_SAMPLE,
                _ => AUDIO_CHANNEL,
            };
            ConfigError::Unsupported(key.to_string(), error.to_string())
        })
    }

    pub fn aiff_spec(&self) -> AiffSpec {
        AiffSpec {
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            sample_rate: self.sample_rate,
        }
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            channels: self.channels,
            sample_rate: self.sample_rate,
            batch_frames: self.input_buffer_size,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = RecorderConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RecorderConfig::default());
    }

    #[test]
    fn reads_every_key() {
        let config = RecorderConfig::from_lookup(lookup(&[
            (RECORD_PATH, "/var/lib/recorder"),
            (AUDIO_CHANNEL, "2"),
            (AUDIO_SAMPLE_RATE, "44100"),
            (AUDIO_BITS_PER_SAMPLE, "16"),
            (AUDIO_INPUT_BUFFER_SIZE, "512"),
            (STOP_TIMEOUT_MS, "250"),
            (ENABLE_DENOISING, "yes"),
        ]))
        .unwrap();

        assert_eq!(config.record_path, PathBuf::from("/var/lib/recorder"));
        assert_eq!(config.channels, 2);
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.bits_per_sample, 16);
        assert_eq!(config.input_buffer_size, 512);
        assert_eq!(config.stop_timeout, Some(Duration::from_millis(250)));
        assert!(config.enable_denoising);
        assert_eq!(config.stream_params().batch_samples(), 1024);
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let config = RecorderConfig::from_lookup(lookup(&[(STOP_TIMEOUT_MS, "0")])).unwrap();
        assert_eq!(config.stop_timeout, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            RecorderConfig::from_lookup(lookup(&[(AUDIO_CHANNEL, "two")])),
            Err(ConfigError::InvalidValue(key, _)) if key == AUDIO_CHANNEL
        ));
        assert!(matches!(
            RecorderConfig::from_lookup(lookup(&[(AUDIO_SAMPLE_RATE, "12345")])),
            Err(ConfigError::Unsupported(key, _)) if key == AUDIO_SAMPLE_RATE
        ));
        assert!(matches!(
            RecorderConfig::from_lookup(lookup(&[(AUDIO_BITS_PER_SAMPLE, "12")])),
            Err(ConfigError::Unsupported(key, _)) if key == AUDIO_BITS_PER_SAMPLE
        ));
        assert!(matches!(
            RecorderConfig::from_lookup(lookup(&[(AUDIO_INPUT_BUFFER_SIZE, "0")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            RecorderConfig::from_lookup(lookup(&[(ENABLE_DENOISING, "maybe")])),
            Err(ConfigError::InvalidValue(..))
        ));
    }
}
