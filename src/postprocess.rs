//! Noise suppression for finished recordings
//!
//! Shells out to `sox` for format conversion and to RNNoise's `rnnoise_demo` for the
//! denoising itself. The input recording is never modified.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::recorder::errors::{RecorderError, Result};

/// RNNoise works on 48 kHz, 16-bit, mono PCM.
const RAW_ARGS: [&str; 10] = [
    "-t",
    "raw",
    "-r",
    "48000",
    "-b",
    "16",
    "-c",
    "1",
    "-e",
    "signed-integer",
];

#[derive(Debug, Clone)]
pub struct Denoiser {
    sox: PathBuf,
    rnnoise: PathBuf,
}

impl Default for Denoiser {
    fn default() -> Self {
        Denoiser {
            sox: PathBuf::from("sox"),
            rnnoise: PathBuf::from("rnnoise_demo"),
        }
    }
}

impl Denoiser {
    pub fn new(sox: impl Into<PathBuf>, rnnoise: impl Into<PathBuf>) -> Self {
        Denoiser {
            sox: sox.into(),
            rnnoise: rnnoise.into(),
        }
    }

    /// Checks that both tools can be launched.
    pub fn check_available(&self) -> Result<()> {
        Command::new(&self.sox)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| RecorderError::PostProcess(format!("sox not found: {e}")))?;

        // rnnoise_demo exits non-zero without arguments, so only the launch matters
        Command::new(&self.rnnoise)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| RecorderError::PostProcess(format!("rnnoise_demo not found: {e}")))?;

        Ok(())
    }

    /// Writes a denoised copy next to `input` and returns its path.
    #[tracing::instrument(skip(self))]
    pub fn denoise(&self, input: &Path) -> Result<PathBuf> {
        let wav = with_suffix(input, "", "wav");
        let raw_in = with_suffix(input, "_raw", "pcm");
        let raw_out = with_suffix(input, "_denoised_raw", "pcm");
        let denoised_wav = with_suffix(input, "_denoised", "wav");
        let output = denoised_path(input);

        let intermediates = [&wav, &raw_in, &raw_out, &denoised_wav];
        let result = self.run_chain(input, &wav, &raw_in, &raw_out, &denoised_wav, &output);

        for path in intermediates {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }

        match result {
            Ok(()) => {
                tracing::info!("Denoised file written to {}", output.display());
                Ok(output)
            }
            Err(error) => {
                tracing::error!("Denoising {} failed: {}", input.display(), error);
                Err(error)
            }
        }
    }

    fn run_chain(
        &self,
        input: &Path,
        wav: &Path,
        raw_in: &Path,
        raw_out: &Path,
        denoised_wav: &Path,
        output: &Path,
    ) -> Result<()> {
        run(
            Command::new(&self.sox).arg(input).arg(wav),
            "AIFF to WAV conversion",
        )?;
        run(
            Command::new(&self.sox).arg(wav).args(RAW_ARGS).arg(raw_in),
            "WAV to PCM conversion",
        )?;
        run(
            Command::new(&self.rnnoise).arg(raw_in).arg(raw_out),
            "RNNoise processing",
        )?;
        run(
            Command::new(&self.sox).args(RAW_ARGS).arg(raw_out).arg(denoised_wav),
            "PCM to WAV conversion",
        )?;
        run(
            Command::new(&self.sox).arg(denoised_wav).arg(output),
            "WAV to AIFF conversion",
        )
    }
}

/// `<dir>/<stem>_denoised.aiff` for a recording at `<dir>/<stem>.aiff`.
pub fn denoised_path(input: &Path) -> PathBuf {
    with_suffix(input, "_denoised", "aiff")
}

fn with_suffix(input: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}{suffix}.{extension}"))
}

fn run(command: &mut Command, step: &str) -> Result<()> {
    tracing::debug!("Running {:?}", command);
    let output = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| RecorderError::PostProcess(format!("{step} failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RecorderError::PostProcess(format!(
            "{step} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}
