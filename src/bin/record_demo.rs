//! record-demo - drive the session recorder from the command line
//!
//! Subcommands:
//! - `record-demo devices` - print the input devices as JSON
//! - `record-demo record --session <id> --device <index|name>... --seconds <n>`

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use session_recorder_rs::{
    Denoiser, DeviceSelector, Recorder, RecorderConfig, RecorderError, SampleSource,
    SyntheticSource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "record-demo")]
#[command(about = "Record audio sessions from one or more capture devices")]
#[command(version)]
struct Cli {
    /// Use the synthetic tone generator instead of the audio host
    #[arg(long, global = true)]
    synthetic: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List input devices
    Devices {
        /// Only devices backed by hardware
        #[arg(long)]
        hardware: bool,
    },

    /// Record for a fixed duration, then stop every session
    Record {
        /// Session id; suffixed with `-<n>` when several devices are given
        #[arg(short, long)]
        session: String,

        /// Device index or part of a device name. Repeat for several devices.
        /// Defaults to the host's default input device.
        #[arg(short, long)]
        device: Vec<String>,

        /// Recording length in seconds
        #[arg(long, default_value = "5")]
        seconds: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,session_recorder_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match RecorderConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("Invalid configuration: {}", error);
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!("Config: {:?}", config);

    let recorder = Recorder::new(config, source(cli.synthetic));

    let result = match cli.command {
        Commands::Devices { hardware } => print_devices(&recorder, hardware),
        Commands::Record {
            session,
            device,
            seconds,
        } => record(&recorder, &session, &device, Duration::from_secs(seconds)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{}", error);
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "cpal")]
fn source(synthetic: bool) -> Arc<dyn SampleSource> {
    if synthetic {
        return Arc::new(SyntheticSource::default());
    }
    Arc::new(session_recorder_rs::CpalSource::new())
}

#[cfg(not(feature = "cpal"))]
fn source(synthetic: bool) -> Arc<dyn SampleSource> {
    if !synthetic {
        tracing::warn!("Built without the cpal feature, using the synthetic source");
    }
    Arc::new(SyntheticSource::default())
}

fn print_devices(recorder: &Recorder, hardware: bool) -> Result<(), RecorderError> {
    if hardware {
        for device in recorder.hardware_devices()? {
            println!("{}: {}", device.index, device.name);
        }
        return Ok(());
    }
    println!("{}", recorder.devices_json()?);
    Ok(())
}

fn record(
    recorder: &Recorder,
    session: &str,
    devices: &[String],
    duration: Duration,
) -> Result<(), RecorderError> {
    if devices.is_empty() {
        let path = recorder.start_session(session, DeviceSelector::Default)?;
        println!("{session}: recording to {}", path.display());
    }

    for (n, device) in devices.iter().enumerate() {
        let id = if devices.len() == 1 {
            session.to_string()
        } else {
            format!("{session}-{n}")
        };

        let started = match device.parse::<usize>() {
            Ok(index) => recorder.start_session(&id, DeviceSelector::Index(index)),
            Err(_) => recorder.start_session_by_name(&id, device),
        };
        match started {
            Ok(path) => println!("{id}: recording to {}", path.display()),
            Err(error) => {
                tracing::error!("Failed to start {}: {}", id, error);
                let _ = recorder.stop_all();
                return Err(error);
            }
        }
    }

    tracing::info!("Recording for {:?}", duration);
    thread::sleep(duration);

    let (stopped, error) = recorder.stop_all().into_parts();
    let denoiser = recorder.config().enable_denoising.then(Denoiser::default);

    for (id, path) in &stopped {
        println!("{id}: saved {}", path.display());
        if let Some(denoiser) = &denoiser {
            match denoiser.denoise(path) {
                Ok(denoised) => println!("{id}: denoised {}", denoised.display()),
                Err(error) => tracing::warn!("Denoising {} failed: {}", id, error),
            }
        }
    }

    match error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
