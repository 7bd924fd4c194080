use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ecg_daq::acquisition::AcquisitionEngine;
use ecg_daq::config::Settings;
use ecg_daq::transport::mock::{pulse_train_millivolts, MockTransport};

#[derive(Parser)]
#[command(name = "ecg-daq", version, about = "Biopotential acquisition and conditioning engine")]
struct Cli {
    /// Configuration name under `config/` (without extension).
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire from the simulated front end and report telemetry once a second.
    Run {
        /// Beat rate of the simulated subject, in bpm.
        #[arg(long, default_value_t = 72.0)]
        bpm: f64,
        /// R-wave amplitude of the simulated subject, in millivolts.
        #[arg(long, default_value_t = 1.2)]
        amplitude_mv: f64,
        /// Stop after this many seconds; runs until Ctrl-C when omitted.
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Load and validate the configuration, then print the effective values.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    match cli.command {
        Command::Run { bpm, amplitude_mv, duration_secs } => {
            run(settings, bpm, amplitude_mv, duration_secs).await
        }
        Command::CheckConfig => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run(
    settings: Settings,
    bpm: f64,
    amplitude_mv: f64,
    duration_secs: Option<u64>,
) -> Result<()> {
    let mut transport = MockTransport::new(&settings.hardware);
    transport.set_waveform(pulse_train_millivolts(
        amplitude_mv,
        bpm,
        settings.hardware.sample_rate_hz,
    ));

    let (engine, handle) = AcquisitionEngine::new(transport, settings)?;
    let task = engine.spawn();
    handle.start().await?;

    let report = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            let health = handle.health();
            match handle.current_rate() {
                Some(rate) => info!(
                    state = ?handle.state(),
                    samples = health.samples_acquired,
                    quality = ?health.signal_quality,
                    rate_bpm = format_args!("{rate:.1}"),
                    "telemetry"
                ),
                None => info!(
                    state = ?handle.state(),
                    samples = health.samples_acquired,
                    quality = ?health.signal_quality,
                    "telemetry, rate not yet available"
                ),
            }
        }
    };
    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = report => {}
        _ = deadline => info!("requested duration elapsed"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    handle.stop().await?;
    drop(handle);
    task.await?;
    Ok(())
}
