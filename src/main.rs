use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use i8080_emulator::config::EmulatorConfig;
use i8080_emulator::emulator::Emulator;
use i8080_emulator::error::EmulatorError;
use i8080_emulator::metrics::{gather_metrics, init_metrics};
use i8080_emulator::server::run_server;

#[derive(Parser, Debug)]
#[command(
    name = "i8080_emulator",
    about = "Run a Space Invaders ROM on an emulated 8080 with a debug HTTP surface."
)]
struct Args {
    /// ROM image, loaded at address 0x0000.
    #[arg(value_name = "ROM")]
    rom: PathBuf,

    /// Settings file; missing or invalid settings fall back to defaults.
    #[arg(long = "config", value_name = "PATH", default_value = "settings.json")]
    settings: PathBuf,

    /// Port for the debug server on 127.0.0.1.
    #[arg(long, default_value_t = 3030)]
    port: u16,
}

fn load_emulator(rom: &Path, settings: &Path) -> Result<Emulator, EmulatorError> {
    let image = fs::read(rom).map_err(|err| {
        EmulatorError::ResourceInitialization(format!("cannot read {}: {}", rom.display(), err))
    })?;
    let config = EmulatorConfig::load_or_default(settings);
    Emulator::new(config, &image)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    init_metrics();

    let emulator = match load_emulator(&args.rom, &args.settings) {
        Ok(emulator) => emulator,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    info!("=== Intel 8080 Emulator ===");
    info!("running {}", args.rom.display());

    let handle = match emulator.spawn() {
        Ok(handle) => handle,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let remote = handle.remote();
    let server = tokio::spawn(run_server(remote.clone(), args.port));

    // The join blocks, so it runs off the async workers.
    let mut emulation = tokio::task::spawn_blocking(move || handle.join());

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        finished = &mut emulation => Some(finished),
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            info!("interrupted, shutting down");
            remote.control.stop();
            emulation.await
        }
    };
    server.abort();

    if let Ok(text) = gather_metrics() {
        info!("final metrics:\n{}", text);
    }

    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("emulation task failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
