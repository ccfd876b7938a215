//! audiopipe - Low-latency point-to-point PCM audio receiver

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use audiopipe::audio::list_output_devices;
use audiopipe::network::{Session, SessionConfig, Transport};

#[derive(Parser)]
#[command(name = "audiopipe")]
#[command(about = "Low-latency point-to-point PCM audio receiver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive an audio stream and play it on the default output device
    Listen {
        /// Port to listen on
        #[arg(short, long, default_value = "50000")]
        port: u16,

        /// Requested jitter buffering in milliseconds
        #[arg(long, default_value = "20")]
        jitter_ms: u32,

        /// Transport: udp or tcp (unknown values fall back to udp)
        #[arg(long, default_value = "udp")]
        transport: String,

        /// Reorder packets by sequence number and conceal gaps; for lossy
        /// UDP paths that reorder
        #[arg(long)]
        reorder: bool,
    },

    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List output devices
    List,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn list_devices() {
    println!("Output devices:");
    let devices = list_output_devices();
    if devices.is_empty() {
        println!("  (none found)");
    }
    for device in devices {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!("  - {}{}", device.name, default_marker);
    }
}

fn run_listen(port: u16, jitter_ms: u32, transport: &str, reorder: bool) -> Result<()> {
    let mut config = SessionConfig::new(port, jitter_ms, Transport::from_name(transport));
    config.reorder = reorder;

    let mut session = Session::start(config)?;
    println!(
        "Listening on {} ({}), jitter buffer {} ms.",
        session.local_addr(),
        Transport::from_name(transport).as_str(),
        jitter_ms.max(1)
    );
    println!("Waiting for a sender; audio starts on the first packet.");
    println!("Press Ctrl+C to stop.\n");

    while session.is_running() {
        thread::sleep(Duration::from_millis(500));
    }

    // The loop only breaks when a worker hit a fatal error.
    session.stop();
    anyhow::bail!("session ended unexpectedly")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => list_devices(),
        },
        Commands::Listen {
            port,
            jitter_ms,
            transport,
            reorder,
        } => {
            run_listen(port, jitter_ms, &transport, reorder)?;
        }
    }

    Ok(())
}
