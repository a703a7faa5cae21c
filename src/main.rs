use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use peercall::media::{self, BackendKind};
use peercall::util::{host_addresses, init_log};
use peercall::{Session, SessionConfig, SessionState};

#[derive(Parser, Debug)]
#[command(name = "peercall", version, about = "Audio/video calls over TCP")]
struct Cli {
    /// JSON session configuration; flags override it.
    #[arg(long, short, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = BackendKind::Synthetic)]
    backend: BackendKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for peers and relay their streams to each other.
    Server {
        /// Address to bind.
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[command(flatten)]
        media: MediaArgs,
    },
    /// Call a server or another peer directly.
    Peer {
        #[arg(long)]
        host: String,
        #[command(flatten)]
        media: MediaArgs,
    },
    /// List the backend's audio and video devices.
    Devices,
}

#[derive(Args, Debug)]
struct MediaArgs {
    #[arg(long)]
    audio_port: Option<u16>,
    #[arg(long)]
    video_port: Option<u16>,
    #[arg(long)]
    no_audio: bool,
    #[arg(long)]
    no_video: bool,
    /// Receive only; capture nothing.
    #[arg(long)]
    muted: bool,
}

impl MediaArgs {
    fn apply(&self, config: &mut SessionConfig) {
        if let Some(port) = self.audio_port {
            config.audio_port = port;
        }
        if let Some(port) = self.video_port {
            config.video_port = port;
        }
        if self.no_audio {
            config.enable_audio = false;
        }
        if self.no_video {
            config.enable_video = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let (media_args, server) = match &cli.command {
        Command::Devices => return list_devices(cli.backend),
        Command::Server { bind, media } => {
            config.host = bind.clone();
            (media, true)
        }
        Command::Peer { host, media } => {
            config.host = host.clone();
            (media, false)
        }
    };
    media_args.apply(&mut config);
    config.validate()?;

    let backend = media::open_backend(cli.backend, media_args.muted)?;
    let session = Session::new(config, backend);

    let report = if server {
        session.listen().await
    } else {
        session.connect().await
    }
    .context("Starting session")?;

    for (kind, addr) in &report.started {
        info!("{} ready on {}", kind, addr);
    }
    for (kind, reason) in &report.failed {
        warn!("{} unavailable: {}", kind, reason);
    }
    if server {
        for ip in host_addresses() {
            info!("Peers can dial {}", ip);
        }
    }

    let mut state = session.subscribe_state();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Waiting for Ctrl-C")?;
            info!("Interrupted");
        }
        _ = state.wait_for(|s| *s == SessionState::Idle) => {
            info!("Call ended");
        }
    }

    session.stop().await;
    Ok(())
}

fn list_devices(kind: BackendKind) -> Result<()> {
    let backend = media::open_backend(kind, false)?;
    println!("Devices ({} backend):", backend.name());
    for device in backend.list_devices() {
        println!("  {device}");
    }
    Ok(())
}
