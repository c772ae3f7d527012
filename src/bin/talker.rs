//! Push-to-talk participant
//!
//! Joins a relay channel, plays whatever the channel's talker sends and
//! transmits the microphone while push-to-talk is held (toggled with Enter).

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ptt_radio::{
    audio::{buffer::SampleQueue, device::list_devices, AudioCapture, AudioPlayback},
    config::AppConfig,
    network::{ClientEvent, ClientSession},
    protocol::{PttState, Role},
};

/// Push-to-talk channel participant
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL, e.g. ws://host:8080/ws
    #[arg(short, long)]
    server: Option<String>,

    /// Channel to join
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u8).range(1..=255))]
    channel: Option<u8>,

    /// Role announced on join (gateway or client)
    #[arg(short, long)]
    role: Option<String>,

    /// Input device ID (see --list-devices)
    #[arg(short, long)]
    input: Option<String>,

    /// Output device ID (see --list-devices)
    #[arg(short, long)]
    output: Option<String>,

    /// List audio devices and exit
    #[arg(long, default_value = "false")]
    list_devices: bool,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_devices {
        println!("\n=== Available Audio Devices ===");
        for device in list_devices() {
            let kind = if device.is_input { "Input" } else { "Output" };
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {} ({}){}:", device.name, kind, default_marker);
            println!("    ID: {}", device.id);
            if let (Some(rate), Some(channels)) = (device.sample_rate, device.channels) {
                println!("    Format: {} Hz, {} channel(s)", rate, channels);
            }
        }
        println!();
        return Ok(());
    }

    let mut config = AppConfig::load(args.config.as_deref())?.talker;
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(role) = args.role {
        config.role = Role::parse(&role);
    }
    if args.input.is_some() {
        config.input_device = args.input;
    }
    if args.output.is_some() {
        config.output_device = args.output;
    }

    tracing::info!("Connecting to {}", config.server_url);

    let inbound = Arc::new(SampleQueue::new(config.buffer_capacity()));
    let mut session = ClientSession::connect(&config, inbound.clone()).await?;

    // Either pipeline may be missing; the session still runs without it
    let mut playback = AudioPlayback::new(
        config.output_device.as_deref(),
        inbound.clone(),
        config.buffer_capacity(),
        config.prebuffer_samples(),
    );
    let playback = match playback.start() {
        Ok(()) => Some(playback),
        Err(e) => {
            tracing::warn!("Playback unavailable: {}", e);
            None
        }
    };

    let emitter = session.frame_emitter();
    let capture_stats = emitter.stats();
    let capture = match AudioCapture::new(
        config.input_device.as_deref(),
        emitter,
        session.transmit_gate(),
    )
    .and_then(|mut capture| capture.start().map(|()| capture))
    {
        Ok(capture) => Some(capture),
        Err(e) => {
            tracing::warn!("Capture unavailable, listening only: {}", e);
            None
        }
    };

    println!(
        "\nChannel {}: press Enter to talk, Enter again to stop, q + Enter to quit\n",
        session.channel()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("q") => break,
                Ok(Some(_)) => {
                    let result = if session.is_talking() {
                        session.stop_talking().await
                    } else if capture.is_some() {
                        session.start_talking().await
                    } else {
                        tracing::warn!("No input device, cannot transmit");
                        Ok(())
                    };
                    if let Err(e) = result {
                        tracing::error!("PTT failed: {}", e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Console read failed: {}", e);
                    break;
                }
            },
            event = session.next_event() => match event {
                Some(ClientEvent::RemotePtt(PttState::Start)) => tracing::info!("Incoming transmission"),
                Some(ClientEvent::RemotePtt(PttState::Stop)) => tracing::info!("Transmission ended"),
                Some(ClientEvent::Busy(extra)) => tracing::info!("Channel busy: {:?}", extra),
                Some(ClientEvent::Joined(channel)) => tracing::info!("Now on channel {}", channel),
                Some(ClientEvent::Closed) | None => {
                    tracing::warn!("Relay closed the connection");
                    break;
                }
            },
            _ = stats_interval.tick() => {
                if let Some(ref capture) = capture {
                    if let Some(e) = capture.check_errors() {
                        tracing::warn!("Capture stream error: {}", e);
                    }
                }
                if let Some(ref playback) = playback {
                    if let Some(e) = playback.check_errors() {
                        tracing::warn!("Playback stream error: {}", e);
                    }
                    let stats = playback.stats();
                    tracing::debug!(
                        "Playback: {} buffered, playing={}, {} underruns, {} overwritten",
                        stats.available(),
                        stats.is_playing(),
                        stats.underruns(),
                        stats.overflowed()
                    );
                }
                tracing::debug!(
                    "Capture: {} frames sent, {} dropped; {} inbound samples dropped",
                    capture_stats.frames_sent(),
                    capture_stats.frames_dropped(),
                    inbound.overflow_count()
                );
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = session.stop_talking().await {
        tracing::debug!("Could not send PTT stop: {}", e);
    }
    drop(capture);
    drop(playback);
    session.close().await;
    tracing::info!("Disconnected");

    Ok(())
}
