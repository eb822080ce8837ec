//! TCP relay channel example
//!
//! Run with: cargo run --example relay_channel [LISTEN_PORT] [TARGET]
//!
//! Examples:
//!   cargo run --example relay_channel                  # listens on 2000/2001, relays to 127.0.0.1:2100
//!   cargo run --example relay_channel 3000             # listens on 3000/3001
//!   cargo run --example relay_channel 3000 10.0.0.5:2100
//!
//! The channel accepts framed payloads on two TCP server inputs (video and
//! audio), and relays both streams to a single TCP client output. Feed it
//! with any client that writes the wire framing described in
//! `mediaswitch::connection::tcp`, e.g. a second relay instance.

use std::sync::Arc;

use mediaswitch::{
    build_runtime, Channel, ChannelOptions, ChannelRole, ChannelType, ConnectionKind,
    ConnectionMode, Error,
};

/// Payloads queued per output before overflow dropping kicks in
const OUTPUT_QUEUE_CAPACITY: usize = 32;

fn parse_target(arg: &str) -> Result<(String, u16), String> {
    let (host, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid target '{arg}', expected HOST:PORT"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid target port in '{arg}'"))?;
    Ok((host.to_string(), port))
}

fn print_usage() {
    eprintln!("Usage: relay_channel [LISTEN_PORT] [TARGET]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  LISTEN_PORT   Video input port; audio uses LISTEN_PORT+1 (default: 2000)");
    eprintln!("  TARGET        HOST:PORT to relay to (default: 127.0.0.1:2100)");
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let listen_port: u16 = match args.get(1) {
        Some(arg) => arg.parse().unwrap_or_else(|_| {
            eprintln!("Error: invalid port '{arg}'");
            print_usage();
            std::process::exit(1);
        }),
        None => 2000,
    };
    let (target_host, target_port) = match args.get(2) {
        Some(arg) => parse_target(arg).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            print_usage();
            std::process::exit(1);
        }),
        None => ("127.0.0.1".to_string(), 2100),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediaswitch=debug".parse()?),
        )
        .init();

    let options = ChannelOptions::default()
        .topology(ChannelType::TcpToTcp, ChannelRole::Transmitter)
        .num_threads(2);

    let runtime = build_runtime(options.num_threads)?;
    runtime.block_on(run(options, listen_port, target_host, target_port))
}

async fn run(
    options: ChannelOptions,
    listen_port: u16,
    target_host: String,
    target_port: u16,
) -> anyhow::Result<()> {
    let disable_audio = options.disable_audio;
    let video_params = options.video_params();
    let audio_params = options.audio_params();

    let channel = Arc::new(Channel::with_options("relay", options));

    channel.add_input(
        ConnectionKind::Tcp,
        "video_in",
        "0.0.0.0",
        listen_port,
        ConnectionMode::Server,
        OUTPUT_QUEUE_CAPACITY,
    )?;
    channel.add_output(
        ConnectionKind::Tcp,
        "out0",
        &target_host,
        target_port,
        ConnectionMode::Client,
        OUTPUT_QUEUE_CAPACITY,
    )?;

    let video = channel.add_video_stream(1, video_params)?;
    channel.map_stream(video.id(), "video_in")?;
    channel.map_stream(video.id(), "out0")?;

    if !disable_audio {
        channel.add_input(
            ConnectionKind::Tcp,
            "audio_in",
            "0.0.0.0",
            listen_port + 1,
            ConnectionMode::Server,
            OUTPUT_QUEUE_CAPACITY,
        )?;
        let audio = channel.add_audio_stream(2, audio_params)?;
        channel.map_stream(audio.id(), "audio_in")?;
        channel.map_stream(audio.id(), "out0")?;
    }

    channel.validate_configuration()?;
    channel.show_configuration(&mut std::io::stdout())?;

    println!();
    println!(
        "Relaying payloads from port {listen_port} to {target_host}:{target_port}, Ctrl+C to stop"
    );

    let handler = Arc::new(|name: &str, error: &Error| {
        eprintln!("connection {name} failed: {error}");
    });

    let runner = Arc::clone(&channel);
    let run = tokio::spawn(async move { runner.start(handler).await });

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    channel.shutdown();
    run.await??;

    for stream in channel.streams() {
        println!(
            "stream {}: received={} transmitted={} errors={}",
            stream.id(),
            stream.payloads_received(),
            stream.payloads_transmitted(),
            stream.payload_errors(),
        );
    }

    Ok(())
}
