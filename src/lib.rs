//! mediaswitch — in-process routing of live elementary streams
//!
//! This crate implements the channel core of a media-pipeline daemon: it
//! accepts payloads (video, audio, ancillary data) arriving on input
//! connections, looks up each payload's stream identifier, and forwards
//! copies to every output connection mapped to that stream. Connections
//! differ in transport — a framed TCP byte protocol, or a self-driven media
//! transport (CDI) — behind one asynchronous payload-oriented interface.
//!
//! The channel forwards at most once per output and drops when an output
//! cannot keep up; it does not transcode, inspect payload contents, or
//! persist state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediaswitch::{Channel, ConnectionKind, ConnectionMode, Error};
//!
//! # async fn run() -> mediaswitch::Result<()> {
//! let channel = Arc::new(Channel::new("relay"));
//!
//! channel.add_input(ConnectionKind::Tcp, "in0", "0.0.0.0", 2000, ConnectionMode::Server, 32)?;
//! channel.add_output(ConnectionKind::Tcp, "out0", "10.0.0.5", 2100, ConnectionMode::Client, 32)?;
//!
//! let video = channel.add_video_stream(1, channel.options().video_params())?;
//! channel.map_stream(video.id(), "in0")?;
//! channel.map_stream(video.id(), "out0")?;
//! channel.validate_configuration()?;
//!
//! let handler = Arc::new(|name: &str, error: &Error| {
//!     eprintln!("connection {name} failed: {error}");
//! });
//! channel.start(handler).await // resolves after channel.shutdown()
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod error;
pub mod options;
pub mod payload;
pub mod stream;

pub use channel::{build_runtime, Channel, ChannelHandler, PayloadBuffer, TransmitCounters};
pub use connection::{
    CdiConnection, CdiEndpoint, Connection, ConnectionCounters, ConnectionDirection,
    ConnectionKind, ConnectionMode, ConnectionStatus, ReceiveHandler, TcpConnection,
};
pub use error::{Error, Result};
pub use options::{ChannelOptions, ChannelRole, ChannelType, NetworkAdapterType};
pub use payload::Payload;
pub use stream::{
    AudioChannelGrouping, AudioParams, AudioSamplingRate, PayloadType, Stream, StreamKind,
    VideoParams,
};
