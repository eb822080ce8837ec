//! Channel options
//!
//! Process-wide record of recognized options. The router treats the
//! transport-level knobs (`buffer_delay`, `tx_timeout`, adapter fields) as
//! opaque and forwards the stream geometry/audio fields as defaults for
//! stream descriptor construction. Topology selectors (`channel_type`,
//! `channel_role`) are interpreted by the embedding daemon, not by the core.

use std::path::PathBuf;
use std::time::Duration;

use crate::stream::{AudioChannelGrouping, AudioParams, AudioSamplingRate, VideoParams};

/// Pipeline topology selector (consumer of the core)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// TCP ingress, CDI egress
    TcpToCdi,
    /// CDI ingress, TCP egress
    CdiToTcp,
    /// TCP on both sides
    TcpToTcp,
}

/// Which half of a pipeline this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Transmitter,
    Receiver,
}

/// Network adapter class for the CDI-side transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAdapterType {
    /// Elastic Fabric Adapter (RDMA)
    Efa,
    /// Kernel UDP sockets
    Socket,
    /// Libfabric over sockets
    SocketLibfabric,
}

/// Recognized channel options
///
/// Construct with `Default` and override with the builder methods:
///
/// ```
/// use mediaswitch::options::ChannelOptions;
///
/// let options = ChannelOptions::default()
///     .num_threads(4)
///     .tx_timeout_ms(500);
/// assert_eq!(options.num_threads, 4);
/// ```
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Diagnostic verbosity
    pub log_level: tracing::Level,

    /// Diagnostic sink; `None` logs to stderr
    pub log_file: Option<PathBuf>,

    /// Pipeline topology selector
    pub channel_type: ChannelType,

    /// Pipeline role selector
    pub channel_role: ChannelRole,

    /// Deliver completion handlers inline on the transport task instead of
    /// deferring them onto the runtime. Deferred is the safe default for
    /// multi-worker runtimes.
    pub inline_handlers: bool,

    /// Executor worker count; 0 runs the loop on the caller thread
    pub num_threads: usize,

    /// Adapter class for CDI connections
    pub adapter_type: NetworkAdapterType,

    /// Local bind address default for connection construction
    pub local_ip: String,

    /// Remote address default for connection construction
    pub remote_ip: String,

    /// Default port when a topology does not name one
    pub port_number: u16,

    pub video_in_port: u16,
    pub audio_in_port: u16,
    pub video_out_port: u16,
    pub audio_out_port: u16,

    /// CDI reorder/delay buffer in milliseconds (opaque to the router)
    pub buffer_delay_ms: u32,

    /// Per-transmit timeout in milliseconds; 0 disables the timeout
    pub tx_timeout_ms: u32,

    /// Payload pool sizing, forwarded to the external pool allocator
    pub large_buffer_pool_item_size: u32,
    pub large_buffer_pool_max_items: u32,
    pub small_buffer_pool_item_size: u32,
    pub small_buffer_pool_max_items: u32,

    /// Default video stream configuration
    pub video_stream_id: u16,
    pub frame_width: u32,
    pub frame_height: u32,
    pub bytes_per_pixel: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,

    /// Default audio stream configuration
    pub disable_audio: bool,
    pub audio_stream_id: u16,
    pub audio_channel_grouping: AudioChannelGrouping,
    pub audio_sampling_rate: AudioSamplingRate,
    pub audio_bytes_per_sample: u32,
    pub audio_stream_language: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            log_file: None,
            channel_type: ChannelType::TcpToCdi,
            channel_role: ChannelRole::Transmitter,
            inline_handlers: false,
            num_threads: 0,
            adapter_type: NetworkAdapterType::Efa,
            local_ip: "0.0.0.0".to_string(),
            remote_ip: "127.0.0.1".to_string(),
            port_number: 2000,
            video_in_port: 2000,
            audio_in_port: 2001,
            video_out_port: 2100,
            audio_out_port: 2101,
            buffer_delay_ms: 0,
            tx_timeout_ms: 0,
            large_buffer_pool_item_size: 8 * 1024 * 1024,
            large_buffer_pool_max_items: 48,
            small_buffer_pool_item_size: 64 * 1024,
            small_buffer_pool_max_items: 960,
            video_stream_id: 1,
            frame_width: 1920,
            frame_height: 1080,
            bytes_per_pixel: 4,
            frame_rate_numerator: 60000,
            frame_rate_denominator: 1001,
            disable_audio: false,
            audio_stream_id: 2,
            audio_channel_grouping: AudioChannelGrouping::Stereo,
            audio_sampling_rate: AudioSamplingRate::Hz48000,
            audio_bytes_per_sample: 3,
            audio_stream_language: "en".to_string(),
        }
    }
}

impl ChannelOptions {
    /// Set the executor worker count
    pub fn num_threads(mut self, count: usize) -> Self {
        self.num_threads = count;
        self
    }

    /// Deliver completion handlers inline on the transport task
    pub fn inline_handlers(mut self, inline: bool) -> Self {
        self.inline_handlers = inline;
        self
    }

    /// Set the per-transmit timeout in milliseconds (0 disables it)
    pub fn tx_timeout_ms(mut self, timeout: u32) -> Self {
        self.tx_timeout_ms = timeout;
        self
    }

    /// Set the CDI buffer delay in milliseconds
    pub fn buffer_delay_ms(mut self, delay: u32) -> Self {
        self.buffer_delay_ms = delay;
        self
    }

    /// Set the topology selectors
    pub fn topology(mut self, channel_type: ChannelType, channel_role: ChannelRole) -> Self {
        self.channel_type = channel_type;
        self.channel_role = channel_role;
        self
    }

    /// Per-transmit timeout as a `Duration`; `None` when disabled
    pub fn tx_timeout(&self) -> Option<Duration> {
        (self.tx_timeout_ms > 0).then(|| Duration::from_millis(u64::from(self.tx_timeout_ms)))
    }

    /// Default video stream parameters from the configured geometry
    pub fn video_params(&self) -> VideoParams {
        VideoParams {
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            bytes_per_pixel: self.bytes_per_pixel,
            frame_rate_numerator: self.frame_rate_numerator,
            frame_rate_denominator: self.frame_rate_denominator,
        }
    }

    /// Default audio stream parameters from the configured sampling fields
    pub fn audio_params(&self) -> AudioParams {
        AudioParams {
            channel_grouping: self.audio_channel_grouping,
            sampling_rate: self.audio_sampling_rate,
            bytes_per_sample: self.audio_bytes_per_sample,
            language: self.audio_stream_language.clone(),
        }
    }
}
