//! Stream descriptors
//!
//! A stream is a logical sequence of payloads carrying one media type,
//! identified by a `u16` unique within its channel. The router only ever
//! consults `id()` and `payload_type()`; the descriptive fields (frame
//! geometry, audio sampling, language) are carried for the transports and
//! diagnostics, not interpreted.

use std::sync::atomic::{AtomicU64, Ordering};

/// Media type carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Video frames
    Video,
    /// Audio samples
    Audio,
    /// Ancillary data (captions, timecode, SCTE triggers)
    Ancillary,
}

/// Video frame geometry and rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    pub frame_width: u32,
    pub frame_height: u32,
    pub bytes_per_pixel: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
}

/// Channel layout of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioChannelGrouping {
    Mono,
    Stereo,
    /// 5.1 surround
    Surround51,
    /// 7.1 surround
    Surround71,
}

/// Audio sampling rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSamplingRate {
    Hz48000,
    Hz96000,
}

impl AudioSamplingRate {
    /// Sampling rate in hertz
    pub fn as_hz(self) -> u32 {
        match self {
            AudioSamplingRate::Hz48000 => 48_000,
            AudioSamplingRate::Hz96000 => 96_000,
        }
    }
}

/// Audio sampling and grouping description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub channel_grouping: AudioChannelGrouping,
    pub sampling_rate: AudioSamplingRate,
    pub bytes_per_sample: u32,
    /// RFC 5646 language tag, e.g. "en"
    pub language: String,
}

/// Typed stream variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Video(VideoParams),
    Audio(AudioParams),
    Ancillary,
}

/// A stream descriptor with atomic payload counters
///
/// Counters are monotonic and shared: any task holding the `Arc<Stream>` may
/// increment them. `transmitted` is the convenience aggregate across all
/// outputs; per-output accounting lives with the channel (see
/// `Channel::transmit_counts`).
#[derive(Debug)]
pub struct Stream {
    id: u16,
    kind: StreamKind,
    received: AtomicU64,
    transmitted: AtomicU64,
    errors: AtomicU64,
}

impl Stream {
    /// Create a stream descriptor
    pub fn new(id: u16, kind: StreamKind) -> Self {
        Self {
            id,
            kind,
            received: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Stream identifier, unique within a channel
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The typed descriptor variant
    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    /// Media type carried by this stream
    pub fn payload_type(&self) -> PayloadType {
        match self.kind {
            StreamKind::Video(_) => PayloadType::Video,
            StreamKind::Audio(_) => PayloadType::Audio,
            StreamKind::Ancillary => PayloadType::Ancillary,
        }
    }

    /// Count one received payload; returns the new total
    pub fn received_payload(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one transmitted payload (aggregate across outputs); returns the new total
    pub fn transmitted_payload(&self) -> u64 {
        self.transmitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one payload error; returns the new total
    pub fn payload_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total payloads received on this stream's input
    pub fn payloads_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Total payloads transmitted, aggregated across all outputs
    pub fn payloads_transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    /// Total payload errors (receive failures, drops, transmit failures)
    pub fn payload_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_params() -> VideoParams {
        VideoParams {
            frame_width: 1920,
            frame_height: 1080,
            bytes_per_pixel: 4,
            frame_rate_numerator: 60000,
            frame_rate_denominator: 1001,
        }
    }

    #[test]
    fn test_payload_type() {
        let video = Stream::new(1, StreamKind::Video(video_params()));
        let ancillary = Stream::new(3, StreamKind::Ancillary);

        assert_eq!(video.payload_type(), PayloadType::Video);
        assert_eq!(ancillary.payload_type(), PayloadType::Ancillary);
    }

    #[test]
    fn test_counters_return_new_value() {
        let stream = Stream::new(1, StreamKind::Ancillary);

        assert_eq!(stream.received_payload(), 1);
        assert_eq!(stream.received_payload(), 2);
        assert_eq!(stream.transmitted_payload(), 1);
        assert_eq!(stream.payload_error(), 1);

        assert_eq!(stream.payloads_received(), 2);
        assert_eq!(stream.payloads_transmitted(), 1);
        assert_eq!(stream.payload_errors(), 1);
    }

    #[test]
    fn test_sampling_rate_hz() {
        assert_eq!(AudioSamplingRate::Hz48000.as_hz(), 48_000);
        assert_eq!(AudioSamplingRate::Hz96000.as_hz(), 96_000);
    }
}
