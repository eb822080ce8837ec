//! Channel core: routing payloads between connections
//!
//! A channel is an in-process switch. Payloads arriving on input connections
//! are looked up by stream identifier and copies are queued to every output
//! connection mapped to that stream; an independent transmit task per output
//! drains its queue.
//!
//! # Architecture
//!
//! ```text
//!                       Arc<Channel>
//!            ┌───────────────────────────────┐
//!            │ connections / streams         │
//!            │ channel_map (stream ↔ conn)   │
//!            │ buffers: name → PayloadBuffer │
//!            └──────────────┬────────────────┘
//!                           │
//!      receive ──► read_complete ──► fan-out by stream id
//!                           │
//!             ┌─────────────┼─────────────┐
//!             ▼             ▼             ▼
//!        [buffer out0] [buffer out1] [buffer out2]   bounded, drop on overflow
//!             │             │             │
//!        write task     write task    write task     one per output, in order
//!             │             │             │
//!         transmit      transmit      transmit
//! ```
//!
//! Slow outputs never back-pressure fast ones: each output's buffer drops
//! locally when full, and the drop is counted against the stream.

pub mod buffer;
pub mod executor;
pub mod map;
pub mod router;

pub use buffer::PayloadBuffer;
pub use executor::build_runtime;
pub use map::ChannelMap;
pub use router::{Channel, ChannelHandler, TransmitCounters};
