//! Asynchronous connection endpoints
//!
//! A connection is one endpoint of a channel: it dials or accepts per its
//! mode, then carries payloads in one direction. The router drives every
//! connection through the [`Connection`] trait; a new transport is pluggable
//! by implementing it and registering the connection with
//! `Channel::add_connection`.
//!
//! # Receive model
//!
//! Receive is handler-armed rather than pulled, because the two transport
//! classes deliver differently:
//!
//! - **Byte-stream transports** ([`TcpConnection`]) deliver exactly one
//!   payload per [`Connection::async_receive`] arm; the router re-arms after
//!   every completion.
//! - **Self-driven transports** ([`CdiConnection`]) are armed once when the
//!   connection opens; the transport's own delivery machinery invokes the
//!   handler for every payload thereafter.
//!
//! Open and transmit are plain async operations: the router always awaits
//! them from its own tasks, so the await itself is the submit-and-resume.

pub mod cdi;
pub mod tcp;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::error::Result;
use crate::options::ChannelOptions;
use crate::payload::Payload;
use crate::stream::Stream;

pub use cdi::{CdiConnection, CdiEndpoint};
pub use tcp::TcpConnection;

/// Whether the connection dials out or accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Client,
    Server,
}

/// Which way payloads flow through the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// Payloads arrive here and enter the channel
    In,
    /// Payloads leave the channel here
    Out,
}

/// Transport class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Byte-stream transport with length-prefixed payload framing
    Tcp,
    /// Self-driven media transport; receive is armed once at open time
    Cdi,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Never opened, or closed deliberately
    Closed = 0,
    /// An open attempt owns the connection
    Connecting = 1,
    /// Ready to carry payloads
    Open = 2,
    /// Lost at runtime; eligible for reconnection
    Faulted = 3,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Open,
            3 => ConnectionStatus::Faulted,
            _ => ConnectionStatus::Closed,
        }
    }
}

/// Per-connection payload counters
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    received: AtomicU64,
    transmitted: AtomicU64,
    errors: AtomicU64,
}

impl ConnectionCounters {
    /// Count one received payload; returns the new total
    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one transmitted payload; returns the new total
    pub fn record_transmitted(&self) -> u64 {
        self.transmitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one error; returns the new total
    pub fn record_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Completion handler for an armed receive
///
/// Invoked with one delivered payload, or with the transport error that ended
/// the attempt. May run on the transport's task (inline delivery) or on a
/// runtime task (deferred delivery); see `ChannelOptions::inline_handlers`.
pub type ReceiveHandler = Arc<dyn Fn(Result<Payload>) + Send + Sync>;

/// Asynchronous bidirectional endpoint
///
/// All methods take `&self`; implementations share their state internally so
/// that any outstanding task may hold a clone of the `Arc<dyn Connection>`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name, unique within a channel
    fn name(&self) -> &str;

    /// Peer host (Client mode) or bind host (Server mode)
    fn host(&self) -> &str;

    fn port(&self) -> u16;

    fn mode(&self) -> ConnectionMode;

    fn direction(&self) -> ConnectionDirection;

    fn kind(&self) -> ConnectionKind;

    fn status(&self) -> ConnectionStatus;

    fn counters(&self) -> &ConnectionCounters;

    /// Reserve the connection for an open attempt.
    ///
    /// Transitions `Closed`/`Faulted` → `Connecting` and returns `true`;
    /// returns `false` when another attempt already owns the connection or it
    /// is already open. Callers must only invoke [`Connection::open`] after a
    /// successful reservation.
    fn begin_open(&self) -> bool;

    /// Dial (Client) or bind and accept (Server) per the connection mode.
    ///
    /// Status moves to `Open` on success, back to `Closed` on failure.
    async fn open(&self) -> Result<()>;

    /// Arm the receive path with a completion handler.
    ///
    /// Byte-stream transports deliver exactly one payload per arm and must be
    /// re-armed; self-driven transports keep the handler and invoke it per
    /// delivered payload. Arming again replaces the previous handler.
    fn async_receive(&self, handler: ReceiveHandler);

    /// Transmit one payload; resolves when the transport has confirmed it.
    async fn transmit(&self, payload: Payload) -> Result<()>;

    /// Close the connection synchronously. Idempotent; status → `Closed`.
    fn disconnect(&self);

    /// Bind a stream to this connection
    fn add_stream(&self, stream: Arc<Stream>);

    /// Look up a bound stream by identifier
    fn stream(&self, id: u16) -> Option<Arc<Stream>>;
}

/// Construct a connection of the given transport class
///
/// Transport-level knobs (`tx_timeout`, `buffer_delay`, adapter type, inline
/// handler delivery) are taken from the options record.
pub fn create(
    kind: ConnectionKind,
    name: &str,
    host: &str,
    port: u16,
    mode: ConnectionMode,
    direction: ConnectionDirection,
    options: &ChannelOptions,
) -> Arc<dyn Connection> {
    match kind {
        ConnectionKind::Tcp => Arc::new(TcpConnection::new(name, host, port, mode, direction, options)),
        ConnectionKind::Cdi => Arc::new(CdiConnection::new(name, host, port, mode, direction, options)),
    }
}

/// State shared by every connection implementation
pub(crate) struct ConnectionCore {
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) mode: ConnectionMode,
    pub(crate) direction: ConnectionDirection,
    status: AtomicU8,
    pub(crate) counters: ConnectionCounters,
    streams: RwLock<Vec<Arc<Stream>>>,
    /// Signaled by `disconnect` so pending transport operations resolve
    pub(crate) closed: Notify,
}

impl ConnectionCore {
    pub(crate) fn new(
        name: &str,
        host: &str,
        port: u16,
        mode: ConnectionMode,
        direction: ConnectionDirection,
    ) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            mode,
            direction,
            status: AtomicU8::new(ConnectionStatus::Closed as u8),
            counters: ConnectionCounters::default(),
            streams: RwLock::new(Vec::new()),
            closed: Notify::new(),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// `Closed`/`Faulted` → `Connecting`; false when already owned or open
    pub(crate) fn begin_open(&self) -> bool {
        let connecting = ConnectionStatus::Connecting as u8;
        for from in [ConnectionStatus::Closed, ConnectionStatus::Faulted] {
            if self
                .status
                .compare_exchange(from as u8, connecting, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Mark the connection lost at runtime. Only demotes from `Open`, so a
    /// deliberate `disconnect` is never overridden by a late transport error.
    pub(crate) fn fault(&self) {
        let _ = self.status.compare_exchange(
            ConnectionStatus::Open as u8,
            ConnectionStatus::Faulted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Move to `Closed`; returns whether the status actually changed
    pub(crate) fn set_closed(&self) -> bool {
        self.status.swap(ConnectionStatus::Closed as u8, Ordering::AcqRel)
            != ConnectionStatus::Closed as u8
    }

    pub(crate) fn add_stream(&self, stream: Arc<Stream>) {
        self.streams.write().push(stream);
    }

    pub(crate) fn stream(&self, id: u16) -> Option<Arc<Stream>> {
        self.streams.read().iter().find(|s| s.id() == id).cloned()
    }
}
