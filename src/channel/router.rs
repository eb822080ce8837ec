//! Channel router
//!
//! The channel owns the connections, the streams, the stream↔connection
//! bimap, and one bounded payload buffer per output connection. It drives
//! the receive→fan-out→transmit loops as spawned tasks that each capture an
//! `Arc<Channel>`, so the channel outlives every outstanding callback.
//!
//! Configuration (`add_*`, `map_stream`) happens before `start` and is
//! read-only afterwards; the only shared mutable state while running is the
//! payload buffers (own mutex) and the stream/connection counters (atomics).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::channel::buffer::PayloadBuffer;
use crate::channel::map::ChannelMap;
use crate::connection::{
    self, Connection, ConnectionDirection, ConnectionKind, ConnectionMode, ConnectionStatus,
};
use crate::error::{Error, Result};
use crate::options::ChannelOptions;
use crate::payload::Payload;
use crate::stream::{AudioParams, Stream, StreamKind, VideoParams};

/// Callback surface for channel-level failures
///
/// Invoked only when a connection (re-)establishment attempt fails outright.
/// Per-payload drops and transient receive/transmit errors are counted and
/// logged, never escalated here.
pub trait ChannelHandler: Send + Sync + 'static {
    fn connection_failed(&self, connection: &str, error: &Error);
}

impl<F> ChannelHandler for F
where
    F: Fn(&str, &Error) + Send + Sync + 'static,
{
    fn connection_failed(&self, connection: &str, error: &Error) {
        self(connection, error)
    }
}

/// Transmit accounting for one (stream, output connection) pair
///
/// A per-stream aggregate alone would be inflated N× by N outputs, so the
/// channel keeps one of these per mapping of a stream to an output.
#[derive(Debug, Default)]
pub struct TransmitCounters {
    transmitted: AtomicU64,
    errors: AtomicU64,
}

impl TransmitCounters {
    fn record_transmitted(&self) -> u64 {
        self.transmitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Payloads transmitted on this output for this stream
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    /// Drops and transmit failures on this output for this stream
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Configuration-phase state; read-only once the channel is running
#[derive(Default)]
struct Topology {
    connections: Vec<Arc<dyn Connection>>,
    streams: Vec<Arc<Stream>>,
    map: ChannelMap,
    buffers: HashMap<String, Arc<PayloadBuffer>>,
    tx_counters: HashMap<(String, u16), Arc<TransmitCounters>>,
}

impl Topology {
    fn connection(&self, name: &str) -> Option<&Arc<dyn Connection>> {
        self.connections.iter().find(|c| c.name() == name)
    }

    fn stream(&self, id: u16) -> Option<&Arc<Stream>> {
        self.streams.iter().find(|s| s.id() == id)
    }

    fn stream_connections(
        &self,
        stream_id: u16,
        direction: Option<ConnectionDirection>,
    ) -> Vec<Arc<dyn Connection>> {
        self.map
            .connections_of(stream_id)
            .filter_map(|name| self.connection(name))
            .filter(|c| direction.map_or(true, |d| c.direction() == d))
            .cloned()
            .collect()
    }

    fn connection_streams(&self, connection_name: &str) -> Vec<Arc<Stream>> {
        self.map
            .streams_of(connection_name)
            .filter_map(|id| self.stream(id))
            .cloned()
            .collect()
    }
}

/// In-process switch routing payloads from input connections to the output
/// connections mapped to each payload's stream
pub struct Channel {
    name: String,
    options: ChannelOptions,
    topology: RwLock<Topology>,
    active: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, ChannelOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: ChannelOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            options,
            topology: RwLock::new(Topology::default()),
            active: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Whether the channel is running (between `start` and `shutdown`)
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn ensure_configurable(&self) -> Result<()> {
        if self.is_active() {
            return Err(Error::config("channel configuration is sealed while running"));
        }
        Ok(())
    }

    /// Create and register an input connection with its payload buffer
    pub fn add_input(
        &self,
        kind: ConnectionKind,
        name: &str,
        host: &str,
        port: u16,
        mode: ConnectionMode,
        capacity: usize,
    ) -> Result<Arc<dyn Connection>> {
        let conn = connection::create(
            kind,
            name,
            host,
            port,
            mode,
            ConnectionDirection::In,
            &self.options,
        );
        self.add_connection(conn, capacity)
    }

    /// Create and register an output connection with its payload buffer
    pub fn add_output(
        &self,
        kind: ConnectionKind,
        name: &str,
        host: &str,
        port: u16,
        mode: ConnectionMode,
        capacity: usize,
    ) -> Result<Arc<dyn Connection>> {
        let conn = connection::create(
            kind,
            name,
            host,
            port,
            mode,
            ConnectionDirection::Out,
            &self.options,
        );
        self.add_connection(conn, capacity)
    }

    /// Register an externally built connection (custom transport)
    pub fn add_connection(
        &self,
        connection: Arc<dyn Connection>,
        capacity: usize,
    ) -> Result<Arc<dyn Connection>> {
        self.ensure_configurable()?;
        let mut topology = self.topology.write();
        if topology.connection(connection.name()).is_some() {
            return Err(Error::config(format!(
                "connection '{}' is already defined",
                connection.name()
            )));
        }
        topology.buffers.insert(
            connection.name().to_string(),
            Arc::new(PayloadBuffer::new(capacity)),
        );
        topology.connections.push(Arc::clone(&connection));
        Ok(connection)
    }

    pub fn add_video_stream(&self, id: u16, params: VideoParams) -> Result<Arc<Stream>> {
        self.add_stream_descriptor(Stream::new(id, StreamKind::Video(params)))
    }

    pub fn add_audio_stream(&self, id: u16, params: AudioParams) -> Result<Arc<Stream>> {
        self.add_stream_descriptor(Stream::new(id, StreamKind::Audio(params)))
    }

    pub fn add_ancillary_stream(&self, id: u16) -> Result<Arc<Stream>> {
        self.add_stream_descriptor(Stream::new(id, StreamKind::Ancillary))
    }

    fn add_stream_descriptor(&self, stream: Stream) -> Result<Arc<Stream>> {
        self.ensure_configurable()?;
        let mut topology = self.topology.write();
        if topology.stream(stream.id()).is_some() {
            return Err(Error::config(format!(
                "stream [{}] is already defined",
                stream.id()
            )));
        }
        let stream = Arc::new(stream);
        topology.streams.push(Arc::clone(&stream));
        Ok(stream)
    }

    /// Map a stream to a connection.
    ///
    /// A stream fans out to any number of outputs but must have exactly one
    /// input; a second input mapping is rejected.
    pub fn map_stream(&self, stream_id: u16, connection_name: &str) -> Result<()> {
        self.ensure_configurable()?;
        let mut topology = self.topology.write();

        let stream = topology
            .stream(stream_id)
            .cloned()
            .ok_or_else(|| Error::config(format!("an unrecognized stream [{stream_id}] was specified")))?;
        let connection = topology
            .connection(connection_name)
            .cloned()
            .ok_or_else(|| Error::config(format!("failed to map unknown connection '{connection_name}'")))?;

        if connection.direction() == ConnectionDirection::In {
            let inputs = topology.stream_connections(stream_id, Some(ConnectionDirection::In));
            if let Some(existing) = inputs.first() {
                return Err(Error::config(format!(
                    "stream [{stream_id}] is already assigned to connection '{}' and cannot \
                     also be assigned to connection '{connection_name}'; only a single input \
                     connection is allowed per stream",
                    existing.name()
                )));
            }
        }

        connection.add_stream(Arc::clone(&stream));
        topology.map.insert(connection_name, stream_id);

        if connection.direction() == ConnectionDirection::Out {
            topology.tx_counters.insert(
                (connection_name.to_string(), stream_id),
                Arc::new(TransmitCounters::default()),
            );
        }
        Ok(())
    }

    /// Check that every connection has at least one stream mapped to it
    pub fn validate_configuration(&self) -> Result<()> {
        let topology = self.topology.read();
        for connection in &topology.connections {
            if !topology.map.has_streams(connection.name()) {
                return Err(Error::config(format!(
                    "connection '{}' has no stream assigned",
                    connection.name()
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn connection(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.topology.read().connection(name).cloned()
    }

    pub fn stream(&self, id: u16) -> Option<Arc<Stream>> {
        self.topology.read().stream(id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.topology.read().connections.clone()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.topology.read().streams.clone()
    }

    /// Connections a stream is mapped to, optionally filtered by direction
    pub fn stream_connections(
        &self,
        stream_id: u16,
        direction: Option<ConnectionDirection>,
    ) -> Vec<Arc<dyn Connection>> {
        self.topology.read().stream_connections(stream_id, direction)
    }

    /// Streams mapped to a connection
    pub fn connection_streams(&self, connection_name: &str) -> Vec<Arc<Stream>> {
        self.topology.read().connection_streams(connection_name)
    }

    /// Transmit accounting for one (stream, output) pair
    pub fn transmit_counters(
        &self,
        stream_id: u16,
        connection_name: &str,
    ) -> Option<Arc<TransmitCounters>> {
        self.topology
            .read()
            .tx_counters
            .get(&(connection_name.to_string(), stream_id))
            .cloned()
    }

    /// Single accessor for an output's buffer; maintains the overflow latch
    fn connection_buffer(&self, name: &str) -> Arc<PayloadBuffer> {
        let buffer = self
            .topology
            .read()
            .buffers
            .get(name)
            .cloned()
            .expect("payload buffer registered with connection");
        maintain_overflow_latch(name, &buffer);
        buffer
    }

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------

    /// Open every connection and route payloads until `shutdown` is called.
    ///
    /// The future resolves only after shutdown; spawn it (or select against
    /// a signal) when the caller needs to keep driving other work.
    pub async fn start(self: &Arc<Self>, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(Error::config("channel is already running"));
        }
        let _ = self.shutdown.send_replace(false);

        tracing::info!(channel = %self.name, "waiting for channel connections to be ready");
        self.open_connections(&handler);

        let mut shutdown_rx = self.shutdown.subscribe();
        let _ = shutdown_rx.wait_for(|stop| *stop).await;

        tracing::info!(channel = %self.name, "channel shut down successfully");
        Ok(())
    }

    /// Stop routing, disconnect every connection, and release `start`.
    ///
    /// Idempotent: a second call is a no-op.
    pub fn shutdown(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(channel = %self.name, "channel is shutting down");

        let connections = self.connections();
        for conn in connections {
            conn.disconnect();
            tracing::info!(connection = %conn.name(), "connection closed successfully");
        }

        let _ = self.shutdown.send_replace(true);
    }

    /// Initiate dial/accept for every connection not currently open.
    ///
    /// A no-op for connections that are open or already being opened, so
    /// concurrent recovery triggers from the read and write paths collapse
    /// into a single attempt per connection.
    fn open_connections(self: &Arc<Self>, handler: &Arc<dyn ChannelHandler>) {
        let connections = self.connections();
        for conn in connections {
            if !conn.begin_open() {
                continue;
            }
            tracing::debug!(connection = %conn.name(), "opening connection");

            let channel = Arc::clone(self);
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                match conn.open().await {
                    Ok(()) => {
                        tracing::info!(
                            connection = %conn.name(),
                            "connection established successfully"
                        );
                        channel.connection_ready(conn, handler);
                    }
                    Err(e) => {
                        tracing::error!(
                            connection = %conn.name(),
                            error = %e,
                            "connection failed"
                        );
                        handler.connection_failed(conn.name(), &e);
                    }
                }
            });
        }
    }

    fn connection_ready(self: &Arc<Self>, conn: Arc<dyn Connection>, handler: Arc<dyn ChannelHandler>) {
        if !self.is_active() {
            return;
        }
        match conn.direction() {
            ConnectionDirection::In => {
                // One arm: self-driven transports deliver from it indefinitely,
                // byte-stream transports are re-armed per completion.
                self.async_read(Arc::clone(&conn), handler);

                // Discard stale queue contents accumulated for this input's
                // streams during a prior open attempt.
                let buffers: Vec<Arc<PayloadBuffer>> = {
                    let topology = self.topology.read();
                    let mut buffers = Vec::new();
                    for stream in topology.connection_streams(conn.name()) {
                        for output in
                            topology.stream_connections(stream.id(), Some(ConnectionDirection::Out))
                        {
                            if let Some(buffer) = topology.buffers.get(output.name()) {
                                buffers.push(Arc::clone(buffer));
                            }
                        }
                    }
                    buffers
                };
                for buffer in buffers {
                    buffer.clear();
                }
            }
            ConnectionDirection::Out => self.async_write(conn, handler),
        }
    }

    fn async_read(self: &Arc<Self>, conn: Arc<dyn Connection>, handler: Arc<dyn ChannelHandler>) {
        if !self.is_active() {
            return;
        }
        let channel = Arc::clone(self);
        let target = Arc::clone(&conn);
        conn.async_receive(Arc::new(move |result| {
            channel.read_complete(&target, result, &handler);
        }));
    }

    fn read_complete(
        self: &Arc<Self>,
        conn: &Arc<dyn Connection>,
        result: Result<Payload>,
        handler: &Arc<dyn ChannelHandler>,
    ) {
        if !self.is_active() {
            return;
        }

        match result {
            Ok(payload) => {
                conn.counters().record_received();
                self.route_payload(conn, payload, handler);
            }
            Err(e) => {
                conn.counters().record_error();
                if conn.status() != ConnectionStatus::Open {
                    tracing::warn!(connection = %conn.name(), "input connection is not ready");
                    self.open_connections(handler);
                    // The reopened connection starts a fresh receive
                    return;
                }
                tracing::warn!(
                    connection = %conn.name(),
                    error = %e,
                    "error receiving a payload"
                );
            }
        }

        if conn.kind() != ConnectionKind::Cdi {
            self.async_read(Arc::clone(conn), Arc::clone(handler));
        }
    }

    /// Fan a received payload out to every open output mapped to its stream
    fn route_payload(
        self: &Arc<Self>,
        conn: &Arc<dyn Connection>,
        payload: Payload,
        handler: &Arc<dyn ChannelHandler>,
    ) {
        let stream_id = payload.stream_identifier;
        let Some(stream) = self.stream(stream_id) else {
            conn.counters().record_error();
            tracing::warn!(
                connection = %conn.name(),
                stream = stream_id,
                "payload for unknown stream discarded"
            );
            return;
        };
        let received = stream.received_payload();

        for output in self.stream_connections(stream_id, Some(ConnectionDirection::Out)) {
            if output.status() != ConnectionStatus::Open {
                self.open_connections(handler);
                // Not enqueued while the output reconnects
                continue;
            }

            let buffer = self.connection_buffer(output.name());
            if buffer.enqueue(payload.clone()) {
                tracing::trace!(
                    stream = stream_id,
                    payload = received,
                    sequence = payload.sequence,
                    size = payload.size(),
                    connection = %output.name(),
                    queued = buffer.len(),
                    capacity = buffer.capacity(),
                    "payload queued"
                );
            } else {
                stream.payload_error();
                if let Some(counters) = self.transmit_counters(stream_id, output.name()) {
                    counters.record_error();
                }
            }
        }
    }

    fn async_write(self: &Arc<Self>, conn: Arc<dyn Connection>, handler: Arc<dyn ChannelHandler>) {
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.write_loop(conn, handler).await });
    }

    /// The single transmit task for one output connection
    async fn write_loop(self: Arc<Self>, conn: Arc<dyn Connection>, handler: Arc<dyn ChannelHandler>) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if !self.is_active() {
                return;
            }

            let buffer = self.connection_buffer(conn.name());
            let Some(payload) = buffer.front() else {
                tokio::select! {
                    _ = buffer.enqueued() => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            };

            let stream_id = payload.stream_identifier;
            let stream = self.stream(stream_id);
            tracing::trace!(
                stream = stream_id,
                sequence = payload.sequence,
                size = payload.size(),
                connection = %conn.name(),
                queued = buffer.len(),
                capacity = buffer.capacity(),
                "transmitting payload"
            );

            let result = conn.transmit(payload).await;

            match &result {
                Ok(()) => {
                    conn.counters().record_transmitted();
                    if let Some(stream) = &stream {
                        stream.transmitted_payload();
                    }
                    if let Some(counters) = self.transmit_counters(stream_id, conn.name()) {
                        counters.record_transmitted();
                    }
                }
                Err(_) => {
                    conn.counters().record_error();
                    if let Some(stream) = &stream {
                        stream.payload_error();
                    }
                    if let Some(counters) = self.transmit_counters(stream_id, conn.name()) {
                        counters.record_error();
                    }
                }
            }

            // Failed transmits discard the head; retries are out of scope
            buffer.pop_front();

            if let Err(e) = result {
                if conn.status() != ConnectionStatus::Open {
                    tracing::warn!(connection = %conn.name(), "output connection is not ready");
                    self.open_connections(&handler);
                    // The reopened connection starts a fresh transmit loop
                    return;
                }
                tracing::warn!(
                    connection = %conn.name(),
                    error = %e,
                    "error transmitting a payload"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Write a human-readable listing of the configured topology
    pub fn show_configuration(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let topology = self.topology.read();

        writeln!(out, "# Inputs")?;
        for connection in &topology.connections {
            if connection.direction() == ConnectionDirection::In {
                show_connection(&topology, connection, out)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "# Outputs")?;
        for connection in &topology.connections {
            if connection.direction() == ConnectionDirection::Out {
                show_connection(&topology, connection, out)?;
            }
        }
        Ok(())
    }

    /// Write the connections a stream is mapped to
    pub fn show_stream_connections(
        &self,
        stream_id: u16,
        direction: Option<ConnectionDirection>,
        out: &mut dyn io::Write,
    ) -> io::Result<()> {
        writeln!(out, "stream: {stream_id}")?;
        for connection in self.stream_connections(stream_id, direction) {
            let direction = match connection.direction() {
                ConnectionDirection::In => "input",
                ConnectionDirection::Out => "output",
            };
            writeln!(out, "connection: {} ({})", connection.name(), direction)?;
        }
        writeln!(out)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn show_connection(
    topology: &Topology,
    connection: &Arc<dyn Connection>,
    out: &mut dyn io::Write,
) -> io::Result<()> {
    writeln!(
        out,
        "  [{:<12}] type: {:?}, {}:{} ({:?})",
        connection.name(),
        connection.kind(),
        connection.host(),
        connection.port(),
        connection.mode(),
    )?;
    for stream in topology.connection_streams(connection.name()) {
        writeln!(out, "    stream: {}", stream.id())?;
    }
    Ok(())
}

/// Maintain the hysteretic overflow warning latch for one buffer.
///
/// Emits the warning on the transition to full and returns `true` for it;
/// the latch clears only once the level has fallen to the low-water mark,
/// so a full buffer warns once per episode rather than once per payload.
fn maintain_overflow_latch(connection: &str, buffer: &PayloadBuffer) -> bool {
    if buffer.is_full() && buffer.try_latch() {
        tracing::warn!(
            connection = %connection,
            capacity = buffer.capacity(),
            "payload buffer is full, one or more payloads will be discarded"
        );
        return true;
    }
    if buffer.latched() && buffer.len() <= low_water_mark(buffer.capacity()) {
        buffer.clear_latch();
    }
    false
}

/// 80% of capacity
fn low_water_mark(capacity: usize) -> usize {
    capacity * 4 / 5
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::connection::{CdiConnection, ConnectionCore, ConnectionCounters, ReceiveHandler};

    use super::*;

    /// Transport stand-in with scriptable delivery and failure behavior
    struct MockConnection {
        core: ConnectionCore,
        kind: ConnectionKind,
        state: Mutex<MockState>,
        transmitted: Mutex<Vec<Payload>>,
        open_calls: AtomicU32,
        receive_arms: AtomicU32,
        /// Park transmits forever (simulates a stalled peer)
        block_transmit: AtomicBool,
        /// Fault once when this many payloads have been transmitted;
        /// `u32::MAX` disables the trigger
        fault_after: AtomicU32,
    }

    #[derive(Default)]
    struct MockState {
        queue: VecDeque<Payload>,
        handler: Option<ReceiveHandler>,
    }

    impl MockConnection {
        fn new(name: &str, direction: ConnectionDirection, kind: ConnectionKind) -> Arc<Self> {
            Arc::new(Self {
                core: ConnectionCore::new(name, "127.0.0.1", 0, ConnectionMode::Client, direction),
                kind,
                state: Mutex::new(MockState::default()),
                transmitted: Mutex::new(Vec::new()),
                open_calls: AtomicU32::new(0),
                receive_arms: AtomicU32::new(0),
                block_transmit: AtomicBool::new(false),
                fault_after: AtomicU32::new(u32::MAX),
            })
        }

        fn input(name: &str) -> Arc<Self> {
            Self::new(name, ConnectionDirection::In, ConnectionKind::Tcp)
        }

        fn output(name: &str) -> Arc<Self> {
            Self::new(name, ConnectionDirection::Out, ConnectionKind::Tcp)
        }

        /// Deliver one payload to the channel, honoring arm semantics:
        /// one payload per arm for Tcp, every payload per arm for Cdi.
        fn push(&self, payload: Payload) {
            let handler = {
                let mut state = self.state.lock();
                let armed = match self.kind {
                    ConnectionKind::Tcp => state.handler.take(),
                    ConnectionKind::Cdi => state.handler.clone(),
                };
                match armed {
                    Some(handler) => Some(handler),
                    None => {
                        state.queue.push_back(payload.clone());
                        None
                    }
                }
            };
            if let Some(handler) = handler {
                handler(Ok(payload));
            }
        }

        fn transmitted_sequences(&self) -> Vec<u64> {
            self.transmitted.lock().iter().map(|p| p.sequence).collect()
        }

        fn transmit_count(&self) -> usize {
            self.transmitted.lock().len()
        }

        fn open_calls(&self) -> u32 {
            self.open_calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait::async_trait]
    impl Connection for MockConnection {
        fn name(&self) -> &str {
            &self.core.name
        }
        fn host(&self) -> &str {
            &self.core.host
        }
        fn port(&self) -> u16 {
            self.core.port
        }
        fn mode(&self) -> ConnectionMode {
            self.core.mode
        }
        fn direction(&self) -> ConnectionDirection {
            self.core.direction
        }
        fn kind(&self) -> ConnectionKind {
            self.kind
        }
        fn status(&self) -> ConnectionStatus {
            self.core.status()
        }
        fn counters(&self) -> &ConnectionCounters {
            &self.core.counters
        }
        fn begin_open(&self) -> bool {
            self.core.begin_open()
        }

        async fn open(&self) -> Result<()> {
            self.open_calls.fetch_add(1, Ordering::Relaxed);
            self.core.set_status(ConnectionStatus::Open);
            Ok(())
        }

        fn async_receive(&self, handler: ReceiveHandler) {
            self.receive_arms.fetch_add(1, Ordering::Relaxed);
            let ready = {
                let mut state = self.state.lock();
                match self.kind {
                    ConnectionKind::Tcp => match state.queue.pop_front() {
                        Some(payload) => Some((handler, vec![payload])),
                        None => {
                            state.handler = Some(handler);
                            None
                        }
                    },
                    ConnectionKind::Cdi => {
                        state.handler = Some(handler.clone());
                        let backlog: Vec<_> = state.queue.drain(..).collect();
                        (!backlog.is_empty()).then_some((handler, backlog))
                    }
                }
            };
            if let Some((handler, payloads)) = ready {
                for payload in payloads {
                    handler(Ok(payload));
                }
            }
        }

        async fn transmit(&self, payload: Payload) -> Result<()> {
            if self.block_transmit.load(Ordering::Relaxed) {
                std::future::pending::<()>().await;
            }
            let fault_after = self.fault_after.load(Ordering::Relaxed);
            if fault_after != u32::MAX && self.transmit_count() as u32 >= fault_after {
                self.fault_after.store(u32::MAX, Ordering::Relaxed);
                self.core.fault();
                return Err(Error::ConnectionClosed);
            }
            self.transmitted.lock().push(payload);
            Ok(())
        }

        fn disconnect(&self) {
            self.core.set_closed();
        }

        fn add_stream(&self, stream: Arc<Stream>) {
            self.core.add_stream(stream);
        }

        fn stream(&self, id: u16) -> Option<Arc<Stream>> {
            self.core.stream(id)
        }
    }

    fn noop_handler() -> Arc<dyn ChannelHandler> {
        Arc::new(|_: &str, _: &Error| {})
    }

    fn payload(stream_id: u16, sequence: u64) -> Payload {
        Payload::new(stream_id, sequence, Bytes::from_static(b"payload"))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not met within timeout");
    }

    /// Build a started channel with one mock input and the given mock
    /// outputs, all mapped to one ancillary stream
    async fn relay_fixture(
        stream_id: u16,
        capacity: usize,
        outputs: &[Arc<MockConnection>],
    ) -> (Arc<Channel>, Arc<MockConnection>, Arc<Stream>) {
        let channel = Arc::new(Channel::new("test"));
        let input = MockConnection::input("in0");

        channel
            .add_connection(input.clone(), capacity)
            .unwrap();
        for output in outputs {
            channel.add_connection(output.clone(), capacity).unwrap();
        }

        let stream = channel.add_ancillary_stream(stream_id).unwrap();
        channel.map_stream(stream_id, "in0").unwrap();
        for output in outputs {
            channel.map_stream(stream_id, output.name()).unwrap();
        }
        channel.validate_configuration().unwrap();

        let runner = Arc::clone(&channel);
        tokio::spawn(async move { runner.start(noop_handler()).await });

        let armed = input.clone();
        wait_until(move || armed.receive_arms.load(Ordering::Relaxed) > 0).await;

        (channel, input, stream)
    }

    #[tokio::test]
    async fn test_relay_preserves_order_and_counts() {
        let out0 = MockConnection::output("out0");
        let (channel, input, stream) = relay_fixture(100, 4, &[out0.clone()]).await;

        for sequence in 1..=10 {
            input.push(payload(100, sequence));
            let out = out0.clone();
            wait_until(move || out.transmit_count() == sequence as usize).await;
        }

        assert_eq!(out0.transmitted_sequences(), (1..=10).collect::<Vec<_>>());
        assert_eq!(stream.payloads_received(), 10);
        assert_eq!(stream.payloads_transmitted(), 10);
        assert_eq!(stream.payload_errors(), 0);
        assert_eq!(input.counters().received(), 10);
        assert_eq!(out0.counters().transmitted(), 10);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_blocked_output_drops_excess() {
        let out0 = MockConnection::output("out0");
        out0.block_transmit.store(true, Ordering::Relaxed);
        let (channel, input, stream) = relay_fixture(100, 4, &[out0.clone()]).await;

        for sequence in 1..=8 {
            input.push(payload(100, sequence));
            tokio::task::yield_now().await;
        }

        // The transmit task holds the head without popping it, so the
        // buffer retains the first four payloads and drops the rest
        let buffer = channel.connection_buffer("out0");
        assert_eq!(buffer.len(), 4);
        assert!(buffer.latched());
        assert_eq!(stream.payload_errors(), 4);
        assert_eq!(out0.transmit_count(), 0);

        let pair = channel.transmit_counters(100, "out0").unwrap();
        assert_eq!(pair.errors(), 4);
        assert_eq!(pair.transmitted(), 0);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_fanout_to_two_outputs() {
        let a = MockConnection::output("a");
        let b = MockConnection::output("b");
        let (channel, input, stream) = relay_fixture(7, 8, &[a.clone(), b.clone()]).await;

        for sequence in 1..=3 {
            input.push(payload(7, sequence));
        }
        let (wa, wb) = (a.clone(), b.clone());
        wait_until(move || wa.transmit_count() == 3 && wb.transmit_count() == 3).await;

        assert_eq!(a.transmitted_sequences(), vec![1, 2, 3]);
        assert_eq!(b.transmitted_sequences(), vec![1, 2, 3]);

        // Aggregate counts both outputs; the pair counters do not
        assert_eq!(stream.payloads_transmitted(), 6);
        assert_eq!(channel.transmit_counters(7, "a").unwrap().transmitted(), 3);
        assert_eq!(channel.transmit_counters(7, "b").unwrap().transmitted(), 3);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_output_fault_triggers_reconnect() {
        let a = MockConnection::output("a");
        let b = MockConnection::output("b");
        b.fault_after.store(1, Ordering::Relaxed);
        let (channel, input, _stream) = relay_fixture(7, 8, &[a.clone(), b.clone()]).await;

        for sequence in 1..=5 {
            input.push(payload(7, sequence));
            let wa = a.clone();
            wait_until(move || wa.transmit_count() == sequence as usize).await;
        }

        // The healthy output saw everything
        assert_eq!(a.transmitted_sequences(), vec![1, 2, 3, 4, 5]);

        // The faulted output was reopened and resumed; the payload in
        // flight during the fault was discarded, not retried
        let wb = b.clone();
        wait_until(move || wb.open_calls() == 2).await;
        let wb = b.clone();
        wait_until(move || wb.transmit_count() >= 2).await;
        assert_eq!(b.transmitted_sequences()[0], 1);
        assert!(!b.transmitted_sequences().contains(&2));

        channel.shutdown();
    }

    #[test]
    fn test_duplicate_input_mapping_rejected() {
        let channel = Channel::new("test");
        channel
            .add_connection(MockConnection::input("in0"), 4)
            .unwrap();
        channel
            .add_connection(MockConnection::input("in1"), 4)
            .unwrap();
        channel.add_ancillary_stream(42).unwrap();

        channel.map_stream(42, "in0").unwrap();
        let result = channel.map_stream(42, "in1");
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        // Mapping the same stream to outputs is unrestricted
        channel
            .add_connection(MockConnection::output("out0"), 4)
            .unwrap();
        channel
            .add_connection(MockConnection::output("out1"), 4)
            .unwrap();
        channel.map_stream(42, "out0").unwrap();
        channel.map_stream(42, "out1").unwrap();
    }

    #[tokio::test]
    async fn test_cdi_input_armed_once() {
        let channel = Arc::new(Channel::new("test"));
        let cdi = Arc::new(CdiConnection::new(
            "cdi0",
            "198.51.100.10",
            2000,
            ConnectionMode::Client,
            ConnectionDirection::In,
            channel.options(),
        ));
        let out0 = MockConnection::output("out0");

        channel.add_connection(cdi.clone(), 128).unwrap();
        channel.add_connection(out0.clone(), 128).unwrap();
        channel.add_ancillary_stream(9).unwrap();
        channel.map_stream(9, "cdi0").unwrap();
        channel.map_stream(9, "out0").unwrap();
        channel.validate_configuration().unwrap();

        let runner = Arc::clone(&channel);
        tokio::spawn(async move { runner.start(noop_handler()).await });

        let armed = cdi.clone();
        wait_until(move || armed.receive_arms() > 0).await;

        let endpoint = cdi.endpoint();
        for sequence in 0..100 {
            endpoint.deliver(payload(9, sequence));
        }

        let watched = out0.clone();
        wait_until(move || watched.transmit_count() == 100).await;

        assert_eq!(cdi.receive_arms(), 1);
        assert_eq!(out0.transmitted_sequences(), (0..100).collect::<Vec<_>>());

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_stream_payload_discarded() {
        let out0 = MockConnection::output("out0");
        let (channel, input, _stream) = relay_fixture(100, 4, &[out0.clone()]).await;

        input.push(payload(999, 1));
        let counted = input.clone();
        wait_until(move || counted.counters().errors() == 1).await;

        assert_eq!(out0.transmit_count(), 0);
        assert!(channel.is_active());

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let out0 = MockConnection::output("out0");
        let (channel, input, _stream) = relay_fixture(100, 4, &[out0.clone()]).await;

        channel.shutdown();
        assert!(!channel.is_active());
        assert_eq!(input.status(), ConnectionStatus::Closed);

        // Second call is a no-op
        channel.shutdown();
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn test_open_connections_noop_when_all_open() {
        let out0 = MockConnection::output("out0");
        let (channel, input, _stream) = relay_fixture(100, 4, &[out0.clone()]).await;

        let watched = out0.clone();
        wait_until(move || watched.open_calls() == 1).await;

        channel.open_connections(&noop_handler());
        tokio::task::yield_now().await;

        assert_eq!(input.open_calls(), 1);
        assert_eq!(out0.open_calls(), 1);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_configuration_sealed_while_running() {
        let out0 = MockConnection::output("out0");
        let (channel, _input, _stream) = relay_fixture(100, 4, &[out0]).await;

        let result = channel.add_ancillary_stream(50);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        let result = channel.add_connection(MockConnection::input("late"), 4);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        channel.shutdown();
    }

    #[test]
    fn test_validate_requires_mapped_streams() {
        let channel = Channel::new("test");
        channel
            .add_connection(MockConnection::input("in0"), 4)
            .unwrap();
        channel.add_ancillary_stream(1).unwrap();

        let result = channel.validate_configuration();
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        channel.map_stream(1, "in0").unwrap();
        channel.validate_configuration().unwrap();
    }

    #[test]
    fn test_duplicate_names_and_ids_rejected() {
        let channel = Channel::new("test");
        channel
            .add_connection(MockConnection::input("in0"), 4)
            .unwrap();
        let result = channel.add_connection(MockConnection::output("in0"), 4);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        channel.add_ancillary_stream(5).unwrap();
        let result = channel.add_ancillary_stream(5);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_map_stream_unknown_targets() {
        let channel = Channel::new("test");
        channel
            .add_connection(MockConnection::input("in0"), 4)
            .unwrap();
        channel.add_ancillary_stream(1).unwrap();

        assert!(matches!(
            channel.map_stream(2, "in0"),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            channel.map_stream(1, "nope"),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_overflow_latch_hysteresis() {
        let buffer = PayloadBuffer::new(5);
        for sequence in 0..5 {
            buffer.enqueue(payload(1, sequence));
        }
        assert!(buffer.is_full());

        // Exactly one warning while the buffer stays full
        assert!(maintain_overflow_latch("out0", &buffer));
        assert!(!maintain_overflow_latch("out0", &buffer));
        assert!(buffer.latched());

        // Level at the low-water mark clears the latch
        buffer.pop_front();
        assert_eq!(buffer.len(), low_water_mark(buffer.capacity()));
        assert!(!maintain_overflow_latch("out0", &buffer));
        assert!(!buffer.latched());

        // A later full episode warns again
        buffer.enqueue(payload(1, 9));
        assert!(maintain_overflow_latch("out0", &buffer));
    }

    #[test]
    fn test_show_configuration_lists_topology() {
        let channel = Channel::new("test");
        channel
            .add_connection(MockConnection::input("in0"), 4)
            .unwrap();
        channel
            .add_connection(MockConnection::output("out0"), 4)
            .unwrap();
        channel.add_ancillary_stream(3).unwrap();
        channel.map_stream(3, "in0").unwrap();
        channel.map_stream(3, "out0").unwrap();

        let mut listing = Vec::new();
        channel.show_configuration(&mut listing).unwrap();
        let listing = String::from_utf8(listing).unwrap();

        assert!(listing.contains("# Inputs"));
        assert!(listing.contains("# Outputs"));
        assert!(listing.contains("in0"));
        assert!(listing.contains("out0"));
        assert!(listing.contains("stream: 3"));

        let mut mapping = Vec::new();
        channel
            .show_stream_connections(3, None, &mut mapping)
            .unwrap();
        let mapping = String::from_utf8(mapping).unwrap();
        assert!(mapping.contains("in0 (input)"));
        assert!(mapping.contains("out0 (output)"));
    }
}
