//! CDI connection endpoint
//!
//! The CDI transport class is self-driven: after the receive path is armed
//! once at open time, the transport's own delivery machinery invokes the
//! handler for every payload. The SDK binding itself lives outside this
//! crate; the adapter half of the connection is exposed as a [`CdiEndpoint`]
//! handle through which the glue code (or a test) delivers inbound payloads.
//! Outbound payloads handed to [`Connection::transmit`] are queued for the
//! adapter to drain via [`CdiConnection::transmit_queue`].
//!
//! Delivery order is preserved in both notification modes: inline delivery
//! invokes the handler on the delivering thread, deferred delivery funnels
//! payloads through a single dispatch task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::options::{ChannelOptions, NetworkAdapterType};
use crate::payload::Payload;
use crate::stream::Stream;

use super::{
    Connection, ConnectionCore, ConnectionCounters, ConnectionDirection, ConnectionKind,
    ConnectionMode, ConnectionStatus, ReceiveHandler,
};

struct CdiShared {
    core: ConnectionCore,
    inline_handlers: bool,
    handler: Mutex<Option<ReceiveHandler>>,
    inbound_tx: mpsc::UnboundedSender<Result<Payload>>,
}

/// Adapter-side handle of a [`CdiConnection`]
///
/// Cloneable; the SDK glue keeps one per connection and calls
/// [`CdiEndpoint::deliver`] for each payload the adapter hands it.
#[derive(Clone)]
pub struct CdiEndpoint {
    shared: Arc<CdiShared>,
}

impl CdiEndpoint {
    /// Deliver one inbound payload to the armed receive handler
    pub fn deliver(&self, payload: Payload) {
        self.dispatch(Ok(payload));
    }

    /// Deliver a transport error to the armed receive handler
    pub fn deliver_error(&self, error: Error) {
        self.dispatch(Err(error));
    }

    fn dispatch(&self, result: Result<Payload>) {
        if self.shared.inline_handlers {
            let handler = self.shared.handler.lock().clone();
            match handler {
                Some(handler) => handler(result),
                None => {
                    tracing::warn!(
                        connection = %self.shared.core.name,
                        "payload delivered before receive was armed, discarding"
                    );
                }
            }
        } else {
            // Queued until the dispatch task drains it; order is preserved
            let _ = self.shared.inbound_tx.send(result);
        }
    }
}

/// Self-driven media transport endpoint
pub struct CdiConnection {
    shared: Arc<CdiShared>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Payload>>>>,
    outbound_tx: mpsc::UnboundedSender<Payload>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Payload>>>,
    receive_arms: AtomicU32,
    adapter: NetworkAdapterType,
    buffer_delay: Duration,
}

impl CdiConnection {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        mode: ConnectionMode,
        direction: ConnectionDirection,
        options: &ChannelOptions,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(CdiShared {
                core: ConnectionCore::new(name, host, port, mode, direction),
                inline_handlers: options.inline_handlers,
                handler: Mutex::new(None),
                inbound_tx,
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            receive_arms: AtomicU32::new(0),
            adapter: options.adapter_type,
            buffer_delay: Duration::from_millis(u64::from(options.buffer_delay_ms)),
        }
    }

    /// The adapter-side handle for delivering inbound payloads
    pub fn endpoint(&self) -> CdiEndpoint {
        CdiEndpoint {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take the outbound payload queue; the adapter glue drains it.
    /// Returns `None` after the first call.
    pub fn transmit_queue(&self) -> Option<mpsc::UnboundedReceiver<Payload>> {
        self.outbound_rx.lock().take()
    }

    /// How many times the receive path has been armed
    pub fn receive_arms(&self) -> u32 {
        self.receive_arms.load(Ordering::Relaxed)
    }

    /// Configured adapter class
    pub fn adapter(&self) -> NetworkAdapterType {
        self.adapter
    }

    /// Configured reorder/delay buffer
    pub fn buffer_delay(&self) -> Duration {
        self.buffer_delay
    }
}

#[async_trait]
impl Connection for CdiConnection {
    fn name(&self) -> &str {
        &self.shared.core.name
    }

    fn host(&self) -> &str {
        &self.shared.core.host
    }

    fn port(&self) -> u16 {
        self.shared.core.port
    }

    fn mode(&self) -> ConnectionMode {
        self.shared.core.mode
    }

    fn direction(&self) -> ConnectionDirection {
        self.shared.core.direction
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Cdi
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.core.status()
    }

    fn counters(&self) -> &ConnectionCounters {
        &self.shared.core.counters
    }

    fn begin_open(&self) -> bool {
        self.shared.core.begin_open()
    }

    async fn open(&self) -> Result<()> {
        // Adapter initialization is the SDK glue's concern; the connection
        // is ready as soon as the delivery queues exist.
        self.shared.core.set_status(ConnectionStatus::Open);
        tracing::debug!(
            connection = %self.shared.core.name,
            adapter = ?self.adapter,
            "adapter endpoint ready"
        );
        Ok(())
    }

    fn async_receive(&self, handler: ReceiveHandler) {
        *self.shared.handler.lock() = Some(handler);
        self.receive_arms.fetch_add(1, Ordering::Relaxed);

        if self.shared.inline_handlers {
            return;
        }

        // Deferred delivery: a single dispatch task keeps payloads ordered.
        // Only the first arm owns the queue; later arms just swap the handler.
        if let Some(mut inbound) = self.inbound_rx.lock().take() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        delivered = inbound.recv() => match delivered {
                            Some(result) => {
                                let handler = shared.handler.lock().clone();
                                if let Some(handler) = handler {
                                    handler(result);
                                }
                            }
                            None => break,
                        },
                        _ = shared.core.closed.notified() => break,
                    }
                }
            });
        }
    }

    async fn transmit(&self, payload: Payload) -> Result<()> {
        if self.status() != ConnectionStatus::Open {
            return Err(Error::NotConnected(self.shared.core.name.clone()));
        }
        self.outbound_tx
            .send(payload)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn disconnect(&self) {
        if self.shared.core.set_closed() {
            self.shared.core.closed.notify_waiters();
            tracing::debug!(connection = %self.shared.core.name, "connection closed");
        }
    }

    fn add_stream(&self, stream: Arc<Stream>) {
        self.shared.core.add_stream(stream);
    }

    fn stream(&self, id: u16) -> Option<Arc<Stream>> {
        self.shared.core.stream(id)
    }
}
