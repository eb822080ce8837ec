//! TCP payload transport
//!
//! Carries payloads over a TCP byte stream with a fixed-size frame header:
//!
//! ```text
//! 0              2                      10             14
//! +--------------+----------------------+--------------+------------------+
//! | stream id    | sequence             | length       | payload bytes    |
//! | u16 (BE)     | u64 (BE)             | u32 (BE)     | `length` bytes   |
//! +--------------+----------------------+--------------+------------------+
//! ```
//!
//! Client mode dials the configured peer; Server mode binds and accepts a
//! single peer per open. `TCP_NODELAY` is set on the accepted/dialed socket.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::options::ChannelOptions;
use crate::payload::Payload;
use crate::stream::Stream;

use super::{
    Connection, ConnectionCore, ConnectionCounters, ConnectionDirection, ConnectionKind,
    ConnectionMode, ConnectionStatus, ReceiveHandler,
};

/// Frame header: stream id (2) + sequence (8) + length (4)
pub(crate) const WIRE_HEADER_LEN: usize = 14;

/// Upper bound on a single payload; larger lengths are treated as corruption
const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Encode one payload into a wire frame
pub(crate) fn encode_frame(payload: &Payload) -> Bytes {
    let mut buf = BytesMut::with_capacity(WIRE_HEADER_LEN + payload.size());
    buf.put_u16(payload.stream_identifier);
    buf.put_u64(payload.sequence);
    buf.put_u32(payload.size() as u32);
    buf.put_slice(&payload.data);
    buf.freeze()
}

/// Read one framed payload off the stream
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Payload> {
    let mut header = [0u8; WIRE_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let mut fields = &header[..];
    let stream_identifier = fields.get_u16();
    let sequence = fields.get_u64();
    let length = fields.get_u32() as usize;

    if length > MAX_PAYLOAD_SIZE {
        return Err(Error::MalformedFrame(format!(
            "payload length {} exceeds {} byte limit",
            length, MAX_PAYLOAD_SIZE
        )));
    }

    let mut data = vec![0u8; length];
    reader.read_exact(&mut data).await?;

    Ok(Payload::new(stream_identifier, sequence, Bytes::from(data)))
}

struct TcpIo {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

/// TCP connection endpoint
pub struct TcpConnection {
    core: Arc<ConnectionCore>,
    io: Arc<TcpIo>,
    tx_timeout: Option<Duration>,
    inline_handlers: bool,
}

impl TcpConnection {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        mode: ConnectionMode,
        direction: ConnectionDirection,
        options: &ChannelOptions,
    ) -> Self {
        Self {
            core: Arc::new(ConnectionCore::new(name, host, port, mode, direction)),
            io: Arc::new(TcpIo {
                reader: Mutex::new(None),
                writer: Mutex::new(None),
            }),
            tx_timeout: options.tx_timeout(),
            inline_handlers: options.inline_handlers,
        }
    }

    async fn establish(&self) -> Result<TcpStream> {
        let host = self.core.host.as_str();
        let port = self.core.port;

        let stream = match self.core.mode {
            ConnectionMode::Client => TcpStream::connect((host, port)).await?,
            ConnectionMode::Server => {
                let listener = TcpListener::bind((host, port)).await?;
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(
                    connection = %self.core.name,
                    peer = %peer,
                    "accepted peer"
                );
                stream
            }
        };

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Receive exactly one payload, resolving early if the connection is closed
async fn receive_one(core: &ConnectionCore, io: &TcpIo) -> Result<Payload> {
    let mut guard = io.reader.lock().await;
    let reader = guard
        .as_mut()
        .ok_or_else(|| Error::NotConnected(core.name.clone()))?;

    tokio::select! {
        result = read_frame(reader) => result.map_err(|e| {
            core.fault();
            e
        }),
        _ = core.closed.notified() => Err(Error::ConnectionClosed),
    }
}

#[async_trait]
impl Connection for TcpConnection {
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
        ConnectionKind::Tcp
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
        match self.establish().await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                *self.io.reader.lock().await = Some(reader);
                *self.io.writer.lock().await = Some(writer);
                self.core.set_status(ConnectionStatus::Open);
                Ok(())
            }
            Err(e) => {
                self.core.set_status(ConnectionStatus::Closed);
                Err(e)
            }
        }
    }

    fn async_receive(&self, handler: ReceiveHandler) {
        let core = Arc::clone(&self.core);
        let io = Arc::clone(&self.io);
        let inline = self.inline_handlers;

        tokio::spawn(async move {
            let result = receive_one(&core, &io).await;
            if inline {
                handler(result);
            } else {
                tokio::spawn(async move { handler(result) });
            }
        });
    }

    async fn transmit(&self, payload: Payload) -> Result<()> {
        let mut guard = self.io.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.core.name.clone()))?;

        let frame = encode_frame(&payload);
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
        };

        let result = match self.tx_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result.map_err(Error::Io),
                Err(_) => Err(Error::TransmitTimeout(limit)),
            },
            None => write.await.map_err(Error::Io),
        };

        if result.is_err() {
            self.core.fault();
        }
        result
    }

    fn disconnect(&self) {
        if self.core.set_closed() {
            self.core.closed.notify_waiters();
            if let Ok(mut reader) = self.io.reader.try_lock() {
                *reader = None;
            }
            if let Ok(mut writer) = self.io.writer.try_lock() {
                *writer = None;
            }
            tracing::debug!(connection = %self.core.name, "connection closed");
        }
    }

    fn add_stream(&self, stream: Arc<Stream>) {
        self.core.add_stream(stream);
    }

    fn stream(&self, id: u16) -> Option<Arc<Stream>> {
        self.core.stream(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ChannelOptions {
        ChannelOptions::default()
    }

    #[test]
    fn test_frame_codec_fields() {
        let payload = Payload::new(300, 77, Bytes::from_static(b"media"));
        let frame = encode_frame(&payload);

        assert_eq!(frame.len(), WIRE_HEADER_LEN + 5);

        let mut fields = &frame[..];
        assert_eq!(fields.get_u16(), 300);
        assert_eq!(fields.get_u64(), 77);
        assert_eq!(fields.get_u32(), 5);
        assert_eq!(fields, b"media");
    }

    #[tokio::test]
    async fn test_client_transmit_then_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = TcpConnection::new(
            "tx0",
            "127.0.0.1",
            addr.port(),
            ConnectionMode::Client,
            ConnectionDirection::Out,
            &options(),
        );
        assert!(conn.begin_open());

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        conn.open().await.unwrap();
        let mut peer = accept.await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Open);

        // Transmit one payload and verify the wire frame on the peer side
        conn.transmit(Payload::new(5, 9, Bytes::from_static(b"frame")))
            .await
            .unwrap();

        let mut header = [0u8; WIRE_HEADER_LEN];
        peer.read_exact(&mut header).await.unwrap();
        let mut fields = &header[..];
        assert_eq!(fields.get_u16(), 5);
        assert_eq!(fields.get_u64(), 9);
        assert_eq!(fields.get_u32(), 5);

        let mut body = [0u8; 5];
        peer.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"frame");

        // Peer sends a payload back; the armed receive delivers it
        let pong = encode_frame(&Payload::new(5, 10, Bytes::from_static(b"pong")));
        peer.write_all(&pong).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.async_receive(Arc::new(move |result| {
            let _ = tx.send(result);
        }));

        let delivered = rx.recv().await.unwrap().unwrap();
        assert_eq!(delivered.stream_identifier, 5);
        assert_eq!(delivered.sequence, 10);
        assert_eq!(&delivered.data[..], b"pong");
    }

    #[tokio::test]
    async fn test_receive_after_disconnect_fails() {
        let conn = TcpConnection::new(
            "rx0",
            "127.0.0.1",
            0,
            ConnectionMode::Client,
            ConnectionDirection::In,
            &options(),
        );
        conn.disconnect();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.async_receive(Arc::new(move |result| {
            let _ = tx.send(result);
        }));

        assert!(rx.recv().await.unwrap().is_err());
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }
}
