//! Framed MQTT session endpoint
//!
//! A session owns one TCP connection. The read side accumulates socket
//! reads into a buffer and hands out whole packets, with every read bounded
//! by the idle deadline. The write side is a bounded queue drained by a
//! single writer task, which both serializes writes and gives fan-out a
//! non-blocking drop-newest path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use khala_core::codec;
use khala_core::packet::{ConnackPacket, ConnectPacket, ConnectReturnCode, Packet};

/// Outgoing queue depth per session
pub const OUTGOING_QUEUE_SIZE: usize = 1000;

/// Session I/O errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer closed the connection (or the session was closed locally)
    #[error("connection closed")]
    Closed,

    /// No bytes arrived within the idle deadline
    #[error("idle timeout expired")]
    IdleTimeout,

    /// Wire-level framing or protocol violation
    #[error(transparent)]
    Codec(#[from] khala_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Fan-out delivery dropped: the outgoing queue is full
    #[error("outgoing queue full")]
    QueueFull,

    #[error("expected {expected}, got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
}

impl SessionError {
    /// Whether this error is an ordinary end of session rather than a
    /// protocol problem worth logging. Idle timeouts count as peer close.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::Closed | SessionError::IdleTimeout)
    }
}

enum Outbound {
    Packet(Packet),
    Shutdown,
}

struct PacketReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

/// One connected peer, device- or control-side.
pub struct Session {
    id: Uuid,
    remote_addr: SocketAddr,
    idle_timeout: Duration,
    reader: Mutex<PacketReader>,
    outgoing: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Session {
    /// Wrap an accepted connection. Spawns the writer task.
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, idle_timeout: Duration) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (outgoing, rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            remote_addr,
            idle_timeout,
            reader: Mutex::new(PacketReader {
                half: read_half,
                buf: BytesMut::with_capacity(4096),
            }),
            outgoing,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        tokio::spawn(write_loop(write_half, rx, session.id));
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliveries dropped on the fan-out path since the session started.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Read the next whole packet. The idle deadline is re-armed before
    /// every socket read; expiry surfaces as [`SessionError::IdleTimeout`].
    pub async fn read_packet(&self) -> Result<Packet, SessionError> {
        let mut reader = self.reader.lock().await;
        let reader = &mut *reader;
        loop {
            if let Some(packet) = codec::decode(&mut reader.buf)? {
                trace!(session = %self.id, packet = packet.name(), "read packet");
                return Ok(packet);
            }

            let read = timeout(self.idle_timeout, reader.half.read_buf(&mut reader.buf))
                .await
                .map_err(|_| SessionError::IdleTimeout)??;
            if read == 0 {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Read one packet and require it to be CONNECT.
    pub async fn read_connect(&self) -> Result<ConnectPacket, SessionError> {
        match self.read_packet().await? {
            Packet::Connect(p) => Ok(p),
            other => Err(SessionError::UnexpectedPacket {
                expected: "CONNECT",
                got: other.name(),
            }),
        }
    }

    /// Queue a packet, waiting for queue space. Used for protocol replies.
    pub async fn write(&self, packet: Packet) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outgoing
            .send(Outbound::Packet(packet))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue a packet without blocking. Used by publish fan-out; a full
    /// queue drops the delivery (at-most-once).
    pub fn try_write(&self, packet: Packet) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outgoing
            .try_send(Outbound::Packet(packet))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    SessionError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
            })
    }

    pub async fn send_pingresp(&self) -> Result<(), SessionError> {
        self.write(Packet::Pingresp).await
    }

    pub async fn send_unsuback(&self, message_id: u16) -> Result<(), SessionError> {
        self.write(Packet::Unsuback { message_id }).await
    }

    /// CONNACK with return code 0x00.
    pub async fn acknowledge_connect(&self) -> Result<(), SessionError> {
        self.write(Packet::Connack(ConnackPacket {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await
    }

    /// CONNACK with a refusal code. The caller closes the session afterwards.
    pub async fn reject_connect(&self, return_code: ConnectReturnCode) -> Result<(), SessionError> {
        self.write(Packet::Connack(ConnackPacket {
            session_present: false,
            return_code,
        }))
        .await
    }

    /// Mark the session closed and shut the writer down. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session = %self.id, remote = %self.remote_addr, "closing session");
        let _ = self.outgoing.try_send(Outbound::Shutdown);
    }
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Outbound>, id: Uuid) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Packet(packet) => match codec::encode(&packet) {
                Ok(bytes) => {
                    if let Err(e) = half.write_all(&bytes).await {
                        debug!(session = %id, error = %e, "write failed");
                        break;
                    }
                }
                Err(e) => warn!(session = %id, error = %e, "dropping unencodable packet"),
            },
            Outbound::Shutdown => break,
        }
    }
    let _ = half.shutdown().await;
}
