//! Common test helpers for khala tests
//!
//! This crate provides:
//! - A recording subscriber for bus-level assertions ([`Recorder`])
//! - A barebones MQTT 3.1.1 client speaking straight to a TCP listener
//!   ([`TestClient`])
//!
//! It is a test-only crate: production crates must not depend on it outside
//! `dev-dependencies`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use khala_core::codec;
use khala_core::packet::{
    ConnectPacket, Packet, PublishPacket, SubscribePacket, UnsubscribePacket,
};
use khala_core::Payload;

use khala_broker::{Broker, HandlerError, MessageHandler};

/// Subscriber that records every delivery it receives.
#[derive(Default)]
pub struct Recorder {
    records: Mutex<Vec<(String, Payload)>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn get(&self, i: usize) -> Option<(String, Payload)> {
        self.records.lock().get(i).cloned()
    }

    pub fn first(&self) -> Option<(String, Payload)> {
        self.get(0)
    }

    pub fn last(&self) -> Option<(String, Payload)> {
        let records = self.records.lock();
        records.last().cloned()
    }

    /// Poll until at least `n` deliveries arrived or the deadline passes.
    pub async fn wait_for(&self, n: usize, deadline: Duration) -> bool {
        let poll = async {
            while self.count() < n {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(deadline, poll).await.is_ok()
    }
}

impl MessageHandler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn handle_message(&self, topic: &str, payload: Payload) -> Result<(), HandlerError> {
        self.records.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

/// Register a fresh recorder under the given patterns.
pub fn record(broker: &Broker, patterns: &[&str]) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder::new());
    let handler = broker.register_handler(recorder.clone() as Arc<dyn MessageHandler>);
    for pattern in patterns {
        broker.subscribe(pattern, handler.clone());
    }
    recorder
}

/// Per-read deadline of the test client
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Barebones MQTT 3.1.1 client speaking straight to a TCP listener.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    next_message_id: u16,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            next_message_id: 1,
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        let bytes = codec::encode(packet)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.stream.write_all(&bytes).await
    }

    /// Read the next packet, bounded by [`CLIENT_READ_TIMEOUT`].
    pub async fn recv(&mut self) -> io::Result<Packet> {
        loop {
            if let Some(packet) = codec::decode(&mut self.buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            {
                return Ok(packet);
            }

            let read = timeout(CLIENT_READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no packet within deadline"))??;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// CONNECT as a device: client identifier is the device name, username
    /// carries the formation id and address as JSON.
    pub async fn send_device_connect(
        &mut self,
        formation_id: &str,
        device_name: &str,
        ip_address: &str,
    ) -> io::Result<()> {
        self.send(&Packet::Connect(ConnectPacket {
            client_id: device_name.to_string(),
            clean_session: true,
            keep_alive: 30,
            will: None,
            username: Some(format!(
                r#"{{"formation_id": "{formation_id}", "ip_address": "{ip_address}"}}"#
            )),
            password: None,
        }))
        .await
    }

    /// CONNECT as a control client (no username contract).
    pub async fn send_control_connect(&mut self, client_id: &str) -> io::Result<()> {
        self.send(&Packet::Connect(ConnectPacket {
            client_id: client_id.to_string(),
            clean_session: true,
            keep_alive: 30,
            ..ConnectPacket::default()
        }))
        .await
    }

    pub async fn subscribe(&mut self, filters: &[&str]) -> io::Result<u16> {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.send(&Packet::Subscribe(SubscribePacket {
            message_id,
            topics: filters.iter().map(|f| (f.to_string(), 0)).collect(),
        }))
        .await?;
        Ok(message_id)
    }

    pub async fn unsubscribe(&mut self, filters: &[&str]) -> io::Result<u16> {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.send(&Packet::Unsubscribe(UnsubscribePacket {
            message_id,
            topics: filters.iter().map(|f| f.to_string()).collect(),
        }))
        .await?;
        Ok(message_id)
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> io::Result<()> {
        self.send(&Packet::Publish(PublishPacket::new(topic, payload.to_vec())))
            .await
    }

    pub async fn disconnect(&mut self) -> io::Result<()> {
        self.send(&Packet::Disconnect).await
    }

    /// Drop the connection without a DISCONNECT packet.
    pub fn abort(self) {
        drop(self.stream);
    }
}
