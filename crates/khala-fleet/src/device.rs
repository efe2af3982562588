//! Device session state machine
//!
//! One session per connected device. The first packet must be CONNECT with
//! the formation id asserted as JSON in the username; after a successful
//! handshake the loop routes telemetry onto the bus until the session ends,
//! then emits exactly one disconnect event.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use khala_broker::telemetry;
use khala_broker::{Broker, Session, SessionError, SessionHandler};
use khala_core::events::{connect_topic, disconnect_topic, ConnectEvent, DisconnectEvent};
use khala_core::packet::ConnectReturnCode;
use khala_core::{Packet, Payload};

use crate::formations::FormationMap;
use crate::liberator::{DeviceInfoFetcher, FetchError};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("CONNECT username is not a valid formation assertion: {0}")]
    Username(serde_json::Error),

    #[error("CONNECT from {device} is missing the formation id")]
    MissingFormationId { device: String },

    #[error("device info lookup for {device} failed: {source}")]
    DeviceInfo { device: String, source: FetchError },
}

impl ConnectError {
    fn is_disconnect(&self) -> bool {
        matches!(self, ConnectError::Session(e) if e.is_disconnect())
    }
}

/// Handles the device-facing listener's sessions.
pub struct DeviceHandler {
    formations: Arc<FormationMap>,
    broker: Arc<Broker>,
    device_info: Arc<dyn DeviceInfoFetcher>,
}

impl DeviceHandler {
    pub fn new(
        formations: Arc<FormationMap>,
        broker: Arc<Broker>,
        device_info: Arc<dyn DeviceInfoFetcher>,
    ) -> Self {
        Self {
            formations,
            broker,
            device_info,
        }
    }

    pub async fn handle_connection(&self, session: Arc<Session>) {
        let event = match self.connect(&session).await {
            Ok(event) => event,
            Err(e) => {
                if !e.is_disconnect() {
                    warn!(remote = %session.remote_addr(), error = %e, "could not establish device session");
                }
                session.close();
                return;
            }
        };

        telemetry::add_device_client();
        info!(device = %event.device_name, formation = %event.formation_id, "device connected");

        loop {
            match session.read_packet().await {
                Ok(Packet::Pingreq) => {
                    if session.send_pingresp().await.is_err() {
                        break;
                    }
                }
                Ok(Packet::Publish(p)) => {
                    telemetry::count_ingress(&p.topic_name);
                    self.broker.publish(&p.topic_name, p.payload);
                }
                Ok(Packet::Subscribe(p)) => {
                    if let Err(e) = self.broker.handle_subscribe_packet(p, &session, false).await {
                        warn!(device = %event.device_name, error = %e, "subscribe handling failed");
                        break;
                    }
                }
                Ok(Packet::Unsubscribe(p)) => {
                    self.broker.handle_unsubscribe_packet(&p, &session);
                    if session.send_unsuback(p.message_id).await.is_err() {
                        break;
                    }
                }
                Ok(Packet::Disconnect) => break,
                Ok(other) => {
                    debug!(device = %event.device_name, packet = other.name(), "ignoring unsupported packet");
                }
                Err(e) => {
                    if !e.is_disconnect() {
                        warn!(device = %event.device_name, error = %e, "read failed, closing session");
                    }
                    break;
                }
            }
        }

        self.device_disconnected(&event, &session);
        telemetry::remove_device_client();
    }

    async fn connect(&self, session: &Arc<Session>) -> Result<ConnectEvent, ConnectError> {
        let packet = session.read_connect().await?;

        let username = packet.username.as_deref().unwrap_or_default();
        let mut event: ConnectEvent = match serde_json::from_str(username) {
            Ok(event) => event,
            Err(e) => {
                let _ = session
                    .reject_connect(ConnectReturnCode::NotAuthorized)
                    .await;
                return Err(ConnectError::Username(e));
            }
        };
        event.device_name = packet.client_id;

        if event.formation_id.is_empty() {
            let _ = session
                .reject_connect(ConnectReturnCode::NotAuthorized)
                .await;
            return Err(ConnectError::MissingFormationId {
                device: event.device_name,
            });
        }

        let segment = telemetry::device_info_segment(&event.device_name);
        let fetched = self.device_info.fetch(&event.device_name).await;
        segment.end();
        event.device_info = fetched.map_err(|source| ConnectError::DeviceInfo {
            device: event.device_name.clone(),
            source,
        })?;

        self.formations
            .add_device(&event.device_name, &event.formation_id);
        session.acknowledge_connect().await?;

        self.broker
            .publish(&connect_topic().to_string(), Payload::Connect(event.clone()));
        Ok(event)
    }

    fn device_disconnected(&self, event: &ConnectEvent, session: &Arc<Session>) {
        self.broker.remove_session(session);
        session.close();

        debug!(device = %event.device_name, "device disconnected");
        self.broker.publish(
            &disconnect_topic().to_string(),
            Payload::Disconnect(DisconnectEvent {
                formation_id: event.formation_id.clone(),
                device_name: event.device_name.clone(),
            }),
        );
    }
}

#[async_trait]
impl SessionHandler for DeviceHandler {
    async fn handle_session(&self, session: Arc<Session>) {
        self.handle_connection(session).await;
    }
}
