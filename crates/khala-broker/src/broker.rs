//! Publish/subscribe core
//!
//! The registry is a flat list of `(pattern, subscriber)` pairs scanned per
//! publish; at fleet scale that beats maintaining a trie. `publish` snapshots
//! the matching set under the read lock, releases it, then dispatches:
//! handler subscribers get the payload enqueued on their worker (FIFO per
//! subscriber), network subscribers get a QoS-0 PUBLISH on their outgoing
//! queue. Every delivery is best-effort; a failing subscriber never affects
//! the rest, and publishers never observe delivery errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use khala_core::events::{subscribe_event_topic, SubscribeEvent};
use khala_core::packet::{
    PublishPacket, SubackPacket, SubscribePacket, UnsubscribePacket, SUBACK_FAILURE,
    SUBACK_GRANTED_QOS0,
};
use khala_core::{topic, Packet, Payload};

use crate::server::SessionHandler;
use crate::session::{Session, SessionError};
use crate::subscription::{Delivery, HandlerRef, Subscriber, SubscriberId, Subscription};
use crate::telemetry;

/// Queue depth of a registered handler's worker
pub const HANDLER_QUEUE_SIZE: usize = 1024;

/// Errors a handler may surface; the broker logs and discards them.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An in-process subscriber. Invocations for one registration are
/// serialized; the body is expected to be non-blocking (CPU, state-map
/// updates, further publishes).
pub trait MessageHandler: Send + Sync + 'static {
    /// Short tag used in logs.
    fn name(&self) -> &'static str;

    fn handle_message(&self, topic: &str, payload: Payload) -> Result<(), HandlerError>;
}

pub struct Broker {
    subscriptions: RwLock<Vec<Subscription>>,
    slash_prefix_topics: bool,
    next_handler_id: AtomicU64,
}

impl Broker {
    /// `slash_prefix_topics` accepts legacy `/pylon/...` names by stripping
    /// one leading slash from every incoming topic and filter.
    pub fn new(slash_prefix_topics: bool) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            slash_prefix_topics,
            next_handler_id: AtomicU64::new(1),
        }
    }

    fn normalize<'a>(&self, topic: &'a str) -> &'a str {
        if self.slash_prefix_topics {
            topic.strip_prefix('/').unwrap_or(topic)
        } else {
            topic
        }
    }

    /// Wrap a handler in a worker queue so it can be subscribed. One worker
    /// drains the queue, preserving delivery order per registration.
    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerRef {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let name = handler.name();
        let (tx, mut rx) = mpsc::channel::<Delivery>(HANDLER_QUEUE_SIZE);

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if let Err(e) = handler.handle_message(&delivery.topic, delivery.payload) {
                    warn!(handler = name, topic = %delivery.topic, error = %e, "handler failed");
                }
            }
        });

        HandlerRef { id, name, tx }
    }

    /// Register a subscription. Duplicate `(pattern, subscriber)` pairs are
    /// a no-op.
    pub fn subscribe(&self, pattern: &str, subscriber: impl Into<Subscriber>) {
        let pattern = self.normalize(pattern).to_string();
        let subscriber = subscriber.into();
        let id = subscriber.id();

        let mut subs = self.subscriptions.write();
        if subs
            .iter()
            .any(|s| s.pattern == pattern && s.subscriber.id() == id)
        {
            return;
        }
        trace!(pattern = %pattern, subscriber = ?id, "subscribe");
        subs.push(Subscription {
            pattern,
            subscriber,
        });
    }

    /// Drop one `(pattern, subscriber)` registration.
    pub fn unsubscribe(&self, pattern: &str, subscriber: &Subscriber) {
        let pattern = self.normalize(pattern);
        let id = subscriber.id();
        self.subscriptions
            .write()
            .retain(|s| !(s.pattern == pattern && s.subscriber.id() == id));
    }

    /// Drop every registration held by a subscriber.
    pub fn remove(&self, id: &SubscriberId) {
        self.subscriptions.write().retain(|s| s.subscriber.id() != *id);
    }

    /// Drop every registration held by a session. Used on disconnect.
    pub fn remove_session(&self, session: &Session) {
        self.remove(&SubscriberId::Session(session.id()));
    }

    /// Number of live registrations.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Fan a payload out to every matching subscriber, at most once each.
    pub fn publish(&self, topic_name: &str, payload: impl Into<Payload>) {
        let payload = payload.into();
        let topic_name = self.normalize(topic_name);

        let matching: Vec<Subscription> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| topic::topics_match(&s.pattern, topic_name))
                .cloned()
                .collect()
        };
        if matching.is_empty() {
            trace!(topic = topic_name, "no subscribers");
            return;
        }

        let internal = topic::is_internal(topic_name);
        for sub in matching {
            match &sub.subscriber {
                Subscriber::Handler(h) => {
                    let delivery = Delivery {
                        topic: topic_name.to_string(),
                        payload: payload.clone(),
                    };
                    match h.tx.try_send(delivery) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(handler = h.name, topic = topic_name, "handler queue full, dropping delivery");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            warn!(handler = h.name, topic = topic_name, "handler worker gone, dropping delivery");
                        }
                    }
                }
                Subscriber::Session(session) => {
                    // Internal topics never cross the network.
                    if internal {
                        continue;
                    }
                    let bytes = match payload.to_wire() {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(topic = topic_name, error = %e, "cannot encode payload for network delivery");
                            continue;
                        }
                    };
                    telemetry::count_egress(topic_name);
                    if let Err(e) =
                        session.try_write(Packet::Publish(PublishPacket::new(topic_name, bytes)))
                    {
                        debug!(session = %session.id(), topic = topic_name, error = %e, "dropping delivery");
                    }
                }
            }
        }
    }

    /// Process a SUBSCRIBE from a network session: register each valid
    /// filter, SUBACK with per-filter return codes, and optionally emit the
    /// replay trigger carrying the granted filters.
    pub async fn handle_subscribe_packet(
        &self,
        packet: SubscribePacket,
        session: &Arc<Session>,
        replay: bool,
    ) -> Result<(), SessionError> {
        let mut return_codes = Vec::with_capacity(packet.topics.len());
        let mut granted = Vec::new();

        for (filter, _max_qos) in packet.topics {
            let filter = self.normalize(&filter).to_string();
            if topic::is_valid_filter(&filter) {
                self.subscribe(&filter, Subscriber::Session(Arc::clone(session)));
                return_codes.push(SUBACK_GRANTED_QOS0);
                granted.push(filter);
            } else {
                warn!(session = %session.id(), filter = %filter, "rejecting invalid topic filter");
                return_codes.push(SUBACK_FAILURE);
            }
        }

        session
            .write(Packet::Suback(SubackPacket {
                message_id: packet.message_id,
                return_codes,
            }))
            .await?;

        if replay && !granted.is_empty() {
            self.publish(
                &subscribe_event_topic().to_string(),
                Payload::Subscribe(SubscribeEvent { topics: granted }),
            );
        }
        Ok(())
    }

    /// Drop the session's registrations for the filters listed in an
    /// UNSUBSCRIBE packet. The caller sends the UNSUBACK.
    pub fn handle_unsubscribe_packet(&self, packet: &UnsubscribePacket, session: &Arc<Session>) {
        let subscriber = Subscriber::Session(Arc::clone(session));
        for filter in &packet.topics {
            self.unsubscribe(filter, &subscriber);
        }
    }

    /// Control-side session loop: CONNECT handshake (no username contract),
    /// then serve SUBSCRIBE/UNSUBSCRIBE/PUBLISH/PINGREQ until DISCONNECT or
    /// a read error. Control publishes pass through onto the bus.
    pub async fn handle_connection(&self, session: Arc<Session>) {
        match session.read_connect().await {
            Ok(_) => {}
            Err(e) => {
                if !e.is_disconnect() {
                    debug!(remote = %session.remote_addr(), error = %e, "control handshake failed");
                }
                session.close();
                return;
            }
        }
        if let Err(e) = session.acknowledge_connect().await {
            debug!(remote = %session.remote_addr(), error = %e, "could not acknowledge connect");
            session.close();
            return;
        }

        telemetry::add_control_client();
        loop {
            match session.read_packet().await {
                Ok(Packet::Pingreq) => {
                    if session.send_pingresp().await.is_err() {
                        break;
                    }
                }
                Ok(Packet::Publish(p)) => {
                    telemetry::count_ingress(&p.topic_name);
                    self.publish(&p.topic_name, p.payload);
                }
                Ok(Packet::Subscribe(p)) => {
                    if let Err(e) = self.handle_subscribe_packet(p, &session, true).await {
                        debug!(session = %session.id(), error = %e, "subscribe handling failed");
                        break;
                    }
                }
                Ok(Packet::Unsubscribe(p)) => {
                    self.handle_unsubscribe_packet(&p, &session);
                    if session.send_unsuback(p.message_id).await.is_err() {
                        break;
                    }
                }
                Ok(Packet::Disconnect) => break,
                Ok(other) => {
                    debug!(session = %session.id(), packet = other.name(), "ignoring unsupported packet");
                }
                Err(e) => {
                    if !e.is_disconnect() {
                        debug!(session = %session.id(), error = %e, "read failed");
                    }
                    break;
                }
            }
        }

        self.remove_session(&session);
        session.close();
        telemetry::remove_control_client();
    }
}

#[async_trait]
impl SessionHandler for Broker {
    async fn handle_session(&self, session: Arc<Session>) {
        self.handle_connection(session).await;
    }
}
