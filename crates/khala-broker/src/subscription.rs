//! Subscription table entries
//!
//! A subscriber is either a network session or the queue of a registered
//! in-process handler. Identity (for idempotent subscribe and removal) is
//! the session id or the handler registration id.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use khala_core::Payload;

use crate::session::Session;

/// One queued handler invocation
pub(crate) struct Delivery {
    pub topic: String,
    pub payload: Payload,
}

/// Handle to a registered handler's worker queue. Cloning shares the queue.
#[derive(Clone)]
pub struct HandlerRef {
    pub(crate) id: u64,
    pub(crate) name: &'static str,
    pub(crate) tx: mpsc::Sender<Delivery>,
}

impl HandlerRef {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A party receiving deliveries from the broker
#[derive(Clone)]
pub enum Subscriber {
    Session(Arc<Session>),
    Handler(HandlerRef),
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        match self {
            Subscriber::Session(s) => SubscriberId::Session(s.id()),
            Subscriber::Handler(h) => SubscriberId::Handler(h.id),
        }
    }
}

impl From<Arc<Session>> for Subscriber {
    fn from(session: Arc<Session>) -> Self {
        Subscriber::Session(session)
    }
}

impl From<HandlerRef> for Subscriber {
    fn from(handler: HandlerRef) -> Self {
        Subscriber::Handler(handler)
    }
}

/// Stable identity of a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriberId {
    Session(Uuid),
    Handler(u64),
}

/// A `(pattern, subscriber)` registration
#[derive(Clone)]
pub struct Subscription {
    pub pattern: String,
    pub subscriber: Subscriber,
}
