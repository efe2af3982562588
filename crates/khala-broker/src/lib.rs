//! khala broker
//!
//! The in-process bus and its network face:
//! - [`Session`]: framed MQTT packet I/O with idle deadlines and a
//!   serialized write path
//! - [`Broker`]: subscription registry, QoS-0 publish fan-out, SUBSCRIBE
//!   handling with subscribe-replay, control-side connection loop
//! - [`Server`]: TCP accept loop handing each connection to a
//!   [`SessionHandler`]
//! - [`telemetry`]: process-local counters and the [`ErrorSink`] seam

pub mod broker;
pub mod server;
pub mod session;
pub mod subscription;
pub mod telemetry;

pub use broker::{Broker, HandlerError, MessageHandler};
pub use server::{Server, SessionHandler};
pub use session::{Session, SessionError};
pub use subscription::{HandlerRef, Subscriber, SubscriberId, Subscription};
pub use telemetry::{ErrorSink, LogErrorSink};
