//! TCP accept loop
//!
//! Each accepted connection becomes a [`Session`] handed to the configured
//! handler in its own task. A panicking session task is reported to the
//! error sink and dropped; the accept loop and every other session keep
//! running.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::telemetry::ErrorSink;

/// Run for every accepted connection, device- or control-side.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle_session(&self, session: Arc<Session>);
}

pub struct Server {
    listener: TcpListener,
    handler: Arc<dyn SessionHandler>,
    idle_timeout: Duration,
    error_sink: Arc<dyn ErrorSink>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn SessionHandler>,
        idle_timeout: Duration,
        error_sink: Arc<dyn ErrorSink>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            handler,
            idle_timeout,
            error_sink,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the surrounding task is dropped.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(remote = %addr, "accepted connection");

            let session = Session::new(stream, addr, self.idle_timeout);
            let handler = Arc::clone(&self.handler);
            let task = tokio::spawn(async move { handler.handle_session(session).await });

            let sink = Arc::clone(&self.error_sink);
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        sink.notify(
                            "mqtt-session",
                            &format!("session task panicked: {e}"),
                            &[("remote_addr", addr.to_string())],
                        );
                    }
                }
            });
        }
    }
}
