//! TCP listener driving one [`ProtocolFactory`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::network::factory::ProtocolFactory;
use crate::status::{Status, StatusWaiter};

/// Accepts TCP connections and hands them to a factory.
#[derive(Debug)]
pub struct TcpServer<C: Codec> {
    factory: Arc<ProtocolFactory<C>>,
    host: String,
    port: u16,
    status: StatusWaiter,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<C: Codec> TcpServer<C> {
    pub fn new(factory: ProtocolFactory<C>, host: impl Into<String>, port: u16) -> Self {
        Self {
            factory: Arc::new(factory),
            host: host.into(),
            port,
            status: StatusWaiter::new(),
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    pub fn factory(&self) -> &Arc<ProtocolFactory<C>> {
        &self.factory
    }

    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the server is listening, or failed to.
    pub async fn wait_started(&self) -> Option<SocketAddr> {
        self.status.wait_has_started().await;
        self.local_addr()
    }

    /// Bind and accept until [`close`](Self::close) is called.
    ///
    /// A server runs at most once.
    pub async fn serve(&self) -> Result<()> {
        if self.status.get() != Status::Init {
            return Err(WireError::ServerAlreadyStarted);
        }
        self.status.set_starting();

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!(host = %self.host, port = self.port, "failed to start server: {e}");
                self.status.set_stopped();
                return Err(e);
            }
        };
        // Closed while binding: the server never reaches `Started`.
        if self.shutdown.is_cancelled() || self.status.is_stopping_or_stopped() {
            info!(host = %self.host, port = self.port, "closed before listening");
            return Ok(());
        }
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        self.status.set_started();
        info!(protocol = %self.factory.name(), addr = %addr, "serving");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, "set_nodelay failed: {e}");
                        }
                        if let Err(e) = self.factory.spawn_connection(stream, peer, addr) {
                            warn!(peer = %peer, "connection rejected: {e}");
                        }
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        info!(addr = %addr, "stopped accepting");
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener> {
        self.factory.start().await?;
        Ok(TcpListener::bind((self.host.as_str(), self.port)).await?)
    }

    /// Stop accepting, close every connection, then close the factory.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if !self.status.is_starting_or_started() {
            return Err(WireError::ServerNotStarted);
        }
        self.status.set_stopping();
        self.shutdown.cancel();

        let connections = self.factory.registry().close_all(self.factory.id());
        if tokio::time::timeout(timeout, connections).await.is_err() {
            warn!("connections not closed within {timeout:?}");
        }
        let result = self.factory.close(timeout).await;
        self.status.set_stopped();
        info!(protocol = %self.factory.name(), "server closed");
        result
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::action::EchoAction;
    use crate::codec::JsonCodec;
    use crate::network::factory::FactoryConfig;
    use crate::network::registry::ConnectionRegistry;

    fn server(host: &str) -> Arc<TcpServer<JsonCodec>> {
        let factory = ProtocolFactory::receiver(
            FactoryConfig::default(),
            Arc::new(EchoAction::<Value>::new()),
            ConnectionRegistry::new(),
        );
        Arc::new(TcpServer::new(factory, host, 0))
    }

    #[tokio::test]
    async fn close_during_bind_stays_stopped() {
        // Name resolution suspends `bind`, leaving the server in `Starting`.
        let server = server("localhost");
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });
        while server.status().get() == Status::Init {
            tokio::task::yield_now().await;
        }

        let was_starting = server.status().get() == Status::Starting;
        let closed = server.close(Duration::from_secs(1)).await;
        if was_starting {
            closed.unwrap();
            assert_eq!(server.status().get(), Status::Stopped);
        }

        // `serve` may fail to bind on hosts without IPv6; either way it
        // must not move the server back to `Started`.
        let _ = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.status().get(), Status::Stopped);
        assert!(matches!(server.serve().await, Err(WireError::ServerAlreadyStarted)));
    }

    #[tokio::test]
    async fn close_before_serve_is_rejected() {
        let server = server("127.0.0.1");
        assert!(matches!(
            server.close(Duration::from_secs(1)).await,
            Err(WireError::ServerNotStarted)
        ));
    }
}
