//! TCP client: dials a peer and exposes its sender adaptor.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::info;

use crate::adaptor::SenderAdaptor;
use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::network::connection::ConnectionHandle;
use crate::network::factory::ProtocolFactory;

/// Opens outgoing connections for a requester factory.
#[derive(Debug)]
pub struct TcpClient<C: Codec> {
    factory: Arc<ProtocolFactory<C>>,
}

impl<C: Codec> Clone for TcpClient<C> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
        }
    }
}

impl<C: Codec> TcpClient<C> {
    /// `factory` must have been built with [`ProtocolFactory::sender`].
    pub fn new(factory: ProtocolFactory<C>) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    pub fn factory(&self) -> &Arc<ProtocolFactory<C>> {
        &self.factory
    }

    pub async fn connect(&self, addr: &str, timeout: Duration) -> Result<ClientConnection<C>> {
        self.factory.start().await?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let own = stream.local_addr()?;

        let (handle, adaptor) = self.factory.spawn_connection(stream, peer, own)?;
        let Some(sender) = adaptor.as_sender().cloned() else {
            handle.close().await;
            return Err(WireError::Other(format!(
                "protocol {} has no requester",
                self.factory.name()
            )));
        };
        info!(peer = %peer, "connected");
        Ok(ClientConnection { handle, sender })
    }

    /// Close every open connection, then the factory.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.factory.registry().close_all(self.factory.id()).await;
        self.factory.close(timeout).await
    }
}

/// One dialled connection.
#[derive(Debug)]
pub struct ClientConnection<C: Codec> {
    handle: Arc<ConnectionHandle>,
    sender: SenderAdaptor<C>,
}

impl<C: Codec> ClientConnection<C> {
    pub fn sender(&self) -> &SenderAdaptor<C> {
        &self.sender
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.handle.status().is_stopping_or_stopped()
    }

    /// Close the connection; pending calls fail with
    /// [`WireError::ConnectionClosed`].
    pub async fn close(&self) {
        self.handle.close().await;
    }
}
