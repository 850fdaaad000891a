//! Per-protocol connection factory.
//!
//! A [`ProtocolFactory`] turns accepted (or dialled) streams into running
//! connections: it builds the adaptor for the factory's role, registers
//! the connection, and drives it as a tracked task. It also owns the
//! optional inactivity sweep for its connections.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::action::{Action, PreAction};
use crate::adaptor::{Adaptor, ReceiverAdaptor, SenderAdaptor};
use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::message::MessageContext;
use crate::network::connection::{Connection, ConnectionHandle};
use crate::network::registry::ConnectionRegistry;
use crate::requester::{MethodTable, Requester};
use crate::status::StatusWaiter;
use crate::task::{TaskScheduler, TrackedTask};
use crate::transport::ChannelTransport;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

// ── Config ───────────────────────────────────────────────────────

/// Inactivity sweep settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryConfig {
    /// Close connections idle for longer than this.
    pub expire_after: Duration,
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Protocol name, recorded in every message context.
    pub name: String,
    pub expiry: Option<ExpiryConfig>,
    pub close_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            name: "wirehub".to_string(),
            expiry: None,
            close_timeout: Duration::from_secs(10),
            read_buffer_size: 64 * 1024,
        }
    }
}

// ── PeerAdaptor ──────────────────────────────────────────────────

/// The adaptor built for one connection.
pub enum PeerAdaptor<C: Codec> {
    Receiver(ReceiverAdaptor<C>),
    Sender(SenderAdaptor<C>),
}

impl<C: Codec> Clone for PeerAdaptor<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Receiver(a) => Self::Receiver(a.clone()),
            Self::Sender(a) => Self::Sender(a.clone()),
        }
    }
}

impl<C: Codec> std::fmt::Debug for PeerAdaptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Receiver(a) => a.fmt(f),
            Self::Sender(a) => a.fmt(f),
        }
    }
}

impl<C: Codec> PeerAdaptor<C> {
    pub fn as_receiver(&self) -> Option<&ReceiverAdaptor<C>> {
        match self {
            Self::Receiver(a) => Some(a),
            Self::Sender(_) => None,
        }
    }

    pub fn as_sender(&self) -> Option<&SenderAdaptor<C>> {
        match self {
            Self::Sender(a) => Some(a),
            Self::Receiver(_) => None,
        }
    }
}

#[async_trait]
impl<C: Codec> Adaptor for PeerAdaptor<C> {
    fn context(&self) -> Arc<MessageContext> {
        match self {
            Self::Receiver(a) => a.context(),
            Self::Sender(a) => a.context(),
        }
    }

    fn on_data_received(&self, buffer: Bytes, timestamp: DateTime<Local>) -> TrackedTask<()> {
        match self {
            Self::Receiver(a) => a.on_data_received(buffer, timestamp),
            Self::Sender(a) => a.on_data_received(buffer, timestamp),
        }
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        match self {
            Self::Receiver(a) => a.close(timeout).await,
            Self::Sender(a) => a.close(timeout).await,
        }
    }
}

// ── ProtocolFactory ──────────────────────────────────────────────

enum Role<T> {
    Receiver(Arc<dyn Action<T>>),
    Sender(Arc<dyn Requester<T>>),
}

/// Creates and tracks the connections of one protocol.
pub struct ProtocolFactory<C: Codec> {
    id: u64,
    config: FactoryConfig,
    role: Role<C::Item>,
    preaction: Option<Arc<dyn PreAction>>,
    scheduler: TaskScheduler,
    registry: Arc<ConnectionRegistry>,
    status: StatusWaiter,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> std::fmt::Debug for ProtocolFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolFactory")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("status", &self.status.get())
            .finish()
    }
}

impl<C: Codec> ProtocolFactory<C> {
    fn with_role(config: FactoryConfig, role: Role<C::Item>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            config,
            role,
            preaction: None,
            scheduler: TaskScheduler::new(),
            registry,
            status: StatusWaiter::new(),
            _codec: PhantomData,
        }
    }

    /// A factory whose connections hand messages to `action`.
    pub fn receiver(
        config: FactoryConfig,
        action: Arc<dyn Action<C::Item>>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self::with_role(config, Role::Receiver(action), registry)
    }

    /// A factory whose connections make calls declared by `requester`.
    pub fn sender(
        config: FactoryConfig,
        requester: Arc<dyn Requester<C::Item>>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self::with_role(config, Role::Sender(requester), registry)
    }

    pub fn with_preaction(mut self, preaction: Arc<dyn PreAction>) -> Self {
        self.preaction = Some(preaction);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    pub fn num_connections(&self) -> usize {
        self.registry.num_connections(self.id)
    }

    /// Start the action and the inactivity sweep. Repeated calls are no-ops.
    pub async fn start(&self) -> Result<()> {
        if self.status.is_starting_or_started() {
            return Ok(());
        }
        self.status.set_starting();
        if let Role::Receiver(action) = &self.role {
            action.start().await?;
        }

        if let Some(expiry) = self.config.expiry.clone() {
            let registry = self.registry.clone();
            let owner = self.id;
            self.scheduler.call_coro_periodic(
                expiry.check_interval,
                move || {
                    let registry = registry.clone();
                    let threshold = expiry.expire_after;
                    async move {
                        registry.close_expired(owner, threshold).await;
                        Ok(())
                    }
                },
                false,
                false,
                "expiry sweep",
            );
        }
        self.status.set_started();
        info!(protocol = %self.config.name, "protocol factory started");
        Ok(())
    }

    /// Build the adaptor for a new connection.
    pub fn new_adaptor(&self, context: MessageContext, transport: ChannelTransport) -> PeerAdaptor<C> {
        let transport = Arc::new(transport);
        match &self.role {
            Role::Receiver(action) => PeerAdaptor::Receiver(ReceiverAdaptor::new(
                context,
                action.clone(),
                transport,
                self.preaction.clone(),
            )),
            Role::Sender(requester) => PeerAdaptor::Sender(SenderAdaptor::new(
                context,
                MethodTable::from_requester(requester.as_ref()),
                transport,
                self.preaction.clone(),
            )),
        }
    }

    /// Register a connection over `stream` and drive it in the background.
    pub fn spawn_connection<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        own: SocketAddr,
    ) -> Result<(Arc<ConnectionHandle>, PeerAdaptor<C>)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let context = MessageContext::for_peer(peer, own, &self.config.name);
        let handle = ConnectionHandle::new(context.peer.clone(), self.id);
        let (transport, outbound) = ChannelTransport::new();
        let adaptor = self.new_adaptor(context, transport);

        self.registry.register(handle.clone())?;
        let connection = Connection::new(
            handle.clone(),
            adaptor.clone(),
            outbound,
            self.config.read_buffer_size,
            self.config.close_timeout,
        );
        self.scheduler
            .create_task(connection.run(stream, self.registry.clone()), "connection");
        Ok((handle, adaptor))
    }

    /// Stop the sweep, drain connection tasks, wait for every owned
    /// connection to go, then close the action, pre-action and requester.
    ///
    /// Each wait is bounded by `timeout`; the first one that runs out is
    /// returned after the collaborators have been closed anyway.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.status.set_stopping();
        let drained = self.scheduler.close(timeout).await;

        let gone = tokio::time::timeout(timeout, self.registry.wait_num_connections(self.id, 0))
            .await
            .map_err(|_| {
                warn!(
                    protocol = %self.config.name,
                    remaining = self.num_connections(),
                    "connections still open after {timeout:?}"
                );
                WireError::Timeout(timeout)
            });

        match &self.role {
            Role::Receiver(action) => action.close().await,
            Role::Sender(requester) => requester.close().await,
        }
        if let Some(preaction) = &self.preaction {
            preaction.close().await;
        }
        self.status.set_stopped();
        info!(protocol = %self.config.name, "protocol factory closed");
        drained.and(gone)
    }
}
