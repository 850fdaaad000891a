//! Per-connection message pipeline.
//!
//! ```text
//! transport ─► on_data_received ─► Codec::decode ─┬─► Action::do_one ─► encode ─► transport
//!                                                 └─► correlation table / notification queue
//! ```
//!
//! [`ReceiverAdaptor`] dispatches decoded messages to an
//! [`Action`](crate::action::Action); [`SenderAdaptor`] resolves pending
//! requests by request id. Both share an [`AdaptorCore`] holding the
//! lazily built codec, the connection's [`TaskScheduler`] and the
//! transport's send side.

pub mod receiver;
pub mod sender;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::action::{PreAction, RawBuffer};
use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::message::{Message, MessageContext};
use crate::task::{TaskScheduler, TrackedTask};
use crate::transport::Transport;

pub use receiver::ReceiverAdaptor;
pub use sender::SenderAdaptor;

/// What a connection driver needs from an adaptor.
#[async_trait]
pub trait Adaptor: Send + Sync + 'static {
    fn context(&self) -> Arc<MessageContext>;

    /// Feed one buffer read from the transport.
    ///
    /// Buffers must be fed in arrival order. The returned task finishes
    /// once every message decoded from `buffer` has been handled.
    fn on_data_received(&self, buffer: Bytes, timestamp: DateTime<Local>) -> TrackedTask<()>;

    /// Stop background work and drain outstanding tasks within `timeout`.
    async fn close(&self, timeout: Duration) -> Result<()>;
}

// ── AdaptorCore ──────────────────────────────────────────────────

/// State shared by both adaptor kinds.
pub struct AdaptorCore<C: Codec> {
    context: Arc<MessageContext>,
    codec: OnceLock<Arc<C>>,
    scheduler: TaskScheduler<Message<C::Item>>,
    transport: Arc<dyn Transport>,
    preaction: Option<Arc<dyn PreAction>>,
    /// Notification forwarding tasks, aborted on close.
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<C: Codec> std::fmt::Debug for AdaptorCore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorCore")
            .field("peer", &self.context.peer)
            .field("codec_ready", &self.codec.get().is_some())
            .field("outstanding", &self.scheduler.outstanding())
            .finish()
    }
}

impl<C: Codec> AdaptorCore<C> {
    pub fn new(
        context: MessageContext,
        transport: Arc<dyn Transport>,
        preaction: Option<Arc<dyn PreAction>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::new(context),
            codec: OnceLock::new(),
            scheduler: TaskScheduler::new(),
            transport,
            preaction,
            forwarders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &Arc<MessageContext> {
        &self.context
    }

    pub fn peer(&self) -> &str {
        &self.context.peer
    }

    pub fn scheduler(&self) -> &TaskScheduler<Message<C::Item>> {
        &self.scheduler
    }

    /// The connection's codec, built from `first` on first use.
    ///
    /// The codec's own notification stream (if any) starts forwarding as
    /// soon as the codec exists.
    pub fn codec(self: &Arc<Self>, first: Option<&[u8]>) -> Result<Arc<C>> {
        if let Some(codec) = self.codec.get() {
            return Ok(codec.clone());
        }
        let codec = Arc::new(C::from_context(first, &self.context)?);
        if self.codec.set(codec.clone()).is_ok() {
            debug!(peer = %self.peer(), "codec ready");
            if let Some(stream) = codec.notifications() {
                self.spawn_forwarder(stream, "codec notifications");
            }
        }
        Ok(self.codec.get().cloned().unwrap_or(codec))
    }

    /// Decode `buffer` into messages, in wire order.
    pub fn decode(
        self: &Arc<Self>,
        buffer: &Bytes,
        timestamp: DateTime<Local>,
    ) -> Result<Vec<Message<C::Item>>> {
        let codec = self.codec(Some(buffer))?;
        let msgs = codec
            .decode(buffer)?
            .into_iter()
            .map(|(encoded, decoded)| {
                let id = codec.request_id(&decoded);
                Message::received(encoded, decoded, self.context.clone(), timestamp, id)
            })
            .collect::<Vec<_>>();
        trace!(peer = %self.peer(), messages = msgs.len(), "buffer decoded");
        Ok(msgs)
    }

    /// Hand `data` to the pre-action without waiting for it.
    pub fn run_preaction(&self, data: &Bytes, timestamp: DateTime<Local>, inbound: bool) {
        let Some(preaction) = self.preaction.clone() else {
            return;
        };
        let raw = RawBuffer {
            data: data.clone(),
            context: self.context.clone(),
            timestamp,
            inbound,
        };
        self.scheduler.spawn_untracked(
            async move {
                if let Err(e) = preaction.do_one(&raw).await {
                    warn!(peer = %raw.context.peer, "pre-action failed: {e}");
                }
            },
            "preaction",
        );
    }

    /// Send raw bytes to the peer.
    pub fn send_data(&self, data: Bytes) -> Result<()> {
        self.run_preaction(&data, Local::now(), false);
        let len = data.len();
        debug!(peer = %self.peer(), bytes = len, "sending");
        let done = self.transport.send(data)?;

        if let Some(done) = done {
            let peer = self.context.peer.clone();
            self.scheduler.spawn_untracked(
                async move {
                    match done.await {
                        Ok(Ok(())) => trace!(peer = %peer, bytes = len, "send complete"),
                        Ok(Err(e)) => warn!(peer = %peer, bytes = len, "send failed: {e}"),
                        Err(_) => trace!(peer = %peer, "send dropped by transport"),
                    }
                },
                "send_done",
            );
        }
        Ok(())
    }

    /// Encode `item` and send it, returning the outgoing message.
    pub fn encode_and_send(self: &Arc<Self>, item: C::Item) -> Result<Message<C::Item>> {
        let codec = self.codec(None)?;
        let encoded = codec.encode(&item)?;
        let id = codec.request_id(&item);
        self.send_data(encoded.clone())?;
        Ok(Message::outgoing(encoded, item, self.context.clone(), id))
    }

    /// [`encode_and_send`](Self::encode_and_send) as a tracked task.
    pub fn encode_and_send_msg(self: &Arc<Self>, item: C::Item) -> TrackedTask<Result<Message<C::Item>>> {
        let core = self.clone();
        self.scheduler
            .create_task(async move { core.encode_and_send(item) }, "encode_and_send")
    }

    /// Forward every item of `stream` to the peer until it ends, the
    /// transport goes away, or the adaptor closes.
    pub fn spawn_forwarder(self: &Arc<Self>, mut stream: BoxStream<'static, C::Item>, source: &str) {
        let core: Weak<Self> = Arc::downgrade(self);
        let source_name = source.to_string();
        let handle = self.scheduler.spawn_untracked(
            async move {
                while let Some(item) = stream.next().await {
                    let Some(core) = core.upgrade() else { break };
                    match core.encode_and_send(item) {
                        Ok(_) => {}
                        Err(WireError::ConnectionClosed) => break,
                        Err(e) => warn!(peer = %core.peer(), source = %source_name, "notification not sent: {e}"),
                    }
                }
                debug!(source = %source_name, "notification stream finished");
            },
            source,
        );
        self.forwarders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the adaptor closed and abort its notification forwarders.
    pub fn close_forwarders(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let forwarders: Vec<_> = self
            .forwarders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in forwarders {
            handle.abort();
        }
    }
}

// ── Test support ─────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::SendDone;

    /// Transport that records what was sent.
    #[derive(Debug, Default)]
    pub struct Captured {
        pub sent: Mutex<Vec<Bytes>>,
    }

    impl Captured {
        pub fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for Captured {
        fn send(&self, data: Bytes) -> Result<Option<SendDone>> {
            self.sent.lock().unwrap().push(data);
            Ok(None)
        }
    }

    pub fn context() -> MessageContext {
        MessageContext::for_peer(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8888".parse().unwrap(),
            "json",
        )
    }
}
