//! Client-side adaptor: responses resolve pending requests by id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use crate::action::PreAction;
use crate::adaptor::{Adaptor, AdaptorCore};
use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::message::{Message, MessageContext, RequestId};
use crate::requester::MethodTable;
use crate::task::TrackedTask;
use crate::transport::Transport;

/// Messages that matched no pending request.
struct NotificationQueue<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
    rx: Mutex<mpsc::UnboundedReceiver<Message<T>>>,
}

impl<T> NotificationQueue<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

/// Sends requests and matches responses to them.
///
/// A decoded message whose request id has a pending future resolves it;
/// anything else (no id, unknown id, or a waiter that already gave up)
/// is queued as a notification.
pub struct SenderAdaptor<C: Codec> {
    core: Arc<AdaptorCore<C>>,
    methods: MethodTable<C::Item>,
    notifications: Arc<NotificationQueue<C::Item>>,
}

impl<C: Codec> Clone for SenderAdaptor<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            methods: self.methods.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

impl<C: Codec> std::fmt::Debug for SenderAdaptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderAdaptor")
            .field("core", &self.core)
            .field("methods", &self.methods)
            .finish()
    }
}

impl<C: Codec> SenderAdaptor<C> {
    pub fn new(
        context: MessageContext,
        methods: MethodTable<C::Item>,
        transport: Arc<dyn Transport>,
        preaction: Option<Arc<dyn PreAction>>,
    ) -> Self {
        Self {
            core: AdaptorCore::new(context, transport, preaction),
            methods,
            notifications: Arc::new(NotificationQueue::new()),
        }
    }

    pub fn core(&self) -> &Arc<AdaptorCore<C>> {
        &self.core
    }

    /// Route each message to its pending request or the notification queue.
    pub fn process_msgs(&self, msgs: Vec<Message<C::Item>>) {
        for msg in msgs {
            let unmatched = match msg.request_id().cloned() {
                Some(id) => match self.core.scheduler().set_result(&id, msg) {
                    Ok(()) => {
                        trace!(peer = %self.core.peer(), id = %id, "response matched");
                        continue;
                    }
                    Err(msg) => {
                        debug!(peer = %self.core.peer(), id = %id, "no pending request");
                        msg
                    }
                },
                None => msg,
            };
            let _ = self.notifications.tx.send(unmatched);
        }
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send `data` and wait for the response carrying `id`.
    pub async fn send_data_and_wait(&self, id: RequestId, data: Bytes) -> Result<Message<C::Item>> {
        let core = self.core.clone();
        self.core
            .scheduler()
            .run_wait_fut(id, move || async move {
                // Closed after the future was created: nobody will fail it.
                if core.is_closed() {
                    return Err(WireError::ConnectionClosed);
                }
                core.send_data(data)
            })
            .await
    }

    /// Send an already encoded message and wait for its response.
    pub async fn send_msg_and_wait(&self, msg: &Message<C::Item>) -> Result<Message<C::Item>> {
        let id = msg
            .request_id()
            .cloned()
            .ok_or_else(|| WireError::Encode("message has no request id".into()))?;
        self.send_data_and_wait(id, msg.encoded().clone()).await
    }

    /// Encode `item`, send it, and wait for its response.
    pub async fn encode_send_wait(&self, item: C::Item) -> Result<Message<C::Item>> {
        let codec = self.core.codec(None)?;
        let id = codec
            .request_id(&item)
            .ok_or_else(|| WireError::Encode(format!("no request id in {item:?}")))?;
        let data = codec.encode(&item)?;
        self.send_data_and_wait(id, data).await
    }

    /// Encode `item` and send it without waiting for a response.
    pub fn encode_and_send_msg(&self, item: C::Item) -> TrackedTask<Result<Message<C::Item>>> {
        self.core.encode_and_send_msg(item)
    }

    /// Call a declared request method and wait for the reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Message<C::Item>> {
        let item = (self.methods.method(method)?)(params)?;
        self.encode_send_wait(item).await
    }

    /// Send a declared notification method.
    pub fn notify(&self, method: &str, params: Value) -> Result<Message<C::Item>> {
        let item = (self.methods.notification(method)?)(params)?;
        self.core.encode_and_send(item)
    }

    pub fn methods(&self) -> &MethodTable<C::Item> {
        &self.methods
    }

    // ── Notifications ────────────────────────────────────────────

    /// Wait for the next unmatched message.
    pub async fn wait_notification(&self) -> Result<Message<C::Item>> {
        self.notifications
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(WireError::ChannelClosed)
    }

    /// The next unmatched message, if one is already queued.
    pub fn get_notification(&self) -> Option<Message<C::Item>> {
        self.notifications.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Drain every queued unmatched message.
    pub fn all_notifications(&self) -> Vec<Message<C::Item>> {
        let mut out = Vec::new();
        while let Some(msg) = self.get_notification() {
            out.push(msg);
        }
        out
    }
}

#[async_trait]
impl<C: Codec> Adaptor for SenderAdaptor<C> {
    fn context(&self) -> Arc<MessageContext> {
        self.core.context().clone()
    }

    fn on_data_received(&self, buffer: Bytes, timestamp: DateTime<Local>) -> TrackedTask<()> {
        self.core.run_preaction(&buffer, timestamp, true);
        let decoded = self.core.decode(&buffer, timestamp);
        let this = self.clone();
        self.core.scheduler().create_task(
            async move {
                match decoded {
                    Ok(msgs) => this.process_msgs(msgs),
                    Err(e) => warn!(peer = %this.core.peer(), bytes = buffer.len(), "decode failed: {e}"),
                }
            },
            "process_msgs",
        )
    }

    /// Fail every pending request with [`WireError::ConnectionClosed`],
    /// then drain.
    async fn close(&self, timeout: Duration) -> Result<()> {
        self.core.close_forwarders();
        self.core
            .scheduler()
            .cancel_all_futures(|| WireError::ConnectionClosed);
        self.core.scheduler().close(timeout).await
    }
}
