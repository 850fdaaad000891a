//! Server-side adaptor: decoded messages go to an [`Action`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::action::{Action, PreAction};
use crate::adaptor::{Adaptor, AdaptorCore};
use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::message::{Message, MessageContext};
use crate::task::TrackedTask;
use crate::transport::Transport;

/// Dispatches every decoded message to an action and sends its replies.
///
/// Messages decoded from one buffer run as sibling tasks: they start in
/// decode order but may finish in any order, and one failing does not
/// affect the others.
pub struct ReceiverAdaptor<C: Codec> {
    core: Arc<AdaptorCore<C>>,
    action: Arc<dyn Action<C::Item>>,
}

impl<C: Codec> Clone for ReceiverAdaptor<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            action: self.action.clone(),
        }
    }
}

impl<C: Codec> std::fmt::Debug for ReceiverAdaptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverAdaptor").field("core", &self.core).finish()
    }
}

impl<C: Codec> ReceiverAdaptor<C> {
    /// Build the adaptor and start forwarding the action's notifications
    /// for this peer, if it has any.
    pub fn new(
        context: MessageContext,
        action: Arc<dyn Action<C::Item>>,
        transport: Arc<dyn Transport>,
        preaction: Option<Arc<dyn PreAction>>,
    ) -> Self {
        let core = AdaptorCore::new(context, transport, preaction);
        if let Some(stream) = action.notifications(core.peer()) {
            core.spawn_forwarder(stream, "action notifications");
        }
        Self { core, action }
    }

    pub fn core(&self) -> &Arc<AdaptorCore<C>> {
        &self.core
    }

    /// Encode `item` and send it as a tracked task.
    pub fn encode_and_send_msg(&self, item: C::Item) -> TrackedTask<Result<Message<C::Item>>> {
        self.core.encode_and_send_msg(item)
    }

    /// Filter, then run `do_one` for every remaining message concurrently,
    /// returning when all of them are done.
    pub async fn process_msgs(&self, msgs: Vec<Message<C::Item>>) {
        let mut tasks = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if self.action.filter(&msg) {
                debug!(peer = %msg.peer(), id = ?msg.request_id(), "message filtered");
                continue;
            }
            let this = self.clone();
            tasks.push(
                self.core
                    .scheduler()
                    .create_task(async move { this.process_one(msg).await }, "do_one"),
            );
        }

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(peer = %self.core.peer(), "message task ended abnormally: {e}");
            }
        }
    }

    async fn process_one(&self, msg: Message<C::Item>) {
        let reply = match self.action.do_one(&msg).await {
            Ok(reply) => {
                debug!(peer = %msg.peer(), id = ?msg.request_id(), "message processed");
                reply
            }
            Err(e) => {
                warn!(peer = %msg.peer(), id = ?msg.request_id(), "action failed: {e}");
                self.action.on_exception(&msg, &e)
            }
        };
        if let Some(reply) = reply {
            self.reply(reply);
        }
    }

    fn decode_failed(&self, buffer: &[u8], err: WireError) {
        warn!(peer = %self.core.peer(), bytes = buffer.len(), "decode failed: {err}");
        if let Some(reply) = self.action.on_decode_error(buffer, &err) {
            self.reply(reply);
        }
    }

    fn reply(&self, item: C::Item) {
        if let Err(e) = self.core.encode_and_send(item) {
            warn!(peer = %self.core.peer(), "reply not sent: {e}");
        }
    }
}

#[async_trait]
impl<C: Codec> Adaptor for ReceiverAdaptor<C> {
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
                    Ok(msgs) => this.process_msgs(msgs).await,
                    Err(e) => this.decode_failed(&buffer, e),
                }
            },
            "process_msgs",
        )
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.core.close_forwarders();
        self.core.scheduler().close(timeout).await
    }
}
