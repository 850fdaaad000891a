//! Business-logic contracts plugged into a receiver adaptor.
//!
//! An [`Action`] sees every decoded message and may answer with a reply
//! value; a [`PreAction`] sees the raw bytes before decoding (traffic
//! recording and the like).

pub mod echo;
pub mod recording;
pub mod storage;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use futures::stream::BoxStream;

use crate::error::{Result, WireError};
use crate::message::{Message, MessageContext};

pub use echo::{EchoAction, JsonRpcEcho};
pub use recording::{RecordedPacket, Recording, read_recording};
pub use storage::BufferedFileStorage;

/// Handler for decoded messages of type `T`.
///
/// Only [`do_one`](Action::do_one) is required. Failures are isolated per
/// message: an error from `do_one` is routed to
/// [`on_exception`](Action::on_exception) and never affects sibling
/// messages decoded from the same buffer.
#[async_trait]
pub trait Action<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Return `true` to drop `msg` without calling `do_one`.
    fn filter(&self, _msg: &Message<T>) -> bool {
        false
    }

    /// Handle one message, optionally producing a reply to send back.
    async fn do_one(&self, msg: &Message<T>) -> Result<Option<T>>;

    /// Reply to send when `do_one` failed for `msg`.
    fn on_exception(&self, _msg: &Message<T>, _err: &WireError) -> Option<T> {
        None
    }

    /// Reply to send when a whole buffer could not be decoded.
    fn on_decode_error(&self, _buffer: &[u8], _err: &WireError) -> Option<T> {
        None
    }

    /// Items to push to `peer` unprompted.
    ///
    /// Called once per connection. The adaptor forwards every item until
    /// the stream ends or the connection closes; a finished stream is not
    /// restarted.
    fn notifications(&self, _peer: &str) -> Option<BoxStream<'static, T>> {
        None
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

// ── PreAction ────────────────────────────────────────────────────

/// Raw bytes as they crossed the transport.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub data: Bytes,
    pub context: Arc<MessageContext>,
    pub timestamp: DateTime<Local>,
    /// `true` for bytes received from the peer, `false` for bytes sent.
    pub inbound: bool,
}

/// Side-channel consumer of raw buffers, run before decoding.
///
/// Pre-actions are fire-and-forget: the adaptor does not wait for them
/// and a failure is only logged.
#[async_trait]
pub trait PreAction: Send + Sync + 'static {
    async fn do_one(&self, buffer: &RawBuffer) -> Result<()>;

    async fn close(&self) {}
}
