//! Codec contract: translating between raw bytes and decoded values.
//!
//! An adaptor depends only on [`Codec`]; concrete wire formats live in
//! submodules (currently [`json`]).

pub mod json;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::message::{MessageContext, RequestId};

pub use json::JsonCodec;

/// A pluggable encode/decode strategy for one wire format.
///
/// Codecs are built lazily by the adaptor, from the first buffer received
/// on a connection (or from nothing when the local side speaks first),
/// because construction may depend on connection context. After that a
/// codec is stateless apart from the context it captured.
pub trait Codec: Send + Sync + Sized + 'static {
    /// The decoded representation of one message.
    type Item: Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Build a codec for a connection.
    fn from_context(first: Option<&[u8]>, context: &MessageContext) -> Result<Self>;

    /// Split `buf` into `(raw-slice, decoded-value)` pairs in wire order.
    ///
    /// An `Err` means the whole buffer was unparseable.
    fn decode(&self, buf: &Bytes) -> Result<Vec<(Bytes, Self::Item)>>;

    /// Encode one value for sending.
    fn encode(&self, item: &Self::Item) -> Result<Bytes>;

    /// Correlation id carried by `item`, if the protocol has one.
    fn request_id(&self, _item: &Self::Item) -> Option<RequestId> {
        None
    }

    /// Items the codec itself wants pushed to the peer.
    ///
    /// Called once, right after construction. Returning a stream starts a
    /// forwarder task that lives until the adaptor closes.
    fn notifications(&self) -> Option<BoxStream<'static, Self::Item>> {
        None
    }
}
