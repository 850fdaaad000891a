//! Message objects flowing through an adaptor.
//!
//! A [`Message`] pairs the raw bytes of one wire message with the value
//! a [`Codec`](crate::codec::Codec) decoded from them, the connection
//! context it arrived on, and the correlation id (if the protocol has
//! one).

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

// ── RequestId ────────────────────────────────────────────────────

/// Identifier used to correlate a response with its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ── MessageContext ───────────────────────────────────────────────

/// Per-connection information shared by every message on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    /// Canonical peer string, unique within the owning server/client.
    pub peer: String,
    pub host: String,
    pub port: u16,
    /// Local address of the socket.
    pub own: String,
    /// Name of the protocol factory that created the connection.
    pub protocol_name: String,
    /// Friendly name for the peer; defaults to the host.
    pub alias: String,
    /// Free-form entries contributed by transports or codecs.
    pub extra: BTreeMap<String, String>,
}

impl MessageContext {
    /// Build a context for a socket connection.
    pub fn for_peer(peer: SocketAddr, own: SocketAddr, protocol_name: &str) -> Self {
        let host = peer.ip().to_string();
        Self {
            peer: peer.to_string(),
            alias: host.clone(),
            host,
            port: peer.port(),
            own: own.to_string(),
            protocol_name: protocol_name.to_string(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Substitute `{peer}`, `{host}`, `{port}`, `{protocol}` and `{alias}`
    /// placeholders in `template`.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{peer}", &self.peer.replace(':', "_"))
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
            .replace("{protocol}", &self.protocol_name)
            .replace("{alias}", &self.alias)
    }
}

// ── Message ──────────────────────────────────────────────────────

/// One decoded wire message.
///
/// Immutable once constructed, apart from the received/sent flag.
#[derive(Debug, Clone)]
pub struct Message<T> {
    encoded: Bytes,
    decoded: T,
    context: Arc<MessageContext>,
    timestamp: DateTime<Local>,
    request_id: Option<RequestId>,
    received: bool,
}

impl<T> Message<T> {
    /// A message that arrived from the peer.
    pub fn received(
        encoded: Bytes,
        decoded: T,
        context: Arc<MessageContext>,
        timestamp: DateTime<Local>,
        request_id: Option<RequestId>,
    ) -> Self {
        Self {
            encoded,
            decoded,
            context,
            timestamp,
            request_id,
            received: true,
        }
    }

    /// A message produced locally for sending.
    pub fn outgoing(
        encoded: Bytes,
        decoded: T,
        context: Arc<MessageContext>,
        request_id: Option<RequestId>,
    ) -> Self {
        Self {
            encoded,
            decoded,
            context,
            timestamp: Local::now(),
            request_id,
            received: false,
        }
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    pub fn decoded(&self) -> &T {
        &self.decoded
    }

    pub fn into_decoded(self) -> T {
        self.decoded
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn peer(&self) -> &str {
        &self.context.peer
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn is_received(&self) -> bool {
        self.received
    }

    pub fn mark_sent(&mut self) {
        self.received = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> MessageContext {
        MessageContext::for_peer(
            "10.0.0.5:4000".parse().unwrap(),
            "0.0.0.0:8888".parse().unwrap(),
            "json",
        )
    }

    #[test]
    fn context_for_peer() {
        let ctx = context();
        assert_eq!(ctx.peer, "10.0.0.5:4000");
        assert_eq!(ctx.host, "10.0.0.5");
        assert_eq!(ctx.alias, "10.0.0.5");
        assert_eq!(ctx.port, 4000);
    }

    #[test]
    fn render_template() {
        let ctx = context().with_alias("sensor-1");
        assert_eq!(ctx.render("{alias}/{protocol}.bin"), "sensor-1/json.bin");
        assert_eq!(ctx.render("{peer}.log"), "10.0.0.5_4000.log");
    }

    #[test]
    fn request_id_json_forms() {
        let n: RequestId = serde_json::from_str("7").unwrap();
        assert_eq!(n, RequestId::Num(7));
        let s: RequestId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(s, RequestId::from("abc"));
    }

    #[test]
    fn sent_flag() {
        let mut msg = Message::received(
            Bytes::from_static(b"x"),
            1u8,
            Arc::new(context()),
            Local::now(),
            None,
        );
        assert!(msg.is_received());
        msg.mark_sent();
        assert!(!msg.is_received());
    }
}
