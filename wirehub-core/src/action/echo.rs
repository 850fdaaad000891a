//! Reply-producing actions.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};

use crate::action::Action;
use crate::error::{Result, WireError};
use crate::message::Message;

// ── EchoAction ───────────────────────────────────────────────────

/// Sends every message straight back to its peer.
#[derive(Debug)]
pub struct EchoAction<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for EchoAction<T> {
    fn default() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> EchoAction<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T> Action<T> for EchoAction<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn do_one(&self, msg: &Message<T>) -> Result<Option<T>> {
        Ok(Some(msg.decoded().clone()))
    }
}

// ── JsonRpcEcho ──────────────────────────────────────────────────

const PARSE_ERROR: i64 = -32700;
const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC 2.0 responder that returns each request's `params` as its
/// `result`.
///
/// Responses arriving on the connection are filtered out; notifications
/// (requests without an id) are processed but not answered. With a
/// heartbeat interval set, every connection also receives a
/// `heartbeat` notification on that interval.
#[derive(Debug, Clone, Default)]
pub struct JsonRpcEcho {
    heartbeat: Option<Duration>,
}

impl JsonRpcEcho {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    fn error_reply(id: Value, code: i64, message: String) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        })
    }
}

#[async_trait]
impl Action<Value> for JsonRpcEcho {
    fn filter(&self, msg: &Message<Value>) -> bool {
        msg.decoded().get("method").is_none()
    }

    async fn do_one(&self, msg: &Message<Value>) -> Result<Option<Value>> {
        let request = msg.decoded();
        if !request.is_object() {
            return Err(WireError::Action("request must be an object".into()));
        }
        let Some(id) = request.get("id") else {
            return Ok(None);
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        Ok(Some(json!({"jsonrpc": "2.0", "id": id, "result": params})))
    }

    fn on_exception(&self, msg: &Message<Value>, err: &WireError) -> Option<Value> {
        let id = msg.decoded().get("id").cloned().unwrap_or(Value::Null);
        Some(Self::error_reply(id, INTERNAL_ERROR, err.to_string()))
    }

    fn on_decode_error(&self, _buffer: &[u8], err: &WireError) -> Option<Value> {
        Some(Self::error_reply(Value::Null, PARSE_ERROR, err.to_string()))
    }

    fn notifications(&self, peer: &str) -> Option<BoxStream<'static, Value>> {
        let interval = self.heartbeat?;
        let peer = peer.to_string();
        let stream = futures::stream::unfold(0u64, move |beat| async move {
            tokio::time::sleep(interval).await;
            Some((beat + 1, beat + 1))
        })
        .map(move |beat| {
            json!({
                "jsonrpc": "2.0",
                "method": "heartbeat",
                "params": {"peer": peer, "beat": beat},
            })
        });
        Some(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use chrono::Local;

    use super::*;
    use crate::message::MessageContext;

    fn msg(value: Value) -> Message<Value> {
        Message::received(
            Bytes::from(value.to_string()),
            value,
            Arc::new(MessageContext::default()),
            Local::now(),
            None,
        )
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let action = EchoAction::new();
        let reply = action.do_one(&msg(json!({"a": 1}))).await.unwrap();
        assert_eq!(reply, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn json_rpc_result_mirrors_params() {
        let action = JsonRpcEcho::new();
        let request = msg(json!({"jsonrpc": "2.0", "id": 3, "method": "sum", "params": [1, 2]}));
        assert!(!action.filter(&request));

        let reply = action.do_one(&request).await.unwrap().unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["result"], json!([1, 2]));
    }

    #[tokio::test]
    async fn json_rpc_notification_has_no_reply() {
        let action = JsonRpcEcho::new();
        let note = msg(json!({"jsonrpc": "2.0", "method": "log"}));
        assert_eq!(action.do_one(&note).await.unwrap(), None);
    }

    #[test]
    fn json_rpc_filters_responses() {
        let action = JsonRpcEcho::new();
        assert!(action.filter(&msg(json!({"jsonrpc": "2.0", "id": 1, "result": 5}))));
    }

    #[test]
    fn json_rpc_error_replies() {
        let action = JsonRpcEcho::new();
        let reply = action
            .on_decode_error(b"{", &WireError::Decode("eof".into()))
            .unwrap();
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert!(reply["id"].is_null());

        let reply = action
            .on_exception(&msg(json!({"id": 8})), &WireError::Action("boom".into()))
            .unwrap();
        assert_eq!(reply["id"], 8);
        assert_eq!(reply["error"]["code"], INTERNAL_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stream() {
        let action = JsonRpcEcho::new().with_heartbeat(Duration::from_secs(5));
        let mut beats = action.notifications("peer-a").unwrap();
        let first = beats.next().await.unwrap();
        assert_eq!(first["method"], "heartbeat");
        assert_eq!(first["params"]["beat"], 1);
        assert_eq!(first["params"]["peer"], "peer-a");
        assert!(JsonRpcEcho::new().notifications("peer-a").is_none());
    }
}
