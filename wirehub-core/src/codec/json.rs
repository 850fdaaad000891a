//! JSON codec: a buffer holds one or more concatenated JSON values.
//!
//! Values may be separated by any amount of whitespace (so both
//! newline-delimited JSON and back-to-back objects decode). The request
//! id is taken from a top-level `"id"` member.

use bytes::Bytes;
use serde_json::Value;

use crate::codec::Codec;
use crate::error::{Result, WireError};
use crate::message::{MessageContext, RequestId};

#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    peer: String,
}

impl JsonCodec {
    pub fn new(peer: impl Into<String>) -> Self {
        Self { peer: peer.into() }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Codec for JsonCodec {
    type Item = Value;

    fn from_context(_first: Option<&[u8]>, context: &MessageContext) -> Result<Self> {
        Ok(Self::new(context.peer.clone()))
    }

    fn decode(&self, buf: &Bytes) -> Result<Vec<(Bytes, Value)>> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        let mut out = Vec::new();
        let mut start = 0;

        while let Some(next) = stream.next() {
            let value = next.map_err(|e| WireError::Decode(format!("{} from {}", e, self.peer)))?;
            let end = stream.byte_offset();
            let skip = buf[start..end]
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            out.push((buf.slice(start + skip..end), value));
            start = end;
        }
        Ok(out)
    }

    fn encode(&self, item: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(item)?))
    }

    fn request_id(&self, item: &Value) -> Option<RequestId> {
        match item.get("id")? {
            Value::Number(n) => n.as_u64().map(RequestId::Num),
            Value::String(s) => Some(RequestId::Text(s.clone())),
            _ => None,
        }
    }
}
