//! Traffic recording pre-action.
//!
//! Each raw buffer, inbound or outbound, is stored as one record:
//!
//! ```text
//! ┌──────────────┬────────────────────────────────┐
//! │ len: u32 LE  │ bincode(RecordedPacket)        │
//! └──────────────┴────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::action::{PreAction, RawBuffer};
use crate::error::{Result, WireError};
use crate::file::{FileOptions, FileRegistry};

const LEN_PREFIX: usize = 4;

/// One buffer as it crossed the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedPacket {
    pub inbound: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub peer: String,
    pub data: Vec<u8>,
}

impl From<&RawBuffer> for RecordedPacket {
    fn from(buffer: &RawBuffer) -> Self {
        Self {
            inbound: buffer.inbound,
            timestamp: buffer.timestamp.timestamp_millis(),
            peer: buffer.context.peer.clone(),
            data: buffer.data.to_vec(),
        }
    }
}

/// Appends every buffer to a per-connection recording file.
#[derive(Debug)]
pub struct Recording {
    registry: Arc<FileRegistry>,
    base_path: PathBuf,
    template: String,
    options: FileOptions,
}

impl Recording {
    pub fn new(registry: Arc<FileRegistry>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            base_path: base_path.into(),
            template: "{peer}.recording".to_string(),
            options: FileOptions::default(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_options(mut self, options: FileOptions) -> Self {
        self.options = options;
        self
    }

    fn encode(packet: &RecordedPacket) -> Result<BytesMut> {
        let body = bincode::serialize(packet)?;
        let len = u32::try_from(body.len())
            .map_err(|_| WireError::Encoding(format!("record of {} bytes", body.len())))?;
        let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
        out.put_u32_le(len);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

#[async_trait]
impl PreAction for Recording {
    async fn do_one(&self, buffer: &RawBuffer) -> Result<()> {
        let record = Self::encode(&RecordedPacket::from(buffer))?;
        let path = self.base_path.join(buffer.context.render(&self.template));
        self.registry
            .open(path, &self.options)
            .write(record.freeze())
            .await
    }

    async fn close(&self) {
        self.registry.close_all(Some(&self.base_path)).await;
    }
}

/// Read back every record from a recording file.
pub async fn read_recording(path: impl AsRef<Path>) -> Result<Vec<RecordedPacket>> {
    let data = tokio::fs::read(path.as_ref()).await?;
    let mut packets = Vec::new();
    let mut rest = &data[..];

    while !rest.is_empty() {
        let Some((len, tail)) = rest.split_first_chunk::<LEN_PREFIX>() else {
            return Err(WireError::Decode("truncated record length".into()));
        };
        let len = u32::from_le_bytes(*len) as usize;
        if tail.len() < len {
            return Err(WireError::Decode(format!(
                "record needs {len} bytes, {} left",
                tail.len()
            )));
        }
        let (body, tail) = tail.split_at(len);
        packets.push(bincode::deserialize(body)?);
        rest = tail;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Local;

    use super::*;
    use crate::message::MessageContext;

    fn buffer(data: &'static [u8], inbound: bool) -> RawBuffer {
        let ctx = MessageContext::for_peer(
            "192.168.1.9:7000".parse().unwrap(),
            "0.0.0.0:8888".parse().unwrap(),
            "json",
        );
        RawBuffer {
            data: Bytes::from_static(data),
            context: Arc::new(ctx),
            timestamp: Local::now(),
            inbound,
        }
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        let recording = Recording::new(registry, dir.path());

        recording.do_one(&buffer(b"ping", true)).await.unwrap();
        recording.do_one(&buffer(b"pong", false)).await.unwrap();
        recording.close().await;

        let packets = read_recording(dir.path().join("192.168.1.9_7000.recording"))
            .await
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert!(packets[0].inbound);
        assert_eq!(packets[0].data, b"ping");
        assert!(!packets[1].inbound);
        assert_eq!(packets[1].peer, "192.168.1.9:7000");
    }

    #[tokio::test]
    async fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.recording");
        std::fs::write(&path, [10, 0, 0, 0, 1, 2]).unwrap();
        assert!(matches!(
            read_recording(&path).await,
            Err(WireError::Decode(_))
        ));
    }
}
