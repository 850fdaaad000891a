//! Action that appends every received message to a per-peer file.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::action::Action;
use crate::error::Result;
use crate::file::{FileOptions, FileRegistry};
use crate::message::Message;

/// Writes the raw bytes of each message to `base_path/<template>`.
///
/// The template is rendered against the message context (see
/// [`MessageContext::render`](crate::message::MessageContext::render)),
/// so `"{host}/{protocol}.log"` gives one file per host and protocol.
/// Writes to the same path are serialized by the shared
/// [`FileRegistry`].
#[derive(Debug)]
pub struct BufferedFileStorage<T> {
    registry: Arc<FileRegistry>,
    base_path: PathBuf,
    template: String,
    options: FileOptions,
    separator: Bytes,
    _item: PhantomData<fn() -> T>,
}

impl<T> BufferedFileStorage<T> {
    pub fn new(registry: Arc<FileRegistry>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            base_path: base_path.into(),
            template: "{peer}.log".to_string(),
            options: FileOptions::default(),
            separator: Bytes::from_static(b"\n"),
            _item: PhantomData,
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

    pub fn with_separator(mut self, separator: impl Into<Bytes>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, msg: &Message<T>) -> PathBuf {
        self.base_path.join(msg.context().render(&self.template))
    }
}

#[async_trait]
impl<T> Action<T> for BufferedFileStorage<T>
where
    T: Send + Sync + 'static,
{
    async fn do_one(&self, msg: &Message<T>) -> Result<Option<T>> {
        let mut line = BytesMut::with_capacity(msg.encoded().len() + self.separator.len());
        line.extend_from_slice(msg.encoded());
        line.extend_from_slice(&self.separator);

        let file = self.registry.open(self.path_for(msg), &self.options);
        file.write(line.freeze()).await?;
        Ok(None)
    }

    async fn close(&self) {
        self.registry.close_all(Some(&self.base_path)).await;
    }
}
