//! Per-path write serialization.
//!
//! Every writer for a given path goes through one [`ManagedFile`]: a
//! single task drains its queue, concatenates whatever is pending into
//! one write, and resolves each caller's completion signal. Interleaved
//! writes to the same output are therefore impossible without any lock
//! around the file itself.
//!
//! ```text
//! writer 1 ─┐
//! writer 2 ─┼─► queue ─► manage task ─► one write per batch ─► file
//! writer N ─┘
//! ```
//!
//! Instances live in an explicit [`FileRegistry`] keyed by path. A file
//! closes itself after a period of inactivity, which bounds the number
//! of open handles. Reopening a path while its previous instance is
//! still closing chains the new instance behind the old one, so two
//! handles for the same path are never open at the same time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, WireError};
use crate::status::StatusWaiter;

/// Upper bound on writes merged into one flush, so a busy producer
/// cannot monopolise the writer task.
pub const MAX_BATCH_ITEMS: usize = 256;

// ── FileOptions ──────────────────────────────────────────────────

/// How a path is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Append,
    Truncate,
}

/// Settings applied to a newly opened [`ManagedFile`].
#[derive(Debug, Clone)]
pub struct FileOptions {
    pub mode: WriteMode,
    /// Close after this long without a write.
    pub inactivity_timeout: Duration,
    /// Upper bound for flushing queued writes in [`ManagedFile::close`].
    pub close_timeout: Duration,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            mode: WriteMode::Append,
            inactivity_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(10),
        }
    }
}

// ── FileRegistry ─────────────────────────────────────────────────

/// Path-keyed table of live [`ManagedFile`]s.
///
/// Injected into whatever needs file output; independent registries
/// never share instances.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: Mutex<HashMap<PathBuf, Arc<ManagedFile>>>,
}

impl FileRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<ManagedFile>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live instance for `path`, or start a new one.
    ///
    /// An instance that is already closing is not reused: the new one
    /// records it as its predecessor and waits for it before opening.
    pub fn open(self: &Arc<Self>, path: impl AsRef<Path>, options: &FileOptions) -> Arc<ManagedFile> {
        let path = path.as_ref().to_path_buf();
        let mut files = self.files();

        let previous = match files.get(&path) {
            Some(file) if !file.status.is_stopping_or_stopped() => return file.clone(),
            Some(file) => Some(file.clone()),
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (queued, _) = watch::channel(0);
        let file = Arc::new(ManagedFile {
            path: path.clone(),
            status: StatusWaiter::new(),
            tx,
            queued,
            previous: previous.as_ref().map(Arc::downgrade),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            close_timeout: options.close_timeout,
        });

        let handle = tokio::spawn(file.clone().manage(
            previous,
            rx,
            Arc::downgrade(self),
            options.clone(),
        ));
        *file.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        files.insert(path, file.clone());
        file
    }

    /// The registered instance for `path`, if any.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<ManagedFile>> {
        self.files().get(path.as_ref()).cloned()
    }

    pub fn is_open(&self, path: impl AsRef<Path>) -> bool {
        self.files().contains_key(path.as_ref())
    }

    pub fn num_open(&self) -> usize {
        self.files().len()
    }

    /// Close every registered file, or only those under `base_path`.
    pub async fn close_all(&self, base_path: Option<&Path>) {
        let targets: Vec<_> = self
            .files()
            .values()
            .filter(|f| base_path.is_none_or(|base| f.path.starts_with(base)))
            .cloned()
            .collect();
        // Predecessors replaced while closing have left the table but may
        // still hold their handle.
        let replaced: Vec<_> = targets.iter().flat_map(|f| f.predecessors()).collect();
        futures::future::join(
            futures::future::join_all(replaced.iter().map(|f| f.close())),
            futures::future::join_all(targets.iter().map(|f| f.close())),
        )
        .await;
    }

    fn deregister(&self, file: &ManagedFile) {
        let mut files = self.files();
        if files
            .get(&file.path)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), file))
        {
            files.remove(&file.path);
        }
    }
}

// ── ManagedFile ──────────────────────────────────────────────────

struct WriteRequest {
    payload: Bytes,
    done: oneshot::Sender<Result<()>>,
}

/// The single writer for one path.
#[derive(Debug)]
pub struct ManagedFile {
    path: PathBuf,
    status: StatusWaiter,
    tx: mpsc::UnboundedSender<WriteRequest>,
    /// Writes enqueued but not yet resolved.
    queued: watch::Sender<usize>,
    /// The closing instance this one replaced, while it is still alive.
    previous: Option<Weak<ManagedFile>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("len", &self.payload.len())
            .finish()
    }
}

impl ManagedFile {
    /// Shorthand for [`FileRegistry::open`].
    pub fn open(
        registry: &Arc<FileRegistry>,
        path: impl AsRef<Path>,
        options: &FileOptions,
    ) -> Arc<ManagedFile> {
        registry.open(path, options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    /// Queue `payload` and wait until it has been written.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.status.is_stopping_or_stopped() {
            return Err(WireError::FileClosed(self.path.clone()));
        }
        let (done, rx) = oneshot::channel();
        self.queued.send_modify(|n| *n += 1);
        let request = WriteRequest {
            payload: payload.into(),
            done,
        };
        if self.tx.send(request).is_err() {
            self.queued.send_modify(|n| *n = n.saturating_sub(1));
            return Err(WireError::FileClosed(self.path.clone()));
        }
        rx.await
            .map_err(|_| WireError::FileClosed(self.path.clone()))?
    }

    /// Flush queued writes (bounded), then stop the writer task.
    ///
    /// Safe to call more than once; later callers wait for the first.
    pub async fn close(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            self.status.wait_stopped().await;
            return;
        };

        if !self.status.is_stopping_or_stopped() {
            self.status.set_stopping();
        }

        let mut queued = self.queued.subscribe();
        let drained = async {
            let _ = queued.wait_for(|n| *n == 0).await;
        };
        let flushed = async {
            tokio::select! {
                _ = drained => {}
                _ = self.status.wait_stopped() => {}
            }
        };
        if tokio::time::timeout(self.close_timeout, flushed).await.is_err() {
            warn!(path = %self.path.display(), "queued writes not flushed within {:?}", self.close_timeout);
        }

        self.cancel.cancel();
        if let Err(e) = handle.await {
            error!(path = %self.path.display(), "file task ended abnormally: {e}");
            self.status.set_stopped();
        }
    }

    /// Wait for the file to be fully closed.
    pub async fn wait_closed(&self) {
        self.status.wait_stopped().await;
    }

    /// Every earlier instance for this path that is still alive, newest
    /// first.
    fn predecessors(&self) -> Vec<Arc<ManagedFile>> {
        let mut chain = Vec::new();
        let mut next = self.previous.as_ref().and_then(Weak::upgrade);
        while let Some(file) = next {
            next = file.previous.as_ref().and_then(Weak::upgrade);
            chain.push(file);
        }
        chain
    }

    // ── Writer task ──────────────────────────────────────────────

    async fn manage(
        self: Arc<Self>,
        previous: Option<Arc<ManagedFile>>,
        mut rx: mpsc::UnboundedReceiver<WriteRequest>,
        registry: Weak<FileRegistry>,
        options: FileOptions,
    ) {
        if let Some(previous) = previous {
            debug!(path = %self.path.display(), "waiting for previous instance to close");
            previous.wait_closed().await;
        }

        if !self.status.is_stopping_or_stopped() {
            self.status.set_starting();
        }
        let mut file = self.open_file(options.mode).await;
        if !self.status.is_stopping_or_stopped() {
            self.status.set_started();
        }

        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(options.inactivity_timeout, rx.recv()) => match next {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(_) => {
                        debug!(path = %self.path.display(), "closing inactive file");
                        break;
                    }
                },
            };

            let mut batch = vec![first];
            while batch.len() < MAX_BATCH_ITEMS {
                match rx.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }
            self.flush(&mut file, batch).await;
            tokio::task::yield_now().await;
        }

        if !self.status.is_stopping_or_stopped() {
            self.status.set_stopping();
        }
        rx.close();
        let mut rest = Vec::new();
        while let Ok(request) = rx.try_recv() {
            rest.push(request);
        }
        if !rest.is_empty() {
            self.flush(&mut file, rest).await;
        }
        drop(file);

        if let Some(registry) = registry.upgrade() {
            registry.deregister(&self);
        }
        debug!(path = %self.path.display(), "file closed");
        self.status.set_stopped();
    }

    async fn open_file(&self, mode: WriteMode) -> std::result::Result<File, Arc<std::io::Error>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(Arc::new)?;
        }
        let result = OpenOptions::new()
            .create(true)
            .write(true)
            .append(mode == WriteMode::Append)
            .truncate(mode == WriteMode::Truncate)
            .open(&self.path)
            .await;
        match result {
            Ok(file) => {
                debug!(path = %self.path.display(), "file opened");
                Ok(file)
            }
            Err(e) => {
                error!(path = %self.path.display(), "failed to open file: {e}");
                Err(Arc::new(e))
            }
        }
    }

    /// Write a whole batch at once and resolve every caller with the
    /// same outcome.
    async fn flush(
        &self,
        file: &mut std::result::Result<File, Arc<std::io::Error>>,
        batch: Vec<WriteRequest>,
    ) {
        let items = batch.len();
        let outcome = match file {
            Ok(file) => {
                let mut buf = BytesMut::with_capacity(batch.iter().map(|r| r.payload.len()).sum());
                for request in &batch {
                    buf.extend_from_slice(&request.payload);
                }
                let written = async {
                    file.write_all(&buf).await?;
                    file.flush().await
                }
                .await;
                match written {
                    Ok(()) => {
                        debug!(path = %self.path.display(), items, bytes = buf.len(), "batch written");
                        Ok(())
                    }
                    Err(e) => {
                        error!(path = %self.path.display(), items, "batch write failed: {e}");
                        Err(Arc::new(e))
                    }
                }
            }
            Err(e) => Err(e.clone()),
        };

        for request in batch {
            let result = match &outcome {
                Ok(()) => Ok(()),
                Err(source) => Err(WireError::WriteFailed {
                    path: self.path.clone(),
                    source: source.clone(),
                }),
            };
            let _ = request.done.send(result);
        }
        self.queued.send_modify(|n| *n = n.saturating_sub(items));
    }
}

// ── Tests ────────────────────────────────────────────────────────
