//! One live connection: a reader loop feeding the adaptor and a writer
//! task draining the transport channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Local;
use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{BytesCodec, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adaptor::Adaptor;
use crate::error::WireError;
use crate::network::registry::ConnectionRegistry;
use crate::status::StatusWaiter;
use crate::transport::Outbound;

// ── ConnectionHandle ─────────────────────────────────────────────

/// Shared view of a connection, kept in the [`ConnectionRegistry`].
#[derive(Debug)]
pub struct ConnectionHandle {
    peer: String,
    owner: u64,
    last_activity: Mutex<Instant>,
    status: StatusWaiter,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(peer: impl Into<String>, owner: u64) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.into(),
            owner,
            last_activity: Mutex::new(Instant::now()),
            status: StatusWaiter::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Id of the factory that created the connection.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Time since data was last received.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn is_closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ask the driver to stop and wait until it has.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.status.wait_stopped().await;
    }
}

// ── Connection driver ────────────────────────────────────────────

/// Everything needed to run one connection to completion.
pub struct Connection<A: Adaptor> {
    handle: Arc<ConnectionHandle>,
    adaptor: A,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    read_buffer_size: usize,
    close_timeout: Duration,
}

impl<A: Adaptor> Connection<A> {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        adaptor: A,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        read_buffer_size: usize,
        close_timeout: Duration,
    ) -> Self {
        Self {
            handle,
            adaptor,
            outbound,
            read_buffer_size,
            close_timeout,
        }
    }

    /// Read until EOF, an I/O error, or [`ConnectionHandle::close`].
    ///
    /// On the way out the adaptor is closed (failing any pending
    /// requests), queued outbound bytes are flushed, and the connection
    /// leaves `registry`.
    pub async fn run<S>(self, stream: S, registry: Arc<ConnectionRegistry>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Self {
            handle,
            adaptor,
            outbound,
            read_buffer_size,
            close_timeout,
        } = self;
        let peer = handle.peer().to_string();

        handle.status().set_starting();
        let (sink, mut source) =
            Framed::with_capacity(stream, BytesCodec::new(), read_buffer_size).split();
        let writer_stop = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, outbound, writer_stop.clone(), peer.clone()));
        handle.status().set_started();
        info!(peer = %peer, "new connection");

        let reason = loop {
            tokio::select! {
                _ = handle.shutdown.cancelled() => break None,
                next = source.next() => match next {
                    Some(Ok(buf)) => {
                        handle.touch();
                        debug!(peer = %peer, bytes = buf.len(), "received");
                        // Detached: the adaptor's scheduler keeps count.
                        let _ = adaptor.on_data_received(buf.freeze(), Local::now());
                    }
                    Some(Err(e)) => break Some(WireError::Io(e)),
                    None => break Some(WireError::ConnectionClosed),
                }
            }
        };

        handle.status().set_stopping();
        match &reason {
            None => debug!(peer = %peer, "closing connection"),
            Some(WireError::ConnectionClosed) => debug!(peer = %peer, "peer closed connection"),
            Some(e) => warn!(peer = %peer, "connection lost: {e}"),
        }

        if let Err(e) = adaptor.close(close_timeout).await {
            warn!(peer = %peer, "adaptor did not close cleanly: {e}");
        }
        writer_stop.cancel();
        if let Err(e) = writer.await {
            warn!(peer = %peer, "writer task ended abnormally: {e}");
        }

        registry.deregister(&handle);
        handle.status().set_stopped();
        info!(peer = %peer, "connection closed");
    }
}

/// Drain outbound bytes into the socket, reporting each send's outcome.
async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    stop: CancellationToken,
    peer: String,
) where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = stop.cancelled() => break,
        };
        let Some(out) = next else { break };
        if !write_one(&mut sink, out, &peer).await {
            return;
        }
    }

    outbound.close();
    while let Ok(out) = outbound.try_recv() {
        if !write_one(&mut sink, out, &peer).await {
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(peer = %peer, "shutdown failed: {e}");
    }
}

async fn write_one<W>(sink: &mut W, out: Outbound, peer: &str) -> bool
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let len = out.data.len();
    let result = sink.send(out.data).await;
    let ok = result.is_ok();
    if let Err(e) = &result {
        warn!(peer = %peer, bytes = len, "write failed: {e}");
    }
    if let Some(done) = out.done {
        let _ = done.send(result.map_err(WireError::from));
    }
    ok
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_touch() {
        let handle = ConnectionHandle::new("10.0.0.1:1", 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(handle.idle_for() >= Duration::from_secs(30));

        handle.touch();
        assert!(handle.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn writer_flushes_queue_before_stopping() {
        let (client, mut server) = tokio::io::duplex(64);
        let (sink, _source) = Framed::new(client, BytesCodec::new()).split();
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        for chunk in ["ab", "cd"] {
            tx.send(Outbound {
                data: Bytes::from(chunk),
                done: None,
            })
            .unwrap();
        }
        stop.cancel();
        write_loop(sink, rx, stop, "test".into()).await;

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abcd");
    }
}
