//! Send side of a connection, as seen by an adaptor.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, WireError};

/// Completion signal for one send; resolves once the bytes were written
/// to the socket (or the write failed).
pub type SendDone = oneshot::Receiver<Result<()>>;

/// Accepts encoded bytes for delivery to the peer.
///
/// The returned signal is informational only: adaptors log it and never
/// wait on it for flow control.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, data: Bytes) -> Result<Option<SendDone>>;
}

/// Bytes queued for the connection's writer task.
#[derive(Debug)]
pub struct Outbound {
    pub data: Bytes,
    pub done: Option<oneshot::Sender<Result<()>>>,
}

/// [`Transport`] that hands bytes to a writer task over a channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, data: Bytes) -> Result<Option<SendDone>> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Outbound {
                data,
                done: Some(done),
            })
            .map_err(|_| WireError::ConnectionClosed)?;
        Ok(Some(rx))
    }
}
