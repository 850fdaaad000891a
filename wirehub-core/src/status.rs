//! Four-state lifecycle primitive shared by connections, servers,
//! actions and managed files.
//!
//! ```text
//!  Init ──► Starting ──► Started ──► Stopping ──► Stopped
//! ```
//!
//! State changes are broadcast through a `tokio::sync::watch` channel,
//! so any number of tasks can suspend until a given state is reached.
//! The primitive never rejects a transition: owners check the query
//! methods and raise their own domain error (for example
//! [`WireError::ServerAlreadyStarted`](crate::WireError::ServerAlreadyStarted)).

use std::fmt;

use tokio::sync::watch;

// ── Status ───────────────────────────────────────────────────────

/// The lifecycle state tracked by a [`StatusWaiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Status {
    /// Constructed, nothing started yet.
    #[default]
    Init,
    /// Start-up in progress.
    Starting,
    /// Fully running.
    Started,
    /// Shutdown in progress.
    Stopping,
    /// Terminal state.
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ── StatusWaiter ─────────────────────────────────────────────────

/// Observable lifecycle state with async "wait until" operations.
#[derive(Debug)]
pub struct StatusWaiter {
    tx: watch::Sender<Status>,
}

impl Default for StatusWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusWaiter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Status::Init);
        Self { tx }
    }

    /// The current state.
    pub fn get(&self) -> Status {
        *self.tx.borrow()
    }

    // ── Transitions ──────────────────────────────────────────────

    pub fn set_starting(&self) {
        self.set(Status::Starting);
    }

    pub fn set_started(&self) {
        self.set(Status::Started);
    }

    pub fn set_stopping(&self) {
        self.set(Status::Stopping);
    }

    pub fn set_stopped(&self) {
        self.set(Status::Stopped);
    }

    fn set(&self, status: Status) {
        // send_replace succeeds even with no receivers alive.
        self.tx.send_replace(status);
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn is_started(&self) -> bool {
        self.get() == Status::Started
    }

    pub fn is_starting_or_started(&self) -> bool {
        matches!(self.get(), Status::Starting | Status::Started)
    }

    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self.get(), Status::Stopping | Status::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.get() == Status::Stopped
    }

    // ── Waiting ──────────────────────────────────────────────────

    /// Suspend until the state is exactly `Started`.
    pub async fn wait_started(&self) {
        self.wait_for(|s| s == Status::Started).await;
    }

    /// Suspend until start-up has completed at some point, even if the
    /// owner has since begun stopping.
    pub async fn wait_has_started(&self) {
        self.wait_for(|s| s >= Status::Started).await;
    }

    /// Suspend until shutdown has begun.
    pub async fn wait_stopping(&self) {
        self.wait_for(|s| s >= Status::Stopping).await;
    }

    /// Suspend until the terminal state is reached.
    pub async fn wait_stopped(&self) {
        self.wait_for(|s| s == Status::Stopped).await;
    }

    async fn wait_for(&self, pred: impl Fn(Status) -> bool) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| pred(*s)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let status = StatusWaiter::new();
        assert_eq!(status.get(), Status::Init);
        assert!(!status.is_starting_or_started());

        status.set_starting();
        assert!(status.is_starting_or_started());
        assert!(!status.is_started());

        status.set_started();
        assert!(status.is_started());

        status.set_stopping();
        assert!(status.is_stopping_or_stopped());
        assert!(!status.is_started());

        status.set_stopped();
        assert!(status.is_stopped());
    }

    #[tokio::test]
    async fn wait_started_releases_waiter() {
        let status = Arc::new(StatusWaiter::new());
        let waiter = tokio::spawn({
            let status = status.clone();
            async move { status.wait_started().await }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        status.set_starting();
        status.set_started();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not released")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_has_started_after_stop() {
        let status = StatusWaiter::new();
        status.set_started();
        status.set_stopping();
        status.set_stopped();
        // Already past started: returns immediately.
        tokio::time::timeout(Duration::from_millis(100), status.wait_has_started())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn wait_stopped_blocks_until_stopped() {
        let status = Arc::new(StatusWaiter::new());
        status.set_started();
        status.set_stopping();

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), status.wait_stopped()).await;
        assert!(blocked.is_err());

        status.set_stopped();
        tokio::time::timeout(Duration::from_millis(100), status.wait_stopped())
            .await
            .expect("should be stopped");
    }

    #[test]
    fn wait_stopping_wakes_on_transition() {
        let status = StatusWaiter::new();
        status.set_started();

        let mut waiting = tokio_test::task::spawn(status.wait_stopping());
        tokio_test::assert_pending!(waiting.poll());

        status.set_stopping();
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[test]
    fn display_format() {
        assert_eq!(Status::Init.to_string(), "init");
        assert_eq!(Status::Stopping.to_string(), "stopping");
    }
}
