//! Live connections, keyed by owning factory and peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::info;

use crate::error::{Result, WireError};
use crate::network::connection::ConnectionHandle;

type Key = (u64, String);

/// Table of live connections.
///
/// Created once and handed to every server or client that should share
/// it. Entries are keyed by `(owner, peer)`, so two factories can talk to
/// the same remote address without colliding.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Key, Arc<ConnectionHandle>>>,
    /// Bumped on every change so waiters can re-check.
    version: watch::Sender<u64>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            version: watch::channel(0).0,
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<Key, Arc<ConnectionHandle>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<()> {
        let key = (handle.owner(), handle.peer().to_string());
        {
            let mut connections = self.connections();
            if connections.contains_key(&key) {
                return Err(WireError::Other(format!(
                    "connection {} already registered",
                    handle.peer()
                )));
            }
            connections.insert(key, handle);
        }
        self.bump();
        Ok(())
    }

    /// Remove `handle`, but only if it is still the registered instance.
    pub fn deregister(&self, handle: &Arc<ConnectionHandle>) {
        let key = (handle.owner(), handle.peer().to_string());
        let removed = {
            let mut connections = self.connections();
            match connections.get(&key) {
                Some(current) if Arc::ptr_eq(current, handle) => connections.remove(&key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.bump();
        }
    }

    pub fn get(&self, owner: u64, peer: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections().get(&(owner, peer.to_string())).cloned()
    }

    pub fn num_connections(&self, owner: u64) -> usize {
        self.connections().keys().filter(|(o, _)| *o == owner).count()
    }

    pub fn owned_by(&self, owner: u64) -> Vec<Arc<ConnectionHandle>> {
        self.connections()
            .iter()
            .filter(|((o, _), _)| *o == owner)
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    /// Wait until `owner` has exactly `n` connections.
    pub async fn wait_num_connections(&self, owner: u64, n: usize) {
        let mut version = self.version.subscribe();
        while self.num_connections(owner) != n {
            if version.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close `owner`'s connections idle for longer than `threshold`.
    ///
    /// Returns how many were closed.
    pub async fn close_expired(&self, owner: u64, threshold: Duration) -> usize {
        let expired: Vec<_> = self
            .owned_by(owner)
            .into_iter()
            .filter(|handle| !handle.is_closing() && handle.idle_for() > threshold)
            .collect();
        for handle in &expired {
            info!(peer = %handle.peer(), idle = ?handle.idle_for(), "connection expired");
        }
        join_all(expired.iter().map(|handle| handle.close())).await;
        expired.len()
    }

    /// Close every connection owned by `owner`.
    pub async fn close_all(&self, owner: u64) {
        let handles = self.owned_by(owner);
        join_all(handles.iter().map(|handle| handle.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_by_owner_and_peer() {
        let registry = ConnectionRegistry::new();
        let a = ConnectionHandle::new("10.0.0.1:80", 1);
        let b = ConnectionHandle::new("10.0.0.1:80", 2);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        assert!(registry.register(ConnectionHandle::new("10.0.0.1:80", 1)).is_err());

        assert_eq!(registry.num_connections(1), 1);
        assert_eq!(registry.num_connections(2), 1);

        // A stale handle for the same key must not remove the live one.
        registry.deregister(&ConnectionHandle::new("10.0.0.1:80", 1));
        assert!(registry.get(1, "10.0.0.1:80").is_some());

        registry.deregister(&a);
        assert_eq!(registry.num_connections(1), 0);
        assert_eq!(registry.owned_by(2).len(), 1);
    }

    #[tokio::test]
    async fn wait_for_count() {
        let registry = ConnectionRegistry::new();
        let handle = ConnectionHandle::new("p:1", 7);
        registry.register(handle.clone()).unwrap();

        let waiter = tokio::spawn({
            let registry = registry.clone();
            async move { registry.wait_num_connections(7, 0).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry.deregister(&handle);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
