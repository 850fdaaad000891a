//! Client-side RPC surface.
//!
//! A [`Requester`] declares which named calls a sender adaptor can make,
//! each as a function turning call parameters into the item to send.
//! [`MethodTable`] resolves those names once, when the adaptor is built.

pub mod json_rpc;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, WireError};

pub use json_rpc::JsonRpcRequester;

/// Builds the item for one named call from its parameters.
pub type MethodFn<T> = Arc<dyn Fn(Value) -> Result<T> + Send + Sync>;

/// Declares the calls available on a sender connection.
#[async_trait]
pub trait Requester<T>: Send + Sync + 'static {
    /// Calls that expect a reply.
    fn methods(&self) -> HashMap<String, MethodFn<T>>;

    /// Fire-and-forget calls.
    fn notification_methods(&self) -> HashMap<String, MethodFn<T>> {
        HashMap::new()
    }

    async fn close(&self) {}
}

// ── MethodTable ──────────────────────────────────────────────────

/// Name → builder lookup for request and notification calls.
pub struct MethodTable<T> {
    methods: HashMap<String, MethodFn<T>>,
    notifications: HashMap<String, MethodFn<T>>,
}

impl<T> Clone for MethodTable<T> {
    fn clone(&self) -> Self {
        Self {
            methods: self.methods.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("notifications", &self.notifications.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: 'static> Default for MethodTable<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: 'static> MethodTable<T> {
    pub fn empty() -> Self {
        Self {
            methods: HashMap::new(),
            notifications: HashMap::new(),
        }
    }

    pub fn from_requester(requester: &dyn Requester<T>) -> Self {
        Self {
            methods: requester.methods(),
            notifications: requester.notification_methods(),
        }
    }

    /// The builder for a request/reply call.
    pub fn method(&self, name: &str) -> Result<&MethodFn<T>> {
        self.methods
            .get(name)
            .ok_or_else(|| WireError::MethodNotFound(name.to_string()))
    }

    /// The builder for a notification call.
    pub fn notification(&self, name: &str) -> Result<&MethodFn<T>> {
        self.notifications
            .get(name)
            .ok_or_else(|| WireError::MethodNotFound(name.to_string()))
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn has_notification(&self, name: &str) -> bool {
        self.notifications.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Requester<String> for Upper {
        fn methods(&self) -> HashMap<String, MethodFn<String>> {
            let f: MethodFn<String> = Arc::new(|params| Ok(params.to_string().to_uppercase()));
            HashMap::from([("shout".to_string(), f)])
        }
    }

    #[test]
    fn resolves_declared_names_only() {
        let table = MethodTable::from_requester(&Upper);
        let shout = table.method("shout").unwrap();
        assert_eq!(shout(Value::from("hi")).unwrap(), "\"HI\"");

        assert!(matches!(
            table.method("whisper"),
            Err(WireError::MethodNotFound(name)) if name == "whisper"
        ));
        assert!(table.notification("shout").is_err());
        assert!(!MethodTable::<String>::empty().has_method("shout"));
    }

    fn table_for<T: 'static>(requester: &dyn Requester<T>) -> MethodTable<T> {
        MethodTable::from_requester(requester)
    }

    #[test]
    fn generic_tables_from_default_and_requester() {
        let table = table_for(&Upper);
        assert!(table.has_method("shout"));
        let empty: MethodTable<Value> = MethodTable::default();
        assert!(!empty.has_method("shout"));
        assert!(!empty.has_notification("shout"));
    }
}
