//! JSON-RPC 2.0 request builder.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::requester::{MethodFn, Requester};

/// Builds JSON-RPC requests for a configured set of method names.
///
/// Request ids start at 1 and increase per requester; notifications carry
/// no id.
#[derive(Debug, Clone)]
pub struct JsonRpcRequester {
    methods: Vec<String>,
    notification_methods: Vec<String>,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcRequester {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
            notification_methods: Vec::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_notifications<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notification_methods = names.into_iter().map(Into::into).collect();
        self
    }

    /// A request for `method` with the next id.
    pub fn request(&self, method: &str, params: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        build(Some(id), method, params)
    }

    pub fn notification(&self, method: &str, params: Value) -> Value {
        build(None, method, params)
    }
}

fn build(id: Option<u64>, method: &str, params: Value) -> Value {
    let mut body = json!({"jsonrpc": "2.0", "method": method});
    if let Some(id) = id {
        body["id"] = json!(id);
    }
    if !params.is_null() {
        body["params"] = params;
    }
    body
}

#[async_trait]
impl Requester<Value> for JsonRpcRequester {
    fn methods(&self) -> HashMap<String, MethodFn<Value>> {
        self.methods
            .iter()
            .map(|name| {
                let this = self.clone();
                let method = name.clone();
                let f: MethodFn<Value> = Arc::new(move |params| Ok(this.request(&method, params)));
                (name.clone(), f)
            })
            .collect()
    }

    fn notification_methods(&self) -> HashMap<String, MethodFn<Value>> {
        self.notification_methods
            .iter()
            .map(|name| {
                let method = name.clone();
                let f: MethodFn<Value> = Arc::new(move |params| Ok(build(None, &method, params)));
                (name.clone(), f)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::MethodTable;

    #[test]
    fn ids_increase_per_request() {
        let requester = JsonRpcRequester::new(["add"]);
        let table = MethodTable::from_requester(&requester);
        let add = table.method("add").unwrap();

        let first = add(json!([1, 2])).unwrap();
        let second = add(Value::Null).unwrap();
        assert_eq!(first, json!({"jsonrpc": "2.0", "id": 1, "method": "add", "params": [1, 2]}));
        assert_eq!(second["id"], 2);
        assert!(second.get("params").is_none());
    }

    #[test]
    fn notifications_have_no_id() {
        let requester = JsonRpcRequester::new(Vec::<String>::new()).with_notifications(["log"]);
        let table = MethodTable::from_requester(&requester);
        let note = table.notification("log").unwrap()(json!({"m": "x"})).unwrap();
        assert!(note.get("id").is_none());
        assert_eq!(note["method"], "log");
        assert!(table.method("log").is_err());
    }
}
