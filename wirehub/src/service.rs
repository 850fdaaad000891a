//! Builds servers and clients from an [`AppConfig`].

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use wirehub_core::{
    Action, BufferedFileStorage, ConnectionRegistry, FactoryConfig, FileRegistry, JsonCodec,
    JsonRpcEcho, JsonRpcRequester, ProtocolFactory, Recording, Result, TcpClient, TcpServer,
    WireError,
};

use crate::config::AppConfig;

/// Protocol name recorded in message contexts and file names.
pub const PROTOCOL: &str = "jsonrpc";

/// A JSON-RPC server per `config`: echo by default, message storage with
/// `storage.store_messages`, plus traffic recording with `storage.record`.
pub fn build_server(config: &AppConfig, files: Arc<FileRegistry>) -> TcpServer<JsonCodec> {
    let base = &config.storage.base_path;
    let action: Arc<dyn Action<Value>> = if config.storage.store_messages {
        Arc::new(
            BufferedFileStorage::new(files.clone(), base.join("messages"))
                .with_template("{protocol}/{peer}.jsonl")
                .with_options(config.file_options()),
        )
    } else {
        Arc::new(JsonRpcEcho::new())
    };

    let mut factory = ProtocolFactory::receiver(
        config.to_factory_config(PROTOCOL),
        action,
        ConnectionRegistry::new(),
    );
    if config.storage.record {
        factory = factory.with_preaction(Arc::new(
            Recording::new(files, base.join("recordings")).with_options(config.file_options()),
        ));
    }
    TcpServer::new(factory, config.network.host.clone(), config.network.port)
}

/// Serve until Ctrl-C, then shut down within the configured timeout.
pub async fn run_server(config: &AppConfig) -> Result<()> {
    let server = Arc::new(build_server(config, FileRegistry::new()));
    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    tokio::select! {
        finished = &mut serving => return finished?,
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
    }
    server.close(config.close_timeout()).await?;
    serving.await?
}

/// Call `method` on the configured server.
///
/// Returns the decoded reply, or `None` for a notification.
pub async fn call(config: &AppConfig, method: &str, params: Value, notify: bool) -> Result<Option<Value>> {
    let requester = JsonRpcRequester::new(config.client.methods.clone())
        .with_notifications(config.client.notification_methods.clone());
    let factory_config = FactoryConfig {
        expiry: None,
        ..config.to_factory_config(PROTOCOL)
    };
    let client: TcpClient<JsonCodec> = TcpClient::new(ProtocolFactory::sender(
        factory_config,
        Arc::new(requester),
        ConnectionRegistry::new(),
    ));

    let timeout = config.client_timeout();
    let conn = client.connect(&config.client.address, timeout).await?;
    let result = if notify {
        conn.sender().notify(method, params).map(|_| None)
    } else {
        match tokio::time::timeout(timeout, conn.sender().call(method, params)).await {
            Ok(reply) => reply.map(|msg| Some(msg.into_decoded())),
            Err(_) => Err(WireError::Timeout(timeout)),
        }
    };

    client.close(config.close_timeout()).await?;
    result
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn local_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.network.host = "127.0.0.1".into();
        cfg.network.port = 0;
        cfg.connections.close_timeout_secs = 2;
        cfg
    }

    async fn start(cfg: &AppConfig, files: Arc<FileRegistry>) -> (Arc<TcpServer<JsonCodec>>, String) {
        let server = Arc::new(build_server(cfg, files));
        tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });
        let addr = server.wait_started().await.unwrap();
        (server, addr.to_string())
    }

    #[tokio::test]
    async fn call_echo_server() {
        let mut cfg = local_config();
        let (server, addr) = start(&cfg, FileRegistry::new()).await;
        cfg.client.address = addr;

        let reply = call(&cfg, "echo", json!({"x": 1}), false).await.unwrap().unwrap();
        assert_eq!(reply["result"], json!({"x": 1}));

        assert!(call(&cfg, "log", json!("hi"), true).await.unwrap().is_none());
        assert!(matches!(
            call(&cfg, "nope", Value::Null, false).await,
            Err(WireError::MethodNotFound(_))
        ));

        server.close(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn store_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config();
        cfg.storage.base_path = dir.path().to_path_buf();
        cfg.storage.store_messages = true;
        cfg.storage.record = true;

        let files = FileRegistry::new();
        let (server, addr) = start(&cfg, files.clone()).await;
        cfg.client.address = addr;

        call(&cfg, "log", json!({"line": 1}), true).await.unwrap();
        // The connection is gone once the client has closed; wait for the
        // server side to finish with it before shutting down.
        tokio::time::timeout(
            Duration::from_secs(5),
            server.factory().registry().wait_num_connections(server.factory().id(), 0),
        )
        .await
        .unwrap();
        server.close(Duration::from_secs(2)).await.unwrap();
        assert_eq!(files.num_open(), 0);

        let stored = std::fs::read_dir(dir.path().join("messages").join(PROTOCOL))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let text = std::fs::read_to_string(stored).unwrap();
        let line: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(line["params"]["line"], 1);

        let recorded = std::fs::read_dir(dir.path().join("recordings"))
            .unwrap()
            .count();
        assert_eq!(recorded, 1);
    }
}
