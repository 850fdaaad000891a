//! Configuration for the wirehub server and client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wirehub_core::{ExpiryConfig, FactoryConfig, FileOptions, WriteMode};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    /// Connection lifetime settings.
    pub connections: ConnectionConfig,
    /// Message storage and traffic recording.
    pub storage: StorageConfig,
    /// Settings for the `call` subcommand.
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on.
    pub host: String,
    /// TCP port to listen on (0 picks a free one).
    pub port: u16,
    /// Read buffer size per connection, in bytes.
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Close connections idle for this long. 0 disables expiry.
    pub expire_after_secs: u64,
    /// How often idle connections are looked for.
    pub check_interval_secs: u64,
    /// Upper bound for each shutdown step.
    pub close_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for stored messages and recordings.
    pub base_path: PathBuf,
    /// Close output files after this many idle seconds.
    pub file_timeout_secs: u64,
    /// Record raw traffic per peer.
    pub record: bool,
    /// Store received messages instead of echoing them.
    pub store_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to call, as `host:port`.
    pub address: String,
    pub timeout_ms: u64,
    /// Methods that expect a reply.
    pub methods: Vec<String>,
    /// Methods sent as notifications.
    pub notification_methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8888,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            expire_after_secs: 300,
            check_interval_secs: 30,
            close_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
            file_timeout_secs: 5,
            record: false,
            store_messages: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8888".into(),
            timeout_ms: 5000,
            methods: vec!["echo".into()],
            notification_methods: vec!["log".into()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.connections.close_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client.timeout_ms)
    }

    /// Inactivity sweep settings, or `None` when expiry is disabled.
    pub fn expiry(&self) -> Option<ExpiryConfig> {
        (self.connections.expire_after_secs > 0).then(|| ExpiryConfig {
            expire_after: Duration::from_secs(self.connections.expire_after_secs),
            check_interval: Duration::from_secs(self.connections.check_interval_secs.max(1)),
        })
    }

    pub fn to_factory_config(&self, name: &str) -> FactoryConfig {
        FactoryConfig {
            name: name.to_string(),
            expiry: self.expiry(),
            close_timeout: self.close_timeout(),
            read_buffer_size: self.network.read_buffer_size.max(512),
        }
    }

    pub fn file_options(&self) -> FileOptions {
        FileOptions {
            mode: WriteMode::Append,
            inactivity_timeout: Duration::from_secs(self.storage.file_timeout_secs.max(1)),
            close_timeout: self.close_timeout(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
