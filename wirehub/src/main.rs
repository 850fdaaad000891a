//! wirehub — entry point.
//!
//! ```text
//! wirehub serve                          Run the server until Ctrl-C
//! wirehub call <method> [params-json]    Call a method and print the reply
//! wirehub call <method> --notify         Send a notification
//! wirehub --config <path>                Load a custom config TOML
//! wirehub --gen-config                   Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wirehub::config::AppConfig;
use wirehub::service;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wirehub", about = "JSON-RPC server and client over TCP")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "wirehub.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve until Ctrl-C.
    Serve,
    /// Call a method on the configured server.
    Call {
        method: String,
        /// Parameters as JSON.
        params: Option<String>,
        /// Send as a notification; no reply is awaited.
        #[arg(long)]
        notify: bool,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&AppConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = AppConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("wirehub v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!("listening on {}:{}", config.network.host, config.network.port);
            if config.connections.expire_after_secs > 0 {
                info!("idle connections expire after {}s", config.connections.expire_after_secs);
            }
            service::run_server(&config).await?;
        }
        Command::Call { method, params, notify } => {
            let params: Value = match params {
                Some(text) => serde_json::from_str(&text)?,
                None => Value::Null,
            };
            match service::call(&config, &method, params, notify).await? {
                Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
                None => info!("notification sent"),
            }
        }
    }

    Ok(())
}
