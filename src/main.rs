//! Elohim Link CLI
//!
//! Connects to a node and logs operation progress as it arrives.
//!
//! ## Usage
//!
//! ```bash
//! # Watch backup and restore on the default endpoint
//! elohim-link
//!
//! # Custom endpoint with a session cookie
//! elohim-link --endpoint wss://node.example/events --session-cookie "sid=abc"
//!
//! # Track an extra operation and exit once anything finishes
//! elohim-link --operation migrate:schema:data --exit-on-complete
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use elohim_link::{LinkClient, LinkConfig, OperationConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-link")]
#[command(about = "Live operation progress from an Elohim node")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node WebSocket endpoint
    #[arg(long, env = "ELOHIM_LINK_ENDPOINT")]
    endpoint: Option<String>,

    /// Cookie header sent on the handshake
    #[arg(long, env = "ELOHIM_LINK_SESSION_COOKIE")]
    session_cookie: Option<String>,

    /// Extra operation to track, as name:stage_a:stage_b (repeatable)
    #[arg(long = "operation", value_parser = parse_operation)]
    operations: Vec<OperationConfig>,

    /// Exit as soon as any tracked operation completes
    #[arg(long)]
    exit_on_complete: bool,
}

fn parse_operation(value: &str) -> Result<OperationConfig, String> {
    let parts: Vec<&str> = value.split(':').collect();
    match parts.as_slice() {
        [name, stage_a, stage_b] if !name.is_empty() => Ok(OperationConfig {
            name: name.to_string(),
            channel: None,
            stages: [stage_a.to_string(), stage_b.to_string()],
        }),
        _ => Err(format!("expected name:stage_a:stage_b, got {}", value)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("elohim_link=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let path = LinkConfig::config_path();
            if path.exists() {
                LinkConfig::load(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?
            } else {
                LinkConfig::default()
            }
        }
    };

    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if args.session_cookie.is_some() {
        config.session_cookie = args.session_cookie;
    }
    for operation in args.operations {
        config.operations.retain(|existing| existing.name != operation.name);
        config.operations.push(operation);
    }
    if config.operations.is_empty() {
        bail!("no operations to track");
    }

    info!(
        endpoint = %config.endpoint,
        operations = config.operations.len(),
        "Starting elohim-link"
    );

    let client = Arc::new(LinkClient::new(&config).context("building link client")?);
    let (complete_tx, mut complete_rx) = mpsc::unbounded_channel::<String>();

    for sync in client.synchronizers() {
        let name = sync.kind().name().to_string();
        let mut changes = sync.changes();
        let complete_tx = complete_tx.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(record) => {
                        info!(
                            kind = %name,
                            stage_a = record.stage_a,
                            stage_b = record.stage_b,
                            label = ?record.aux,
                            complete = record.is_complete(),
                            "Progress"
                        );
                        if record.is_complete() {
                            let _ = complete_tx.send(name.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = %name, skipped = skipped, "Progress log fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let mut connected = client.connection().watch_connected();
    tokio::spawn(async move {
        while connected.changed().await.is_ok() {
            let is_connected = *connected.borrow_and_update();
            info!(connected = is_connected, "Connection state changed");
        }
    });

    client.start();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                info!("Interrupted");
                break;
            }
            Some(kind) = complete_rx.recv() => {
                info!(kind = %kind, "Operation complete");
                if args.exit_on_complete {
                    break;
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}
