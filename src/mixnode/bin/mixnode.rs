//! Mixnode binary
//!
//! Loads the configuration (optional path argument, JSON), starts the
//! node with its admin socket, and runs until a stop command or a signal
//! arrives. Exit codes: 0 normal, 64 configuration error, 70 runtime
//! fault, 130 shutdown via signal.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mixnode::core::config::MixnodeConfig;
use mixnode::core::mixnode::spawn;
use mixnode::server::admin::spawn_admin;
use mixnode::{Mixnode, MixnodeError, MixnodeTrait};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 64;
const EXIT_RUNTIME: i32 = 70;
const EXIT_SIGNAL: i32 = 130;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            return EXIT_CONFIG;
        }
    };
    let admin_socket = config.admin_socket();

    let node = match spawn(config).await {
        Ok(node) => node,
        Err(e @ (MixnodeError::Config(_) | MixnodeError::InvalidKeyFile(_))) => {
            error!("startup failed: {e}");
            return EXIT_CONFIG;
        }
        Err(e) => {
            error!("startup failed: {e}");
            return EXIT_RUNTIME;
        }
    };

    let _admin = match spawn_admin(node.clone(), admin_socket) {
        Ok(handle) => handle,
        Err(e) => {
            error!("admin socket failed: {e}");
            let _ = node.stop().await;
            return EXIT_RUNTIME;
        }
    };

    info!(
        addr = %node.address(),
        id = %hex::encode(&node.node_id()[..8]),
        "mixnode running"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("signal received, shutting down");
            let _ = node.stop().await;
            EXIT_SIGNAL
        }
        _ = wait_stopped(node.clone()) => {
            info!("stopped via admin channel");
            EXIT_OK
        }
    }
}

async fn wait_stopped(node: Arc<Mixnode>) {
    node.stopped().await;
}

fn load_config() -> anyhow::Result<MixnodeConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let config = MixnodeConfig::load(Path::new(&path))
                .with_context(|| format!("loading {path}"))?;
            Ok(config)
        }
        None => {
            let config = MixnodeConfig::default();
            config.validate().context("default configuration")?;
            Ok(config)
        }
    }
}
