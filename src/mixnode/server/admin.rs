//! Admin control channel
//!
//! Local lifecycle and observability surface over a UNIX domain socket
//! speaking line-delimited JSON. One request object per line, one response
//! object per line. Commands: start, stop, reload, rotate_keys,
//! get_metrics, get_relay_table.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::MixnodeConfig;
use crate::core::metrics::MetricsSnapshot;
use crate::core::mixnode::Mixnode;
use crate::core::relay_table::RelayDescriptor;
use crate::{MixnodeTrait, Result};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum AdminRequest {
    Start,
    Stop,
    Reload { config: MixnodeConfig },
    RotateKeys,
    GetMetrics,
    GetRelayTable,
}

#[derive(Debug, Serialize)]
struct AdminResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<MetricsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    relays: Option<Vec<RelayDescriptor>>,
}

impl AdminResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            metrics: None,
            relays: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            ok: false,
            error: Some(message),
            metrics: None,
            relays: None,
        }
    }
}

/// Bind the admin socket and serve until the node stops. A stale socket
/// file from a previous run is removed first.
pub fn spawn_admin(node: Arc<Mixnode>, path: PathBuf) -> Result<JoinHandle<()>> {
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    let listener = UnixListener::bind(&path)?;
    info!("admin socket listening on {}", path.display());

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let node = node.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(node, stream).await {
                                    debug!("admin connection closed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("admin accept failed: {e}");
                        }
                    }
                }
                _ = node.stopped() => {
                    let _ = std::fs::remove_file(&path);
                    break;
                }
            }
        }
    }))
}

async fn handle_connection(node: Arc<Mixnode>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AdminRequest>(&line) {
            Ok(request) => dispatch(&node, request).await,
            Err(e) => AdminResponse::err(format!("bad request: {e}")),
        };
        let mut encoded = serde_json::to_vec(&response)
            .unwrap_or_else(|_| br#"{"ok":false,"error":"encode failure"}"#.to_vec());
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn dispatch(node: &Arc<Mixnode>, request: AdminRequest) -> AdminResponse {
    match request {
        AdminRequest::Start => match node.start().await {
            Ok(()) => AdminResponse::ok(),
            Err(e) => AdminResponse::err(e.to_string()),
        },
        AdminRequest::Stop => match node.stop().await {
            Ok(()) => AdminResponse::ok(),
            Err(e) => AdminResponse::err(e.to_string()),
        },
        AdminRequest::Reload { config } => match node.reload(config) {
            Ok(()) => AdminResponse::ok(),
            Err(e) => AdminResponse::err(e.to_string()),
        },
        AdminRequest::RotateKeys => match node.rotate_keys() {
            Ok(()) => AdminResponse::ok(),
            Err(e) => AdminResponse::err(e.to_string()),
        },
        AdminRequest::GetMetrics => AdminResponse {
            metrics: Some(node.metrics_snapshot()),
            ..AdminResponse::ok()
        },
        AdminRequest::GetRelayTable => AdminResponse {
            relays: Some(node.relay_descriptors()),
            ..AdminResponse::ok()
        },
    }
}
