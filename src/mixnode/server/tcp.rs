//! TCP transport for the mixnode
//!
//! Ingress acceptor feeding the pipeline and an egress forwarder draining
//! the dispatcher's output. Frames are length-prefixed (4-byte big-endian)
//! and must carry exactly one 1200-byte Sphinx packet. Connections open
//! with a version-advertisement handshake; the per-packet version byte
//! remains authoritative inside the pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::MixnodeConfig;
use crate::core::protocol_version::{
    negotiate_version, NegotiationResult, ProtocolAdvertisement, ProtocolVersion,
};
use crate::pipeline::{EgressPacket, PacketPipeline};
use crate::utils::packet::Packet;
use crate::{MixnodeError, Result, PACKET_SIZE};

/// Egress retry schedule: exponential backoff, then the packet drops.
const EGRESS_RETRIES: u32 = 3;
const EGRESS_BACKOFF_BASE: Duration = Duration::from_millis(20);

/// TCP server handling mixnode ingress.
pub struct TcpServer {
    config: MixnodeConfig,
    pipeline: Arc<PacketPipeline>,
    shutdown_tx: broadcast::Sender<()>,
    protocol_version: ProtocolVersion,
    node_id: String,
}

impl TcpServer {
    pub fn new(config: MixnodeConfig, pipeline: Arc<PacketPipeline>) -> Self {
        let node_id = format!("node-{}", uuid::Uuid::new_v4());
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            pipeline,
            shutdown_tx,
            protocol_version: ProtocolVersion::CURRENT,
            node_id,
        }
    }

    /// Handle that stops the accept loop from outside `run`.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the listen address. Failures here are node-fatal and surface
    /// before any background task is spawned.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr).await.map_err(|e| {
            MixnodeError::Network(format!("bind {}: {e}", self.config.listen_addr))
        })
    }

    /// Bind and run the accept loop until stopped.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self.bind().await?;
        self.run_on(listener).await
    }

    /// Run the accept loop on an already bound listener.
    pub async fn run_on(&mut self, listener: TcpListener) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        info!("TCP server listening on {}", self.config.listen_addr);

        let mut shutdown_rx_main = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let pipeline = self.pipeline.clone();
                            let timeout = self.config.connection_timeout();
                            let shutdown_rx = shutdown_tx.subscribe();
                            let version = self.protocol_version;
                            let node_id = self.node_id.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    peer_addr,
                                    pipeline,
                                    timeout,
                                    shutdown_rx,
                                    version,
                                    node_id,
                                )
                                .await
                                {
                                    debug!("connection {} closed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx_main.recv() => {
                    info!("TCP server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    pipeline: Arc<PacketPipeline>,
    connection_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    version: ProtocolVersion,
    node_id: String,
) -> Result<()> {
    let negotiated = version_handshake(&mut stream, version, node_id).await?;
    debug!("negotiated {} with {}", negotiated, peer_addr);

    let mut buffer = BytesMut::with_capacity(4 * PACKET_SIZE);
    loop {
        tokio::select! {
            result = tokio::time::timeout(connection_timeout, stream.read_buf(&mut buffer)) => {
                match result {
                    Ok(Ok(0)) => {
                        debug!("connection closed by peer {}", peer_addr);
                        break;
                    }
                    Ok(Ok(_)) => {
                        while let Some(packet) = Packet::decode_stream(&mut buffer)? {
                            if packet.data.len() != PACKET_SIZE {
                                debug!(
                                    "discarding {}-byte frame from {}",
                                    packet.data.len(),
                                    peer_addr
                                );
                                continue;
                            }
                            pipeline.submit_packet(&packet.data).await?;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("read error from {}: {}", peer_addr, e);
                        break;
                    }
                    Err(_) => {
                        debug!("connection timeout for {}", peer_addr);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("shutdown signal received for connection {}", peer_addr);
                break;
            }
        }
    }
    Ok(())
}

/// Symmetric version handshake: both sides send an advertisement, read the
/// peer's, then exchange the negotiated wire byte for confirmation.
async fn version_handshake(
    stream: &mut TcpStream,
    our_version: ProtocolVersion,
    node_id: String,
) -> Result<ProtocolVersion> {
    let our_ad = ProtocolAdvertisement::new(our_version, node_id);
    let our_ad_bytes = our_ad
        .encode()
        .map_err(|e| MixnodeError::Protocol(format!("encode advertisement: {e}")))?;

    let framed = Packet::new(Bytes::from(our_ad_bytes)).encode()?;
    stream.write_all(&framed).await?;
    stream.flush().await?;

    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf).await?;
    let ad_length = u32::from_be_bytes(length_buf) as usize;
    if ad_length > 4096 {
        return Err(MixnodeError::Protocol("advertisement too large".to_string()));
    }
    let mut ad_buf = vec![0u8; ad_length];
    stream.read_exact(&mut ad_buf).await?;
    let their_ad = ProtocolAdvertisement::decode(&ad_buf)
        .map_err(|e| MixnodeError::Protocol(format!("decode peer advertisement: {e}")))?;

    let negotiated = match negotiate_version(our_version, their_ad.version) {
        NegotiationResult::Compatible(version) => version,
        NegotiationResult::Incompatible {
            our_version,
            their_version,
        } => {
            return Err(MixnodeError::Protocol(format!(
                "incompatible protocol versions: ours={}, theirs={}",
                our_version, their_version
            )))
        }
    };

    stream.write_all(&[negotiated.encode_byte()]).await?;
    stream.flush().await?;

    let mut confirm_buf = [0u8; 1];
    stream.read_exact(&mut confirm_buf).await?;
    let their_negotiated = ProtocolVersion::decode_byte(confirm_buf[0]).ok_or_else(|| {
        MixnodeError::Protocol(format!("invalid version byte: 0x{:02x}", confirm_buf[0]))
    })?;

    if (their_negotiated.major, their_negotiated.minor) != (negotiated.major, negotiated.minor) {
        return Err(MixnodeError::Protocol(format!(
            "version negotiation mismatch: we agreed on {}, they agreed on {}",
            negotiated, their_negotiated
        )));
    }
    Ok(negotiated)
}

/// TCP client for sending frames to a peer mixnode.
pub struct TcpClient {
    next_hop: SocketAddr,
    version: ProtocolVersion,
    node_id: String,
}

impl TcpClient {
    pub fn new(next_hop: SocketAddr) -> Self {
        Self {
            next_hop,
            version: ProtocolVersion::CURRENT,
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Open a connection and complete the handshake.
    pub async fn connect(&self) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.next_hop)
            .await
            .map_err(|e| MixnodeError::Network(format!("connect {}: {e}", self.next_hop)))?;
        version_handshake(&mut stream, self.version, self.node_id.clone()).await?;
        Ok(stream)
    }

    /// One-shot send over a fresh connection.
    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let mut stream = self.connect().await?;
        send_frame(&mut stream, packet).await
    }
}

async fn send_frame(stream: &mut TcpStream, packet: &[u8]) -> Result<()> {
    let framed = Packet::new(Bytes::copy_from_slice(packet)).encode()?;
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

/// Spawn the egress forwarder: drains scheduler releases and writes them
/// to their next hops, caching one connection per peer. Transient write
/// failures retry with exponential backoff up to three attempts, then the
/// packet is dropped (its frame returns to the pool on drop).
pub fn spawn_egress_forwarder(
    mut egress: mpsc::Receiver<EgressPacket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connections: HashMap<SocketAddr, TcpStream> = HashMap::new();
        while let Some(packet) = egress.recv().await {
            forward_with_retry(&mut connections, &packet).await;
            // `packet` drops here; the frame returns to the pool whether
            // or not the write succeeded.
        }
        debug!("egress forwarder stopped");
    })
}

async fn forward_with_retry(
    connections: &mut HashMap<SocketAddr, TcpStream>,
    packet: &EgressPacket,
) {
    for attempt in 0..EGRESS_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(EGRESS_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
        }

        if !connections.contains_key(&packet.next_hop) {
            let client = TcpClient::new(packet.next_hop);
            match client.connect().await {
                Ok(stream) => {
                    connections.insert(packet.next_hop, stream);
                }
                Err(e) => {
                    debug!("connect {} failed (attempt {}): {}", packet.next_hop, attempt + 1, e);
                    continue;
                }
            }
        }

        let stream = connections
            .get_mut(&packet.next_hop)
            .expect("connection just ensured");
        match send_frame(stream, &packet.frame[..]).await {
            Ok(()) => return,
            Err(e) => {
                debug!("send to {} failed (attempt {}): {}", packet.next_hop, attempt + 1, e);
                connections.remove(&packet.next_hop);
            }
        }
    }
    warn!(
        "dropping packet for {} after {} egress attempts",
        packet.next_hop, EGRESS_RETRIES
    );
}
