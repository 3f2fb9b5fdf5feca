//! Cover traffic generation
//!
//! Injects synthetic Sphinx packets into the node's own ingress queue at a
//! configured rate with Poisson spacing, hiding real traffic volume
//! variations from link observers. Cover packets are real packets: they go
//! through the same pool, queue, delay and rate-limiter discipline as
//! everything else. With no configured routes they are addressed to the
//! node itself and terminate as local deliveries.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::metrics::MixnodeMetrics;
use crate::core::protocol_version::ProtocolVersion;
use crate::crypto::sphinx::{build_packet, PathHop, PAYLOAD_SIZE};
use crate::pipeline::PacketPipeline;
use crate::vrf::poisson_delay::PoissonDelayGenerator;
use crate::{MixnodeError, Result};

/// Marker prefix in cover packet local ids, so deliveries can be filtered.
const COVER_ID_PREFIX: &[u8; 4] = b"cvr:";

/// A peer the generator may route cover packets through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverRoute {
    /// The peer's epoch Sphinx public key
    pub sphinx_key: [u8; 32],
    /// Where the packet is sent for that hop
    pub address: SocketAddr,
}

/// Cover traffic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverTrafficConfig {
    /// Enable the generator
    pub enabled: bool,
    /// Mean synthetic packets per second
    pub rate_pps: f64,
    /// Candidate first hops; empty means self-addressed cover
    pub routes: Vec<CoverRoute>,
}

impl Default for CoverTrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_pps: 10.0,
            routes: Vec::new(),
        }
    }
}

/// Generator task handle.
pub struct CoverTrafficGenerator {
    config: CoverTrafficConfig,
    pipeline: Arc<PacketPipeline>,
    metrics: Arc<MixnodeMetrics>,
    /// The node's own key and address, the fallback route
    self_key: [u8; 32],
    self_addr: SocketAddr,
}

impl CoverTrafficGenerator {
    pub fn new(
        config: CoverTrafficConfig,
        pipeline: Arc<PacketPipeline>,
        metrics: Arc<MixnodeMetrics>,
        self_key: [u8; 32],
        self_addr: SocketAddr,
    ) -> Result<Self> {
        if config.enabled && config.rate_pps <= 0.0 {
            return Err(MixnodeError::Config(
                "cover traffic rate must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            pipeline,
            metrics,
            self_key,
            self_addr,
        })
    }

    /// Spawn the emission loop; resolves to a no-op handle when disabled.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                return;
            }
            // Poisson spacing with mean 1/rate, clamped to sane bounds.
            let mean_ms = (1000.0 / self.config.rate_pps).max(1.0) as u64;
            let spacing = match PoissonDelayGenerator::new(
                std::time::Duration::from_millis(mean_ms),
                std::time::Duration::from_millis(1),
                std::time::Duration::from_millis(mean_ms * 10),
            ) {
                Ok(generator) => generator,
                Err(e) => {
                    warn!("cover traffic disabled: {e}");
                    return;
                }
            };
            info!(rate = self.config.rate_pps, "cover traffic started");

            loop {
                let wait = spacing.next_delay_os();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = self.emit_one().await {
                            debug!("cover emission failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cover traffic stopped");
        })
    }

    async fn emit_one(&self) -> Result<()> {
        let mut rng = rand::rngs::OsRng;

        let hop = if self.config.routes.is_empty() {
            PathHop {
                public_key: self.self_key,
                address: self.self_addr,
                delay_hint_ms: 0,
            }
        } else {
            let pick = rng.next_u32() as usize % self.config.routes.len();
            let route = &self.config.routes[pick];
            PathHop {
                public_key: route.sphinx_key,
                address: route.address,
                delay_hint_ms: 0,
            }
        };

        let mut local_id = [0u8; 16];
        rng.fill_bytes(&mut local_id);
        local_id[..COVER_ID_PREFIX.len()].copy_from_slice(COVER_ID_PREFIX);

        // Random payload: indistinguishable from real ciphertext on the
        // wire.
        let mut payload = [0u8; PAYLOAD_SIZE];
        rng.fill_bytes(&mut payload);

        let packet = build_packet(ProtocolVersion::CURRENT, &[hop], local_id, &payload)?;
        self.pipeline.submit_packet(&packet.to_bytes()).await?;
        self.metrics.record_cover_sent();
        Ok(())
    }
}

/// Whether a delivered local id marks a cover packet.
pub fn is_cover_delivery(local_id: &[u8; 16]) -> bool {
    &local_id[..COVER_ID_PREFIX.len()] == COVER_ID_PREFIX
}
