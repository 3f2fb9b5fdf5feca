//! Anonymizing Mixnode - Consolidated Implementation
//!
//! High-performance mixnode implementation with:
//! - Sphinx packet processing for onion routing (fixed 1200-byte frames)
//! - VRF-seeded Poisson delays for timing analysis resistance
//! - Stake- and reputation-weighted relay lottery with verifiable draws
//! - Memory-pooled batch processing pipeline (25k pps target)
//! - Epoch-scoped replay protection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    Mixnode                      │
//! ├─────────────────────────────────────────────────┤
//! │                                                 │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │  │   Core   │  │  Crypto  │  │   VRF    │     │
//! │  ├──────────┤  ├──────────┤  ├──────────┤     │
//! │  │ Mixnode  │  │  Sphinx  │  │  Delay   │     │
//! │  │  Config  │  │  Replay  │  │ Lottery  │     │
//! │  │  Relays  │  └──────────┘  └──────────┘     │
//! │  └──────────┘                                  │
//! │                                                 │
//! │  ┌─────────────────────────────────────┐       │
//! │  │    High-Performance Pipeline        │       │
//! │  │  - Batch dequeue (256 packets)      │       │
//! │  │  - Buffer pool (1024 frames)        │       │
//! │  │  - Delay scheduler + rate limiting  │       │
//! │  └─────────────────────────────────────┘       │
//! │                                                 │
//! │  ┌──────────────────────────────────┐          │
//! │  │         Transport                │          │
//! │  │  - TCP ingress/egress            │          │
//! │  │  - Admin control socket          │          │
//! │  └──────────────────────────────────┘          │
//! └─────────────────────────────────────────────────┘
//! ```

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Core modules
pub mod core {
    pub mod config;
    pub mod keystore;
    pub mod metrics;
    pub mod mixnode;
    pub mod protocol_version;
    pub mod relay_lottery;
    pub mod relay_table;
}

// Cryptographic modules
#[allow(clippy::module_inception)]
pub mod crypto {
    pub mod crypto;
    pub mod replay;
    pub mod sphinx;
}

// VRF modules
pub mod vrf {
    pub mod poisson_delay;
    pub mod vrf_delay;
}

// Utility modules
pub mod utils {
    pub mod delay;
    pub mod packet;
    pub mod rate;
}

// Cover traffic generation (optional feature)
#[cfg(feature = "cover-traffic")]
pub mod cover;

// High-performance pipeline (primary implementation)
pub mod pipeline;

// Network transport and admin surface
pub mod server {
    pub mod admin;
    pub mod tcp;
}

// Re-exports for convenience
pub use crate::core::config::MixnodeConfig;
pub use crate::core::mixnode::Mixnode;
pub use crate::crypto::sphinx::{SphinxHeader, SphinxPacket, SphinxProcessor};
pub use crate::pipeline::PacketPipeline;
pub use crate::utils::packet::Packet;

/// Fixed Sphinx frame size: every packet at every hop is exactly this long.
pub const PACKET_SIZE: usize = 1200;

/// Mixnode errors
#[derive(Debug, Error)]
pub enum MixnodeError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Packet processing error
    #[error("Packet error: {0}")]
    Packet(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// VRF error
    #[error("VRF error: {0}")]
    Vrf(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Key store error
    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    /// Relay table is empty
    #[error("no relays available")]
    NoRelays,

    /// Could not assemble a path of distinct relays
    #[error("insufficient distinct relays for requested path")]
    InsufficientRelays,
}

/// Result type for mixnode operations
pub type Result<T> = std::result::Result<T, MixnodeError>;

/// Reason a packet was dropped. Every inbound packet either forwards,
/// delivers, or drops with exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Replay tag already seen in the active epoch
    Replay,
    /// Header MAC verification failed
    BadMac,
    /// Key derivation, parse, or decryption failure
    CryptoFailure,
    /// Version byte outside the supported window
    UnsupportedVersion,
    /// Buffer pool exhausted past the acquire timeout
    PoolExhausted,
    /// Ingress queue at capacity
    QueueFull,
    /// Rate limiter exhausted past the egress timeout
    RateLimited,
    /// Dropped during cooperative shutdown
    Shutdown,
}

impl DropReason {
    /// Stable label used for counters and admin output.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DropReason::Replay => "replay",
            DropReason::BadMac => "bad_mac",
            DropReason::CryptoFailure => "crypto_failure",
            DropReason::UnsupportedVersion => "unsupported_version",
            DropReason::PoolExhausted => "pool_exhausted",
            DropReason::QueueFull => "queue_full",
            DropReason::RateLimited => "rate_limited",
            DropReason::Shutdown => "shutdown",
        }
    }

    /// All reasons, in counter-index order.
    pub const ALL: [DropReason; 8] = [
        DropReason::Replay,
        DropReason::BadMac,
        DropReason::CryptoFailure,
        DropReason::UnsupportedVersion,
        DropReason::PoolExhausted,
        DropReason::QueueFull,
        DropReason::RateLimited,
        DropReason::Shutdown,
    ];

    pub(crate) const fn index(&self) -> usize {
        match self {
            DropReason::Replay => 0,
            DropReason::BadMac => 1,
            DropReason::CryptoFailure => 2,
            DropReason::UnsupportedVersion => 3,
            DropReason::PoolExhausted => 4,
            DropReason::QueueFull => 5,
            DropReason::RateLimited => 6,
            DropReason::Shutdown => 7,
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mixnode trait for different implementations
#[async_trait::async_trait]
pub trait MixnodeTrait: Send + Sync {
    /// Start the mixnode
    async fn start(&self) -> Result<()>;

    /// Stop the mixnode
    async fn stop(&self) -> Result<()>;

    /// Inject a raw packet as if it arrived on the transport
    async fn process_packet(&self, packet: &[u8]) -> Result<()>;

    /// Get node metrics handle
    fn metrics(&self) -> Arc<crate::core::metrics::MixnodeMetrics>;

    /// Get node address
    fn address(&self) -> SocketAddr;
}

#[cfg(test)]
mod tests;
