//! Relay table and reputation tracking
//!
//! Read-mostly registry of known relays. Mutations (registration,
//! reputation updates, eviction) rebuild an immutable weighted snapshot and
//! swap it in atomically, so the lottery and any concurrent reader always
//! see a consistent relay set without holding locks across a draw.
//!
//! Weight = 0.5 * reputation + 0.3 * performance + 0.2 * stake_share. The
//! stake share is relative to total stake: minting zero-stake identities
//! raises the denominator without raising the minter's own share.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::crypto::{ed25519_sign, ed25519_verify};
use crate::{MixnodeError, Result};

/// Relay identifier: the relay's Ed25519 public key.
pub type RelayId = [u8; 32];

/// Reputation learning rate for observed forward outcomes.
const REPUTATION_ALPHA: f32 = 0.1;
/// Multiplicative reputation decay applied once per epoch.
const REPUTATION_DECAY: f32 = 0.99;
/// Fixed-point scale for integer weight accumulation.
const WEIGHT_SCALE: f64 = 1e9;

/// Public metadata describing one relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Ed25519 public key
    pub id: RelayId,
    /// Transport address (IPv4 carried as a v6-mapped address on the wire)
    pub address: SocketAddr,
    /// Economic commitment
    pub stake: u64,
    /// Trust score in [0,1]
    pub reputation: f32,
    /// Latency/bandwidth score in [0,1]
    pub performance: f32,
    /// Seconds since UNIX epoch
    pub last_seen: u64,
}

impl RelayDescriptor {
    /// Signed fields of the wire form.
    pub const UNSIGNED_LEN: usize = 32 + 16 + 2 + 8 + 4 + 4 + 8;
    /// Full wire length including the Ed25519 signature.
    pub const WIRE_LEN: usize = Self::UNSIGNED_LEN + 64;

    pub fn new(id: RelayId, address: SocketAddr, stake: u64) -> Self {
        Self {
            id,
            address,
            stake,
            reputation: 0.5,
            performance: 0.5,
            last_seen: unix_now(),
        }
    }

    fn encode_unsigned(&self) -> [u8; Self::UNSIGNED_LEN] {
        let mut out = [0u8; Self::UNSIGNED_LEN];
        out[..32].copy_from_slice(&self.id);
        let (ip, port) = match self.address {
            SocketAddr::V4(a) => (a.ip().to_ipv6_mapped(), a.port()),
            SocketAddr::V6(a) => (*a.ip(), a.port()),
        };
        out[32..48].copy_from_slice(&ip.octets());
        out[48..50].copy_from_slice(&port.to_be_bytes());
        out[50..58].copy_from_slice(&self.stake.to_be_bytes());
        out[58..62].copy_from_slice(&self.reputation.to_be_bytes());
        out[62..66].copy_from_slice(&self.performance.to_be_bytes());
        out[66..74].copy_from_slice(&self.last_seen.to_be_bytes());
        out
    }

    /// Serialize and sign for exchange with directory collaborators.
    pub fn to_signed_bytes(&self, key: &SigningKey) -> [u8; Self::WIRE_LEN] {
        let unsigned = self.encode_unsigned();
        let sig = ed25519_sign(key, &unsigned);
        let mut out = [0u8; Self::WIRE_LEN];
        out[..Self::UNSIGNED_LEN].copy_from_slice(&unsigned);
        out[Self::UNSIGNED_LEN..].copy_from_slice(&sig);
        out
    }

    /// Parse and verify a signed descriptor; the signature must check out
    /// against the embedded id.
    pub fn from_signed_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != Self::WIRE_LEN {
            return Err(MixnodeError::Packet(format!(
                "descriptor must be {} bytes, got {}",
                Self::WIRE_LEN,
                data.len()
            )));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&data[..32]);
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&data[Self::UNSIGNED_LEN..]);
        ed25519_verify(&id, &data[..Self::UNSIGNED_LEN], &sig)
            .map_err(|_| MixnodeError::Crypto("bad descriptor signature".to_string()))?;

        let mut ip = [0u8; 16];
        ip.copy_from_slice(&data[32..48]);
        let v6 = Ipv6Addr::from(ip);
        let port = u16::from_be_bytes([data[48], data[49]]);
        let address = match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
            None => SocketAddr::V6(SocketAddrV6::new(v6, port, 0, 0)),
        };

        Ok(Self {
            id,
            address,
            stake: u64::from_be_bytes(data[50..58].try_into().unwrap()),
            reputation: f32::from_be_bytes(data[58..62].try_into().unwrap()).clamp(0.0, 1.0),
            performance: f32::from_be_bytes(data[62..66].try_into().unwrap()).clamp(0.0, 1.0),
            last_seen: u64::from_be_bytes(data[66..74].try_into().unwrap()),
        })
    }
}

/// One relay inside a published snapshot, with its resolved weight.
#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub descriptor: RelayDescriptor,
    /// Combined weight in [0,1]
    pub weight: f64,
    /// Fixed-point weight used for integer draws
    pub scaled_weight: u64,
}

/// Immutable weighted view of the relay set. Relays are ordered by
/// ascending id, which also settles draws between equal weights
/// deterministically.
pub struct RelaySnapshot {
    relays: Vec<RelayEntry>,
    cumulative: Vec<u128>,
    total_weight: u128,
}

impl RelaySnapshot {
    fn build(descriptors: Vec<RelayDescriptor>) -> Self {
        let total_stake: u64 = descriptors.iter().map(|d| d.stake).sum();
        let mut relays: Vec<RelayEntry> = descriptors
            .into_iter()
            .map(|descriptor| {
                let stake_share = if total_stake == 0 {
                    0.0
                } else {
                    descriptor.stake as f64 / total_stake as f64
                };
                let weight = 0.5 * descriptor.reputation as f64
                    + 0.3 * descriptor.performance as f64
                    + 0.2 * stake_share;
                // Floor of one keeps every live relay drawable and the
                // total strictly positive.
                let scaled_weight = ((weight * WEIGHT_SCALE) as u64).max(1);
                RelayEntry {
                    descriptor,
                    weight,
                    scaled_weight,
                }
            })
            .collect();
        relays.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));

        let mut cumulative = Vec::with_capacity(relays.len());
        let mut total_weight: u128 = 0;
        for entry in &relays {
            total_weight += entry.scaled_weight as u128;
            cumulative.push(total_weight);
        }
        Self {
            relays,
            cumulative,
            total_weight,
        }
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn relays(&self) -> &[RelayEntry] {
        &self.relays
    }

    pub fn get(&self, id: &RelayId) -> Option<&RelayEntry> {
        self.relays
            .binary_search_by(|e| e.descriptor.id.cmp(id))
            .ok()
            .map(|i| &self.relays[i])
    }

    pub fn total_weight(&self) -> u128 {
        self.total_weight
    }

    /// Map 64 bits of randomness onto a relay by cumulative-weight binary
    /// search. Deterministic: verifiers replay the same draw.
    pub fn draw(&self, randomness: u64) -> Option<&RelayEntry> {
        if self.total_weight == 0 {
            return None;
        }
        let point = randomness as u128 % self.total_weight;
        let idx = self.cumulative.partition_point(|&c| c <= point);
        self.relays.get(idx)
    }
}

/// Mutable relay registry publishing immutable snapshots.
pub struct RelayTable {
    entries: RwLock<HashMap<RelayId, RelayDescriptor>>,
    snapshot: RwLock<Arc<RelaySnapshot>>,
    idle_timeout_secs: std::sync::atomic::AtomicU64,
}

impl RelayTable {
    pub fn new(idle_timeout_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(RelaySnapshot::build(Vec::new()))),
            idle_timeout_secs: std::sync::atomic::AtomicU64::new(idle_timeout_secs),
        }
    }

    /// Current immutable view; cheap Arc clone.
    pub fn snapshot(&self) -> Arc<RelaySnapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("relay lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_idle_timeout(&self, secs: u64) {
        self.idle_timeout_secs
            .store(secs, std::sync::atomic::Ordering::Relaxed);
    }

    /// Register or refresh a relay.
    pub fn upsert(&self, mut descriptor: RelayDescriptor) {
        descriptor.reputation = descriptor.reputation.clamp(0.0, 1.0);
        descriptor.performance = descriptor.performance.clamp(0.0, 1.0);
        {
            let mut entries = self.entries.write().expect("relay lock poisoned");
            entries.insert(descriptor.id, descriptor);
        }
        self.rebuild();
    }

    pub fn remove(&self, id: &RelayId) {
        let removed = {
            let mut entries = self.entries.write().expect("relay lock poisoned");
            entries.remove(id).is_some()
        };
        if removed {
            self.rebuild();
        }
    }

    pub fn get(&self, id: &RelayId) -> Option<RelayDescriptor> {
        self.entries
            .read()
            .expect("relay lock poisoned")
            .get(id)
            .cloned()
    }

    /// Apply an observed forward outcome through the given relay:
    /// `rep += alpha * (1 - rep)` on success, `rep *= (1 - alpha)` on
    /// failure.
    pub fn record_forward(&self, id: &RelayId, success: bool) {
        let mut touched = false;
        {
            let mut entries = self.entries.write().expect("relay lock poisoned");
            if let Some(entry) = entries.get_mut(id) {
                if success {
                    entry.reputation += REPUTATION_ALPHA * (1.0 - entry.reputation);
                } else {
                    entry.reputation *= 1.0 - REPUTATION_ALPHA;
                }
                entry.reputation = entry.reputation.clamp(0.0, 1.0);
                entry.last_seen = unix_now();
                touched = true;
            }
        }
        if touched {
            self.rebuild();
        }
    }

    /// Refresh a relay's performance score from the metrics subsystem.
    pub fn set_performance(&self, id: &RelayId, performance: f32) {
        let mut touched = false;
        {
            let mut entries = self.entries.write().expect("relay lock poisoned");
            if let Some(entry) = entries.get_mut(id) {
                entry.performance = performance.clamp(0.0, 1.0);
                touched = true;
            }
        }
        if touched {
            self.rebuild();
        }
    }

    /// Epoch maintenance: decay every reputation 1% and evict relays idle
    /// past the timeout.
    pub fn epoch_tick(&self) {
        let idle = self
            .idle_timeout_secs
            .load(std::sync::atomic::Ordering::Relaxed);
        let now = unix_now();
        {
            let mut entries = self.entries.write().expect("relay lock poisoned");
            entries.retain(|id, entry| {
                let keep = now.saturating_sub(entry.last_seen) <= idle;
                if !keep {
                    debug!("evicting idle relay {}", hex::encode(&id[..8]));
                }
                keep
            });
            for entry in entries.values_mut() {
                entry.reputation = (entry.reputation * REPUTATION_DECAY).clamp(0.0, 1.0);
            }
        }
        self.rebuild();
    }

    fn rebuild(&self) {
        let descriptors: Vec<RelayDescriptor> = {
            let entries = self.entries.read().expect("relay lock poisoned");
            entries.values().cloned().collect()
        };
        let next = Arc::new(RelaySnapshot::build(descriptors));
        *self.snapshot.write().expect("snapshot lock poisoned") = next;
    }

    /// Persist the table for warm starts. Corruption on load is not fatal:
    /// the node simply cold-starts empty.
    pub fn save(&self, path: &Path) -> Result<()> {
        let descriptors: Vec<RelayDescriptor> = {
            let entries = self.entries.read().expect("relay lock poisoned");
            entries.values().cloned().collect()
        };
        let bytes = bincode::serialize(&descriptors)
            .map_err(|e| MixnodeError::Config(format!("relay snapshot encode: {e}")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) {
        let descriptors: Vec<RelayDescriptor> = match std::fs::read(path) {
            Ok(bytes) => match bincode::deserialize(&bytes) {
                Ok(d) => d,
                Err(e) => {
                    warn!("corrupt relay snapshot, cold starting: {e}");
                    return;
                }
            },
            Err(_) => return,
        };
        {
            let mut entries = self.entries.write().expect("relay lock poisoned");
            for descriptor in descriptors {
                entries.insert(descriptor.id, descriptor);
            }
        }
        self.rebuild();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
