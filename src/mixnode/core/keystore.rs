//! Node key store
//!
//! Persists the node's long-lived identity (Ed25519 signing key, VRF seed)
//! and the rotating X25519 epoch secret in `keys.bin` (mode 0600). A
//! malformed file is not fatal: the node cold-starts with freshly
//! generated keys, matching the relay-table recovery story. IO failures
//! surface as `InvalidKeyFile` and abort startup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::core::relay_table::unix_now;
use crate::crypto::crypto::{x25519_base, KEY_LEN};
use crate::vrf::vrf_delay::VrfKeyPair;
use crate::{MixnodeError, Result};

const MAGIC: &[u8; 4] = b"MIXK";
const FORMAT_VERSION: u8 = 1;
/// magic + version + epoch + x25519 sk + ed25519 seed + vrf seed
const FILE_LEN: usize = 4 + 1 + 8 + KEY_LEN + 32 + 32;

/// The active key set for one epoch. Immutable once published; rotation
/// swaps the whole set.
pub struct NodeKeys {
    /// Rotating epoch secret for Sphinx ECDH
    pub x25519_sk: [u8; KEY_LEN],
    /// Matching public key, published in the relay descriptor
    pub x25519_pk: [u8; KEY_LEN],
    /// Long-lived identity/signing key
    pub ed25519: SigningKey,
    /// Long-lived VRF keypair (delays + lottery)
    pub vrf: Arc<VrfKeyPair>,
    /// Monotonic epoch counter
    pub epoch: u64,
    /// Wall-clock epoch start, seconds since UNIX epoch
    pub epoch_started: u64,
}

impl NodeKeys {
    pub fn node_id(&self) -> [u8; 32] {
        self.ed25519.verifying_key().to_bytes()
    }
}

/// On-disk backed key store with atomic in-memory swap on rotation.
pub struct KeyStore {
    path: PathBuf,
    keys: RwLock<Arc<NodeKeys>>,
    /// Retained for persistence: the expanded schnorrkel keypair cannot be
    /// reduced back to its seed.
    vrf_seed: [u8; 32],
}

impl KeyStore {
    /// Load `keys.bin`, or generate a fresh key set if the file is absent
    /// or malformed.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        let (keys, vrf_seed) = match std::fs::read(path) {
            Ok(raw) => match Self::parse(&raw) {
                Some(loaded) => {
                    info!(epoch = loaded.0.epoch, "loaded node keys");
                    loaded
                }
                None => {
                    warn!("malformed key file, generating fresh keys");
                    Self::generate(0)?
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no key file, generating fresh keys");
                Self::generate(0)?
            }
            Err(e) => {
                return Err(MixnodeError::InvalidKeyFile(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        };

        let store = Self {
            path: path.to_path_buf(),
            keys: RwLock::new(Arc::new(keys)),
            vrf_seed,
        };
        store.persist()?;
        Ok(store)
    }

    fn generate(epoch: u64) -> Result<(NodeKeys, [u8; 32])> {
        let x25519_sk = StaticSecret::random_from_rng(OsRng).to_bytes();
        let mut ed_seed = [0u8; 32];
        OsRng.fill_bytes(&mut ed_seed);
        let mut vrf_seed = [0u8; 32];
        OsRng.fill_bytes(&mut vrf_seed);
        let keys = Self::assemble(epoch, x25519_sk, ed_seed, vrf_seed)?;
        ed_seed.zeroize();
        Ok((keys, vrf_seed))
    }

    fn assemble(
        epoch: u64,
        x25519_sk: [u8; KEY_LEN],
        ed_seed: [u8; 32],
        vrf_seed: [u8; 32],
    ) -> Result<NodeKeys> {
        Ok(NodeKeys {
            x25519_pk: x25519_base(&x25519_sk),
            x25519_sk,
            ed25519: SigningKey::from_bytes(&ed_seed),
            vrf: Arc::new(VrfKeyPair::from_seed(&vrf_seed)?),
            epoch,
            epoch_started: unix_now(),
        })
    }

    fn parse(raw: &[u8]) -> Option<(NodeKeys, [u8; 32])> {
        if raw.len() != FILE_LEN || &raw[..4] != MAGIC || raw[4] != FORMAT_VERSION {
            return None;
        }
        let epoch = u64::from_be_bytes(raw[5..13].try_into().ok()?);
        let x25519_sk: [u8; KEY_LEN] = raw[13..45].try_into().ok()?;
        let ed_seed: [u8; 32] = raw[45..77].try_into().ok()?;
        let vrf_seed: [u8; 32] = raw[77..109].try_into().ok()?;
        let keys = Self::assemble(epoch, x25519_sk, ed_seed, vrf_seed).ok()?;
        Some((keys, vrf_seed))
    }

    fn persist(&self) -> Result<()> {
        let keys = self.current();
        let mut raw = Vec::with_capacity(FILE_LEN);
        raw.extend_from_slice(MAGIC);
        raw.push(FORMAT_VERSION);
        raw.extend_from_slice(&keys.epoch.to_be_bytes());
        raw.extend_from_slice(&keys.x25519_sk);
        raw.extend_from_slice(&keys.ed25519.to_bytes());
        raw.extend_from_slice(&self.vrf_seed);

        write_private(&self.path, &raw)
            .map_err(|e| MixnodeError::InvalidKeyFile(format!("{}: {e}", self.path.display())))?;
        raw.zeroize();
        Ok(())
    }

    /// Active key set.
    pub fn current(&self) -> Arc<NodeKeys> {
        self.keys.read().expect("keystore lock poisoned").clone()
    }

    /// Rotate the epoch secret: new X25519 key, same identity and VRF
    /// keys, epoch counter advanced, file rewritten.
    pub fn rotate(&self) -> Result<Arc<NodeKeys>> {
        let next = {
            let current = self.current();
            let x25519_sk = StaticSecret::random_from_rng(OsRng).to_bytes();
            NodeKeys {
                x25519_pk: x25519_base(&x25519_sk),
                x25519_sk,
                ed25519: current.ed25519.clone(),
                vrf: current.vrf.clone(),
                epoch: current.epoch + 1,
                epoch_started: unix_now(),
            }
        };
        let next = Arc::new(next);
        *self.keys.write().expect("keystore lock poisoned") = next.clone();
        self.persist()?;
        info!(epoch = next.epoch, "rotated epoch keys");
        Ok(next)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
