//! Weighted relay selection lottery
//!
//! VRF-proved next-hop selection over the relay table's weighted snapshot.
//! The draw is fully deterministic given the VRF output and the public
//! relay set: `draw = u64(vrf_output[..8]) mod total_weight`, resolved by
//! binary search over the cumulative-weight vector. A verifier holding the
//! proof and the same snapshot reproduces the draw exactly; a mismatch
//! rejects the path.

use sha2::{Digest, Sha256};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::relay_table::{RelayId, RelaySnapshot, RelayTable};
use crate::vrf::vrf_delay::{vrf_verify, VrfKeyPair, VRF_PREOUT_LEN, VRF_PROOF_LEN};
use crate::{MixnodeError, Result};

/// Maximum accepted lottery seed length.
pub const MAX_SEED_LEN: usize = 256;
/// Duplicate-skip budget multiplier for path selection.
const PATH_ATTEMPT_FACTOR: usize = 4;

/// Evidence that a draw was made honestly from the weighted distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotteryProof {
    /// Opaque caller seed (at most 256 bytes)
    pub seed: Vec<u8>,
    /// VRF preoutput
    pub vrf_output: [u8; VRF_PREOUT_LEN],
    /// Batchable VRF proof
    #[serde(with = "serde_proof")]
    pub vrf_proof: [u8; VRF_PROOF_LEN],
    /// The relay the draw resolved to
    pub relay_id: RelayId,
}

impl LotteryProof {
    /// Wire form: seed length (u16 BE), seed, preoutput, proof, relay id.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.seed.len() + VRF_PREOUT_LEN + VRF_PROOF_LEN + 32);
        out.extend_from_slice(&(self.seed.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.seed);
        out.extend_from_slice(&self.vrf_output);
        out.extend_from_slice(&self.vrf_proof);
        out.extend_from_slice(&self.relay_id);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(MixnodeError::Packet("truncated lottery proof".to_string()));
        }
        let seed_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let expected = 2 + seed_len + VRF_PREOUT_LEN + VRF_PROOF_LEN + 32;
        if seed_len > MAX_SEED_LEN || data.len() != expected {
            return Err(MixnodeError::Packet("malformed lottery proof".to_string()));
        }
        let seed = data[2..2 + seed_len].to_vec();
        let mut offset = 2 + seed_len;
        let mut vrf_output = [0u8; VRF_PREOUT_LEN];
        vrf_output.copy_from_slice(&data[offset..offset + VRF_PREOUT_LEN]);
        offset += VRF_PREOUT_LEN;
        let mut vrf_proof = [0u8; VRF_PROOF_LEN];
        vrf_proof.copy_from_slice(&data[offset..offset + VRF_PROOF_LEN]);
        offset += VRF_PROOF_LEN;
        let mut relay_id = [0u8; 32];
        relay_id.copy_from_slice(&data[offset..]);
        Ok(Self {
            seed,
            vrf_output,
            vrf_proof,
            relay_id,
        })
    }
}

/// Weighted lottery bound to a node VRF key and the live relay table.
pub struct RelayLottery {
    vrf: Arc<VrfKeyPair>,
    table: Arc<RelayTable>,
}

impl RelayLottery {
    pub fn new(vrf: Arc<VrfKeyPair>, table: Arc<RelayTable>) -> Self {
        Self { vrf, table }
    }

    /// VRF public key verifiers check proofs against.
    pub fn vrf_public_key(&self) -> [u8; 32] {
        self.vrf.public_key()
    }

    /// Draw one relay for `seed`.
    pub fn select(&self, seed: &[u8]) -> Result<(RelayId, LotteryProof)> {
        let snapshot = self.table.snapshot();
        self.select_from(&snapshot, seed)
    }

    fn select_from(
        &self,
        snapshot: &RelaySnapshot,
        seed: &[u8],
    ) -> Result<(RelayId, LotteryProof)> {
        if seed.len() > MAX_SEED_LEN {
            return Err(MixnodeError::Packet(format!(
                "lottery seed exceeds {} bytes",
                MAX_SEED_LEN
            )));
        }
        if snapshot.is_empty() {
            return Err(MixnodeError::NoRelays);
        }

        let eval = self.vrf.eval(seed);
        let randomness = u64::from_be_bytes(eval.output[..8].try_into().unwrap());
        let entry = snapshot.draw(randomness).ok_or(MixnodeError::NoRelays)?;

        let proof = LotteryProof {
            seed: seed.to_vec(),
            vrf_output: eval.preout,
            vrf_proof: eval.proof,
            relay_id: entry.descriptor.id,
        };
        Ok((entry.descriptor.id, proof))
    }

    /// Draw `hop_count` distinct relays by re-seeding with `H(seed || i)`
    /// and skipping already-chosen ids. Gives up after
    /// `4 * hop_count` attempts.
    pub fn select_path(&self, hop_count: usize, seed: &[u8]) -> Result<Vec<(RelayId, LotteryProof)>> {
        if hop_count == 0 {
            return Ok(Vec::new());
        }
        let snapshot = self.table.snapshot();
        if snapshot.is_empty() {
            return Err(MixnodeError::NoRelays);
        }

        let mut path: Vec<(RelayId, LotteryProof)> = Vec::with_capacity(hop_count);
        let max_attempts = PATH_ATTEMPT_FACTOR * hop_count;
        for attempt in 0..max_attempts {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update((attempt as u64).to_be_bytes());
            let hop_seed: [u8; 32] = hasher.finalize().into();

            let (id, proof) = self.select_from(&snapshot, &hop_seed)?;
            if path.iter().any(|(chosen, _)| *chosen == id) {
                continue;
            }
            path.push((id, proof));
            if path.len() == hop_count {
                return Ok(path);
            }
        }
        Err(MixnodeError::InsufficientRelays)
    }
}

/// Verify a lottery proof against a relay snapshot and the prover's VRF
/// public key: the proof must verify and the re-derived draw must resolve
/// to the claimed relay.
pub fn verify_lottery_proof(
    vrf_public_key: &[u8; 32],
    snapshot: &RelaySnapshot,
    proof: &LotteryProof,
) -> Result<bool> {
    let output = vrf_verify(
        vrf_public_key,
        &proof.seed,
        &proof.vrf_output,
        &proof.vrf_proof,
    )?;
    let randomness = u64::from_be_bytes(output[..8].try_into().unwrap());
    match snapshot.draw(randomness) {
        Some(entry) => Ok(entry.descriptor.id == proof.relay_id),
        None => Ok(false),
    }
}

mod serde_proof {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::VRF_PROOF_LEN;

    pub fn serialize<S: Serializer>(v: &[u8; VRF_PROOF_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; VRF_PROOF_LEN], D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(d)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("vrf proof must be 96 bytes"))
    }
}
