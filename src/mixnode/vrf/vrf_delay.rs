//! Verifiable Random Function wrapper
//!
//! Wraps a schnorrkel VRF keypair behind the node-facing contract: an
//! evaluation yields 64 bytes of unbiasable output plus a 96-byte
//! batchable proof (32-byte preoutput + 64-byte DLEQ component encoding)
//! any third party can verify against the node's public key. One keypair
//! serves both the delay seeding and the relay lottery; inputs are
//! domain-separated by the callers.

use rand::rngs::OsRng;
use schnorrkel::vrf::{VRFPreOut, VRFProofBatchable};
use schnorrkel::{signing_context, ExpansionMode, Keypair, MiniSecretKey, PublicKey};

use crate::{MixnodeError, Result};

/// Transcript context shared by prover and verifiers.
const VRF_CONTEXT: &[u8] = b"mix-vrf";
/// Labels under which output halves are extracted from the VRF inout.
const OUTPUT_LABEL_LO: &[u8] = b"mix-vrf-out-0";
const OUTPUT_LABEL_HI: &[u8] = b"mix-vrf-out-1";

/// VRF output length
pub const VRF_OUTPUT_LEN: usize = 64;
/// Serialized preoutput length
pub const VRF_PREOUT_LEN: usize = 32;
/// Serialized batchable proof length
pub const VRF_PROOF_LEN: usize = 96;

/// One VRF evaluation: output bytes plus everything a verifier needs.
#[derive(Debug, Clone)]
pub struct VrfEvaluation {
    /// 64 bytes of verifiable randomness
    pub output: [u8; VRF_OUTPUT_LEN],
    /// Preoutput point, carried in proofs
    pub preout: [u8; VRF_PREOUT_LEN],
    /// Batchable DLEQ proof
    pub proof: [u8; VRF_PROOF_LEN],
}

/// Node VRF keypair.
pub struct VrfKeyPair {
    keypair: Keypair,
}

impl VrfKeyPair {
    /// Generate from OS randomness.
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate_with(&mut OsRng),
        }
    }

    /// Deterministic derivation from a 32-byte seed (the persisted form).
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let mini = MiniSecretKey::from_bytes(seed)
            .map_err(|e| MixnodeError::Vrf(format!("invalid VRF seed: {e}")))?;
        Ok(Self {
            keypair: mini.expand_to_keypair(ExpansionMode::Uniform),
        })
    }

    /// Public key bytes for verifiers.
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    /// Evaluate the VRF over `input`.
    pub fn eval(&self, input: &[u8]) -> VrfEvaluation {
        let ctx = signing_context(VRF_CONTEXT);
        let (io, _, batchable) = self.keypair.vrf_sign(ctx.bytes(input));
        VrfEvaluation {
            output: extract_output(&io),
            preout: io.to_preout().to_bytes(),
            proof: batchable.to_bytes(),
        }
    }
}

fn extract_output(io: &schnorrkel::vrf::VRFInOut) -> [u8; VRF_OUTPUT_LEN] {
    let lo: [u8; 32] = io.make_bytes(OUTPUT_LABEL_LO);
    let hi: [u8; 32] = io.make_bytes(OUTPUT_LABEL_HI);
    let mut output = [0u8; VRF_OUTPUT_LEN];
    output[..32].copy_from_slice(&lo);
    output[32..].copy_from_slice(&hi);
    output
}

/// Verify an evaluation and re-derive its output bytes. Returns the output
/// so callers can confirm any claim derived from it (delay draw, lottery
/// index) rather than trusting the prover's copy.
pub fn vrf_verify(
    public_key: &[u8; 32],
    input: &[u8],
    preout: &[u8; VRF_PREOUT_LEN],
    proof: &[u8; VRF_PROOF_LEN],
) -> Result<[u8; VRF_OUTPUT_LEN]> {
    let public = PublicKey::from_bytes(public_key)
        .map_err(|e| MixnodeError::Vrf(format!("invalid VRF public key: {e}")))?;
    let preout = VRFPreOut::from_bytes(preout)
        .map_err(|e| MixnodeError::Vrf(format!("invalid VRF preoutput: {e}")))?;
    let batchable = VRFProofBatchable::from_bytes(proof)
        .map_err(|e| MixnodeError::Vrf(format!("invalid VRF proof: {e}")))?;

    let ctx = signing_context(VRF_CONTEXT);
    let short = batchable
        .shorten_vrf(&public, ctx.bytes(input), &preout)
        .map_err(|e| MixnodeError::Vrf(format!("VRF proof malformed: {e}")))?;
    let (io, _) = public
        .vrf_verify(ctx.bytes(input), &preout, &short)
        .map_err(|e| MixnodeError::Vrf(format!("VRF proof verification failed: {e}")))?;

    Ok(extract_output(&io))
}
