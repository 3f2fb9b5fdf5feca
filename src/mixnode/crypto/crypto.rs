//! Cryptographic primitives for the mixnode
//!
//! Thin, pure wrappers over the dalek / RustCrypto stack: X25519 ECDH,
//! HKDF-SHA256, the ChaCha20 stream cipher, Poly1305 one-time MACs,
//! Ed25519 signatures, and constant-time comparison. All per-packet key
//! material is derived here and zeroized on drop.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public/shared secret length
pub const KEY_LEN: usize = 32;
/// ChaCha20 nonce length
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length
pub const MAC_LEN: usize = 16;
/// Replay tag length
pub const TAG_LEN: usize = 16;

/// Primitive-level errors. Callers surface these as
/// [`DropReason::CryptoFailure`](crate::DropReason::CryptoFailure).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid input length")]
    InvalidLength,
    #[error("non-contributory or malformed curve point")]
    BadPoint,
    #[error("MAC mismatch")]
    MacMismatch,
}

/// X25519 scalar multiplication. Rejects non-contributory results
/// (identity / low-order points) which X25519 maps to all-zero output.
pub fn x25519(scalar: &[u8; KEY_LEN], point: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    let shared = x25519_dalek::x25519(*scalar, *point);
    if shared.ct_eq(&[0u8; KEY_LEN]).into() {
        return Err(CryptoError::BadPoint);
    }
    Ok(shared)
}

/// The X25519 base point, for deriving a public key from a secret scalar.
pub fn x25519_base(scalar: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    x25519_dalek::x25519(*scalar, x25519_dalek::X25519_BASEPOINT_BYTES)
}

/// HKDF-SHA256 expand into `out`. The salt binds the derivation to the
/// packet's ephemeral key, the info string to its role.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out).map_err(|_| CryptoError::InvalidLength)
}

/// Apply the ChaCha20 keystream in place (XOR; its own inverse).
pub fn chacha20_apply(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

/// Produce `out.len()` raw keystream bytes starting at `offset`.
pub fn chacha20_keystream(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    offset: u64,
    out: &mut [u8],
) {
    out.fill(0);
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.seek(offset);
    cipher.apply_keystream(out);
}

/// One-time Poly1305 MAC over `msg`. The key must never authenticate two
/// different messages; hop MAC keys are unique per packet.
pub fn poly1305_mac(key: &[u8; KEY_LEN], msg: &[u8]) -> [u8; MAC_LEN] {
    let mac = Poly1305::new(key.into()).compute_unpadded(msg);
    mac.into()
}

/// Constant-time MAC verification.
pub fn poly1305_verify(
    key: &[u8; KEY_LEN],
    msg: &[u8],
    expected: &[u8; MAC_LEN],
) -> Result<(), CryptoError> {
    let computed = poly1305_mac(key, msg);
    if ct_eq(&computed, expected) {
        Ok(())
    } else {
        Err(CryptoError::MacMismatch)
    }
}

/// Ed25519 signature over `msg`.
pub fn ed25519_sign(key: &SigningKey, msg: &[u8]) -> [u8; 64] {
    key.sign(msg).to_bytes()
}

/// Ed25519 verification.
pub fn ed25519_verify(pk: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(pk).map_err(|_| CryptoError::BadPoint)?;
    let sig = Signature::from_bytes(sig);
    vk.verify(msg, &sig).map_err(|_| CryptoError::MacMismatch)
}

/// SHA-256 digest.
pub fn sha256(msg: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(msg);
    hasher.finalize().into()
}

/// Constant-time equality on byte slices of equal length.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

// HKDF info strings, one per derived role.
const INFO_BLINDING: &[u8] = b"mix-blind";
const INFO_HEADER: &[u8] = b"mix-header";
const INFO_PAYLOAD: &[u8] = b"mix-payload";
const INFO_MAC: &[u8] = b"mix-mac";
const INFO_REPLAY: &[u8] = b"mix-replay";

/// Per-hop key material derived from one ECDH shared secret. Never stored
/// beyond the processing of a single packet; scrubbed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Blinds the ephemeral key for the next hop
    pub blinding: [u8; KEY_LEN],
    /// Stream cipher key over the routing-info ring
    pub header_key: [u8; KEY_LEN],
    pub header_nonce: [u8; NONCE_LEN],
    /// Stream cipher key for one payload layer
    pub payload_key: [u8; KEY_LEN],
    pub payload_nonce: [u8; NONCE_LEN],
    /// One-time Poly1305 key over the routing info
    pub mac_key: [u8; KEY_LEN],
    /// Epoch-scoped replay tag
    pub replay_tag: [u8; TAG_LEN],
}

impl HopKeys {
    /// Derive the full hop key set from a shared secret, salted by the
    /// ephemeral public key that produced it.
    pub fn derive(
        shared: &[u8; KEY_LEN],
        ephemeral_pk: &[u8; KEY_LEN],
    ) -> Result<Self, CryptoError> {
        let mut keys = Self {
            blinding: [0u8; KEY_LEN],
            header_key: [0u8; KEY_LEN],
            header_nonce: [0u8; NONCE_LEN],
            payload_key: [0u8; KEY_LEN],
            payload_nonce: [0u8; NONCE_LEN],
            mac_key: [0u8; KEY_LEN],
            replay_tag: [0u8; TAG_LEN],
        };

        hkdf(shared, ephemeral_pk, INFO_BLINDING, &mut keys.blinding)?;

        let mut header = [0u8; KEY_LEN + NONCE_LEN];
        hkdf(shared, ephemeral_pk, INFO_HEADER, &mut header)?;
        keys.header_key.copy_from_slice(&header[..KEY_LEN]);
        keys.header_nonce.copy_from_slice(&header[KEY_LEN..]);
        header.zeroize();

        let mut payload = [0u8; KEY_LEN + NONCE_LEN];
        hkdf(shared, ephemeral_pk, INFO_PAYLOAD, &mut payload)?;
        keys.payload_key.copy_from_slice(&payload[..KEY_LEN]);
        keys.payload_nonce.copy_from_slice(&payload[KEY_LEN..]);
        payload.zeroize();

        hkdf(shared, ephemeral_pk, INFO_MAC, &mut keys.mac_key)?;
        hkdf(shared, ephemeral_pk, INFO_REPLAY, &mut keys.replay_tag)?;

        Ok(keys)
    }
}
