//! Protocol versioning
//!
//! Semantic protocol versions, the single-byte wire encoding carried by
//! every Sphinx packet, and the gating rules applied before any key
//! derivation happens.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::DropReason;

/// Mixnode protocol version following semantic versioning (MAJOR.MINOR.PATCH).
///
/// # Compatibility Rules
///
/// - **Major version** must match exactly (breaking changes)
/// - **Minor version** is accepted within `[min_supported_minor, local.minor]`
///   (the receiver downgrades its parsing to the packet's minor)
/// - **Patch version** is never transmitted and always compatible
///
/// # Examples
///
/// ```
/// use mixnode::core::protocol_version::ProtocolVersion;
///
/// let v1_2 = ProtocolVersion::new(1, 2, 0);
/// let v1_1 = ProtocolVersion::new(1, 1, 0);
///
/// // v1.2 can parse packets from v1.1 (backward compatible)
/// assert!(v1_2.is_compatible_with(&v1_1));
///
/// // v1.1 cannot parse packets from v1.2
/// assert!(!v1_1.is_compatible_with(&v1_2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major version number (breaking changes)
    pub major: u8,
    /// Minor version number (backward compatible features)
    pub minor: u8,
    /// Patch version number (bug fixes, no protocol changes)
    pub patch: u8,
}

impl ProtocolVersion {
    /// Current protocol version spoken by this implementation.
    pub const CURRENT: Self = Self {
        major: 1,
        minor: 2,
        patch: 0,
    };

    /// Create new protocol version. Major and minor must fit in a nibble
    /// for the wire encoding; values above 15 cannot be transmitted.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if this version can parse packets stamped with `other`.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Encode as a single wire byte: high nibble major, low nibble minor.
    /// The patch component is not transmitted.
    ///
    /// # Examples
    ///
    /// ```
    /// use mixnode::core::protocol_version::ProtocolVersion;
    ///
    /// assert_eq!(ProtocolVersion::new(1, 2, 0).encode_byte(), 0x12);
    /// assert_eq!(ProtocolVersion::new(2, 1, 3).encode_byte(), 0x21);
    /// ```
    pub fn encode_byte(&self) -> u8 {
        ((self.major & 0x0F) << 4) | (self.minor & 0x0F)
    }

    /// Decode a wire byte. Major zero is reserved and rejected.
    pub fn decode_byte(byte: u8) -> Option<Self> {
        let major = byte >> 4;
        if major == 0 {
            return None;
        }
        Some(Self::new(major, byte & 0x0F, 0))
    }

    /// Protocol ID string for multiaddr-style identification.
    ///
    /// # Examples
    ///
    /// ```
    /// use mixnode::core::protocol_version::ProtocolVersion;
    ///
    /// assert_eq!(ProtocolVersion::new(1, 2, 0).to_protocol_id(), "/mix/1.2.0");
    /// ```
    pub fn to_protocol_id(&self) -> String {
        format!("/mix/{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Per-packet version gate. Applied to the leading version byte before any
/// key derivation; the minimum accepted minor is hot-reloadable.
pub struct VersionGate {
    local: ProtocolVersion,
    min_minor: AtomicU8,
}

impl VersionGate {
    pub fn new(local: ProtocolVersion, min_minor: u8) -> Self {
        Self {
            local,
            min_minor: AtomicU8::new(min_minor),
        }
    }

    pub fn local(&self) -> ProtocolVersion {
        self.local
    }

    pub fn min_supported_minor(&self) -> u8 {
        self.min_minor.load(Ordering::Relaxed)
    }

    pub fn set_min_supported_minor(&self, minor: u8) {
        self.min_minor.store(minor, Ordering::Relaxed);
    }

    /// Gate a packet's version byte. Accepts iff the major matches and the
    /// minor lies within `[min_supported_minor, local.minor]`; the returned
    /// version is the one parsing proceeds under.
    pub fn check(&self, byte: u8) -> Result<ProtocolVersion, DropReason> {
        let version = ProtocolVersion::decode_byte(byte).ok_or(DropReason::UnsupportedVersion)?;
        if version.major != self.local.major
            || version.minor < self.min_minor.load(Ordering::Relaxed)
            || version.minor > self.local.minor
        {
            return Err(DropReason::UnsupportedVersion);
        }
        Ok(version)
    }
}

/// Protocol capabilities advertisement exchanged during the transport
/// handshake. Per-packet gating stays authoritative; the handshake only
/// fails connections fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolAdvertisement {
    /// Protocol version
    pub version: ProtocolVersion,
    /// Node identifier
    pub node_id: String,
}

impl ProtocolAdvertisement {
    pub fn new(version: ProtocolVersion, node_id: String) -> Self {
        Self { version, node_id }
    }

    /// Check compatibility with another advertisement, either direction.
    /// A connection is useful as long as one side can parse the other.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.version.is_compatible_with(&other.version)
            || other.version.is_compatible_with(&self.version)
    }

    /// Encode to bytes for handshake
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("Failed to encode advertisement: {}", e))
    }

    /// Decode from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("Failed to decode advertisement: {}", e))
    }
}

/// Version negotiation result
#[derive(Debug, Clone)]
pub enum NegotiationResult {
    /// Versions are compatible
    Compatible(ProtocolVersion),
    /// Incompatible versions
    Incompatible {
        our_version: ProtocolVersion,
        their_version: ProtocolVersion,
    },
}

/// Negotiate protocol version with peer: the lower compatible version wins.
pub fn negotiate_version(
    our_version: ProtocolVersion,
    their_version: ProtocolVersion,
) -> NegotiationResult {
    if our_version.is_compatible_with(&their_version)
        || their_version.is_compatible_with(&our_version)
    {
        let negotiated = if our_version < their_version {
            our_version
        } else {
            their_version
        };
        NegotiationResult::Compatible(negotiated)
    } else {
        NegotiationResult::Incompatible {
            our_version,
            their_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_encoding() {
        let v1_2 = ProtocolVersion::new(1, 2, 0);
        assert_eq!(v1_2.encode_byte(), 0x12);

        let decoded = ProtocolVersion::decode_byte(0x12);
        assert_eq!(decoded, Some(v1_2));

        let v2_1 = ProtocolVersion::decode_byte(0x21);
        assert_eq!(v2_1, Some(ProtocolVersion::new(2, 1, 0)));

        // Major zero is reserved
        assert_eq!(ProtocolVersion::decode_byte(0x02), None);
    }

    #[test]
    fn test_version_compatibility() {
        let v1_2 = ProtocolVersion::new(1, 2, 0);
        let v1_1 = ProtocolVersion::new(1, 1, 0);
        let v2_0 = ProtocolVersion::new(2, 0, 0);

        assert!(v1_2.is_compatible_with(&v1_1));
        assert!(!v1_1.is_compatible_with(&v1_2));
        assert!(!v1_2.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_protocol_id() {
        assert_eq!(ProtocolVersion::CURRENT.to_protocol_id(), "/mix/1.2.0");
    }

    #[test]
    fn test_gate_accepts_supported_window() {
        let gate = VersionGate::new(ProtocolVersion::new(1, 2, 0), 0);

        // Same and older minors pass
        assert!(gate.check(0x12).is_ok());
        assert!(gate.check(0x11).is_ok());
        assert!(gate.check(0x10).is_ok());

        // Different major and future minor are rejected
        assert_eq!(gate.check(0x21), Err(DropReason::UnsupportedVersion));
        assert_eq!(gate.check(0x13), Err(DropReason::UnsupportedVersion));
    }

    #[test]
    fn test_gate_min_minor_reload() {
        let gate = VersionGate::new(ProtocolVersion::new(1, 2, 0), 0);
        assert!(gate.check(0x10).is_ok());

        gate.set_min_supported_minor(2);
        assert_eq!(gate.check(0x10), Err(DropReason::UnsupportedVersion));
        assert_eq!(gate.check(0x11), Err(DropReason::UnsupportedVersion));
        assert!(gate.check(0x12).is_ok());
    }

    #[test]
    fn test_negotiation() {
        let v1_2 = ProtocolVersion::new(1, 2, 0);
        let v1_1 = ProtocolVersion::new(1, 1, 0);

        match negotiate_version(v1_2, v1_1) {
            NegotiationResult::Compatible(version) => {
                assert_eq!(version, v1_1);
            }
            _ => panic!("Expected compatible versions"),
        }

        match negotiate_version(v1_2, ProtocolVersion::new(2, 0, 0)) {
            NegotiationResult::Incompatible { .. } => {}
            _ => panic!("Expected incompatible versions"),
        }
    }
}
