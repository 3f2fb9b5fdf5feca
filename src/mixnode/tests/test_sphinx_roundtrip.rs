//! Multi-hop Sphinx laws
//!
//! The end-to-end property: building a packet over an N-hop path and
//! processing it at each hop's key reproduces the original payload at the
//! exit, while every intermediate transformation keeps the frame size and
//! outward shape constant.

use std::net::SocketAddr;
use std::sync::Arc;

use proptest::prelude::*;

use crate::core::protocol_version::{ProtocolVersion, VersionGate};
use crate::crypto::crypto::x25519_base;
use crate::crypto::replay::ReplaySet;
use crate::crypto::sphinx::{
    build_packet, Outcome, PathHop, SphinxProcessor, HEADER_SIZE, MAX_HOPS, PAYLOAD_SIZE,
};
use crate::PACKET_SIZE;

fn processor_for(sk: [u8; 32]) -> SphinxProcessor {
    SphinxProcessor::new(
        sk,
        Arc::new(ReplaySet::new()),
        Arc::new(VersionGate::new(ProtocolVersion::CURRENT, 0)),
    )
}

fn path_of(sks: &[[u8; 32]]) -> Vec<PathHop> {
    sks.iter()
        .enumerate()
        .map(|(i, sk)| PathHop {
            public_key: x25519_base(sk),
            address: format!("10.9.0.{}:7100", i + 1).parse().unwrap(),
            delay_hint_ms: (i as u32 + 1) * 10,
        })
        .collect()
}

/// Walk a frame through each hop in order; returns the exit payload.
fn walk(frame: &mut [u8; PACKET_SIZE], sks: &[[u8; 32]], expected_id: [u8; 16]) -> Vec<u8> {
    for (i, sk) in sks.iter().enumerate() {
        let processor = processor_for(*sk);
        let is_exit = i == sks.len() - 1;
        match processor.process(&mut frame[..]) {
            Outcome::Forward { next_hop, .. } => {
                assert!(!is_exit, "exit hop must deliver, not forward");
                let expected: SocketAddr =
                    format!("10.9.0.{}:7100", i + 2).parse().unwrap();
                assert_eq!(next_hop, expected, "hop {} forwarded to wrong peer", i);
            }
            Outcome::Deliver { local_id, .. } => {
                assert!(is_exit, "hop {} delivered early", i);
                assert_eq!(local_id, expected_id);
            }
            Outcome::Drop(reason) => panic!("hop {} dropped: {:?}", i, reason),
        }
    }
    frame[HEADER_SIZE..].to_vec()
}

#[test]
fn test_payload_survives_every_path_length() {
    for hop_count in 1..=MAX_HOPS {
        let sks: Vec<[u8; 32]> = (0..hop_count)
            .map(|i| [(0x10 + i as u8); 32])
            .collect();
        let payload = format!("{}-hop payload", hop_count);

        let packet = build_packet(
            ProtocolVersion::CURRENT,
            &path_of(&sks),
            [0x33; 16],
            payload.as_bytes(),
        )
        .unwrap();
        let mut frame = packet.to_bytes();

        let plaintext = walk(&mut frame, &sks, [0x33; 16]);
        assert_eq!(&plaintext[..payload.len()], payload.as_bytes());
        assert!(plaintext[payload.len()..].iter().all(|&b| b == 0));
    }
}

#[test]
fn test_hop_transform_looks_fresh() {
    // After one peel the packet must look like any other packet: same
    // size, valid version byte, different ephemeral, different ring.
    let sks = [[0x61u8; 32], [0x62u8; 32], [0x63u8; 32]];
    let packet = build_packet(ProtocolVersion::CURRENT, &path_of(&sks), [1u8; 16], b"x").unwrap();
    let original = packet.to_bytes();
    let mut frame = original;

    let processor = processor_for(sks[0]);
    assert!(matches!(
        processor.process(&mut frame[..]),
        Outcome::Forward { .. }
    ));

    assert_eq!(frame.len(), PACKET_SIZE);
    assert_eq!(frame[0], original[0]);
    assert_ne!(frame[1..33], original[1..33], "ephemeral must be blinded");
    assert_ne!(frame[33..161], original[33..161], "ring must change");
    assert_ne!(
        frame[HEADER_SIZE..],
        original[HEADER_SIZE..],
        "payload layer must be peeled"
    );
}

#[test]
fn test_paths_longer_than_capacity_rejected() {
    let sks: Vec<[u8; 32]> = (0..MAX_HOPS + 1).map(|i| [(0x20 + i as u8); 32]).collect();
    assert!(build_packet(
        ProtocolVersion::CURRENT,
        &path_of(&sks),
        [0u8; 16],
        b"too long"
    )
    .is_err());
    assert!(build_packet(ProtocolVersion::CURRENT, &[], [0u8; 16], b"empty").is_err());
}

#[test]
fn test_oversized_payload_rejected() {
    let sks = [[0x71u8; 32]];
    let payload = [0u8; PAYLOAD_SIZE + 1];
    assert!(build_packet(
        ProtocolVersion::CURRENT,
        &path_of(&sks),
        [0u8; 16],
        &payload
    )
    .is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Round-trip law over arbitrary payloads and hop counts.
    #[test]
    fn prop_roundtrip_preserves_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..PAYLOAD_SIZE),
        hop_count in 1usize..=MAX_HOPS,
        key_seed in any::<u8>(),
    ) {
        let sks: Vec<[u8; 32]> = (0..hop_count)
            .map(|i| {
                let mut sk = [key_seed; 32];
                sk[0] = sk[0].wrapping_add(i as u8).wrapping_add(1);
                sk
            })
            .collect();

        let packet = build_packet(
            ProtocolVersion::CURRENT,
            &path_of(&sks),
            [7u8; 16],
            &payload,
        )
        .unwrap();
        let mut frame = packet.to_bytes();
        let plaintext = walk(&mut frame, &sks, [7u8; 16]);

        prop_assert_eq!(&plaintext[..payload.len()], &payload[..]);
        prop_assert!(plaintext[payload.len()..].iter().all(|&b| b == 0));
    }
}
