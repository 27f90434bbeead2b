// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Round-trip properties for the wire formats, sampled with a seeded RNG
//! instead of `proptest` (picard-mux already depends on `rand` for other
//! purposes; this keeps the test stack within the existing dependencies).

use bytes::Bytes;
use picard_mux::protocol::{
    hdlc,
    mux::{Framer, MuxMessage},
    subscription::SubscriptionParams,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const SAMPLES: usize = 200;

fn rng() -> StdRng {
    StdRng::seed_from_u64(0xF0B8_7E7D_A740_A0F5)
}

#[test]
fn hdlc_round_trip_over_random_payloads() {
    let mut rng = rng();
    for _ in 0..SAMPLES {
        let len = rng.random_range(0..64);
        let payload: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();

        let framed = hdlc::encode(&payload);
        let mut decoder = hdlc::Decoder::new();
        let mut frames = Vec::new();
        decoder.feed(&framed, |f| frames.push(f.to_vec()));

        assert_eq!(frames, vec![payload]);
    }
}

#[test]
fn hdlc_round_trip_when_split_at_every_offset() {
    let payload = b"\x7E\x7D a frame with escapes \x7D\x7E inside it";
    let framed = hdlc::encode(payload);
    for split in 0..=framed.len() {
        let mut decoder = hdlc::Decoder::new();
        let mut frames = Vec::new();
        decoder.feed(&framed[..split], |f| frames.push(f.to_vec()));
        decoder.feed(&framed[split..], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![payload.to_vec()], "split at byte {split}");
    }
}

#[test]
fn mux_message_round_trip_over_random_fields() {
    let mut rng = rng();
    for _ in 0..SAMPLES {
        let id = rng.random::<u16>();
        let ty = rng.random::<u8>();
        let len = rng.random_range(0..32);
        let payload: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();

        let msg = MuxMessage {
            id,
            ty,
            payload: Bytes::from(payload),
        };
        let wire = msg.serialize();

        let mut framer = Framer::new();
        let mut seen = Vec::new();
        framer.read(&wire, |m| seen.push(m));
        assert_eq!(seen, vec![msg]);
    }
}

#[test]
fn subscription_params_wire_round_trip_over_random_values() {
    let mut rng = rng();
    for _ in 0..SAMPLES {
        let params = SubscriptionParams {
            filter: rng.random::<u32>(),
            unreliable: rng.random::<u32>(),
        };
        let bytes = params.to_bytes();
        assert_eq!(SubscriptionParams::from_bytes(&bytes), Some(params));
    }
}
