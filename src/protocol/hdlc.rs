// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HDLC byte framing with FCS-16 trailer (C1, §4.1).
//!
//! A frame on the wire is `0x7E <escaped payload><escaped FCS16-LE> 0x7E`.
//! `0x7E` and `0x7D` inside the payload/FCS are escaped as `0x7D <byte ^
//! 0x20>`. A frame whose running FCS does not land on [`FCS_MAGIC_RESIDUE`]
//! is silently dropped — the manager will resend, or the supervisor will
//! reset on idle (§7).

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{
    error::FramingError,
    protocol::fcs::{self, FCS_MAGIC_RESIDUE, Fcs},
};

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// Encodes a complete payload into an HDLC frame ready to write to the
/// transport.
pub fn encode(payload: &[u8]) -> Bytes {
    let fcs = fcs::compute(payload);

    let mut out = BytesMut::with_capacity(payload.len() + 6);
    out.put_u8(FLAG);
    for &b in payload {
        push_escaped(&mut out, b);
    }
    for &b in &fcs.to_le_bytes() {
        push_escaped(&mut out, b);
    }
    out.put_u8(FLAG);
    out.freeze()
}

#[inline]
fn push_escaped(out: &mut BytesMut, b: u8) {
    if b == FLAG || b == ESCAPE {
        out.put_u8(ESCAPE);
        out.put_u8(b ^ ESCAPE_XOR);
    } else {
        out.put_u8(b);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Data,
    Escape,
}

/// Streaming HDLC decoder. Feed it bytes one (or a buffer) at a time; every
/// time a frame's FCS validates, `on_frame` is invoked with the decoded
/// payload (the trailing FCS bytes are not included).
pub struct Decoder {
    state: State,
    buf: Vec<u8>,
    running_fcs: Fcs,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buf: Vec::with_capacity(256),
            running_fcs: Fcs::new(),
        }
    }

    /// Feeds a chunk of transport bytes through the decoder, invoking
    /// `on_frame` once per validated frame (in arrival order).
    pub fn feed(&mut self, bytes: &[u8], mut on_frame: impl FnMut(&[u8])) {
        for &b in bytes {
            self.feed_one(b, &mut on_frame);
        }
    }

    fn feed_one(&mut self, b: u8, on_frame: &mut impl FnMut(&[u8])) {
        match self.state {
            State::Idle => {
                if b == FLAG {
                    self.state = State::Data;
                    self.buf.clear();
                    self.running_fcs = Fcs::new();
                }
                // Any other byte while idle is noise between frames; ignore.
            },
            State::Data => {
                if b == FLAG {
                    if !self.buf.is_empty() {
                        self.try_complete(on_frame);
                    }
                    // Re-open immediately: a closing flag doubles as the next
                    // frame's opening flag.
                    self.buf.clear();
                    self.running_fcs = Fcs::new();
                } else if b == ESCAPE {
                    self.state = State::Escape;
                } else {
                    self.push_data_byte(b);
                }
            },
            State::Escape => {
                self.push_data_byte(b ^ ESCAPE_XOR);
                self.state = State::Data;
            },
        }
    }

    #[inline]
    fn push_data_byte(&mut self, b: u8) {
        self.buf.push(b);
        self.running_fcs.update(b);
    }

    fn try_complete(&mut self, on_frame: &mut impl FnMut(&[u8])) {
        if self.buf.len() < 2 {
            return;
        }
        if self.running_fcs.value() == FCS_MAGIC_RESIDUE {
            let payload_len = self.buf.len() - 2;
            on_frame(&self.buf[..payload_len]);
        } else {
            // Dropped, not escalated: the manager will resend (§4.1/§7).
            debug!("{}", FramingError::BadFcs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut dec = Decoder::new();
        let mut frames = Vec::new();
        dec.feed(bytes, |f| frames.push(f.to_vec()));
        frames
    }

    #[test]
    fn round_trips_simple_payload() {
        let payload = b"hello picard";
        let framed = encode(payload);
        let frames = decode_all(&framed);
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn round_trips_payload_needing_escapes() {
        let payload = [0x7E, 0x7D, 0x00, 0x7E, 0xFF, 0x7D];
        let framed = encode(&payload);
        // The encoded stream must not contain a bare 0x7E/0x7D except the
        // opening/closing flags and the designated escape bytes.
        let frames = decode_all(&framed);
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn drops_frame_with_bad_fcs() {
        let payload = b"abc";
        let mut framed = encode(payload).to_vec();
        // Corrupt one payload byte without touching the trailer.
        let corrupt_idx = 1;
        framed[corrupt_idx] ^= 0xFF;
        let frames = decode_all(&framed);
        assert!(frames.is_empty());
    }

    #[test]
    fn token_split_across_two_reads() {
        let payload = b"split me";
        let framed = encode(payload);
        let mid = framed.len() / 2;
        let mut dec = Decoder::new();
        let mut frames = Vec::new();
        dec.feed(&framed[..mid], |f| frames.push(f.to_vec()));
        dec.feed(&framed[mid..], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn empty_payload_between_two_flags_is_ignored() {
        // 0x7E 0x7E is just "idle -> data -> flag with empty buffer", never a
        // zero-length frame.
        let frames = decode_all(&[FLAG, FLAG]);
        assert!(frames.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut stream = encode(b"one").to_vec();
        stream.extend_from_slice(&encode(b"two"));
        let frames = decode_all(&stream);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
