// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upstream (TCP) wire framing: magic-token/length-prefixed mux messages
//! (C2, §3, §6).
//!
//! `A7 40 A0 F5 | LEN_BE16 | ID_BE16 | TYPE | PAYLOAD`, where `LEN` covers
//! `id + type + payload` (i.e. `3 + payload.len()`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::PICARD_MAGIC;

/// An inbound mux message parsed off the TCP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxMessage {
    pub id: u16,
    pub ty: u8,
    pub payload: Bytes,
}

/// An outbound mux message: same shape as [`MuxMessage`] but carrying a
/// response/notification `prefix` byte ahead of the payload (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOutput {
    pub id: u16,
    pub ty: u8,
    pub prefix: u8,
    pub payload: Bytes,
}

impl MuxMessage {
    /// Serializes `magic | len_be16(3+payload) | id_be16 | type | payload`.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + 2 + 3 + self.payload.len());
        out.put_slice(&PICARD_MAGIC);
        out.put_u16(3 + self.payload.len() as u16);
        out.put_u16(self.id);
        out.put_u8(self.ty);
        out.put_slice(&self.payload);
        out.freeze()
    }
}

impl MuxOutput {
    /// Serializes `magic | len_be16(4+payload) | id_be16 | type | prefix |
    /// payload`.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + 2 + 4 + self.payload.len());
        out.put_slice(&PICARD_MAGIC);
        out.put_u16(4 + self.payload.len() as u16);
        out.put_u16(self.id);
        out.put_u8(self.ty);
        out.put_u8(self.prefix);
        out.put_slice(&self.payload);
        out.freeze()
    }
}

/// Scans a growing byte buffer for magic-token-delimited mux messages
/// (C2, §4.2). Bytes are appended via [`Framer::read`]; each complete
/// message found is removed from the buffer and returned in arrival order.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Appends newly-read bytes and extracts every complete message now
    /// available, invoking `on_command` for each (in order).
    pub fn read(&mut self, bytes: &[u8], mut on_command: impl FnMut(MuxMessage)) {
        self.buf.extend_from_slice(bytes);

        loop {
            let Some(token_at) = find_magic(&self.buf) else {
                // No token: a token can never be split longer than 3 bytes,
                // so only the last 3 bytes could still be a prefix of one.
                let keep_from = self.buf.len().saturating_sub(3);
                self.buf.advance(keep_from);
                return;
            };

            if token_at > 0 {
                self.buf.advance(token_at);
            }

            // magic(4) + len(2) must be available to read the length.
            if self.buf.len() < 6 {
                return;
            }
            let len = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;

            let total = 6 + len;
            if self.buf.len() < total {
                // Wait for the rest; don't drop what we already have.
                return;
            }

            let id = u16::from_be_bytes([self.buf[6], self.buf[7]]);
            let ty = self.buf[8];
            let payload = Bytes::copy_from_slice(&self.buf[9..total]);

            self.buf.advance(total);
            on_command(MuxMessage { id, ty, payload });
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < PICARD_MAGIC.len() {
        return None;
    }
    buf.windows(PICARD_MAGIC.len())
        .position(|w| w == PICARD_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_message() {
        let msg = MuxMessage {
            id: 7,
            ty: 22,
            payload: Bytes::from_static(b"hi"),
        };
        let wire = msg.serialize();

        let mut framer = Framer::new();
        let mut seen = Vec::new();
        framer.read(&wire, |m| seen.push(m));
        assert_eq!(seen, vec![msg]);
    }

    #[test]
    fn token_split_across_two_reads() {
        let msg = MuxMessage {
            id: 1,
            ty: 2,
            payload: Bytes::from_static(b"abcdef"),
        };
        let wire = msg.serialize();
        let mid = 2; // splits inside the 4-byte magic token
        let mut framer = Framer::new();
        let mut seen = Vec::new();
        framer.read(&wire[..mid], |m| seen.push(m));
        assert!(seen.is_empty());
        framer.read(&wire[mid..], |m| seen.push(m));
        assert_eq!(seen, vec![msg]);
    }

    #[test]
    fn waits_for_full_payload_rather_than_dropping() {
        let msg = MuxMessage {
            id: 1,
            ty: 2,
            payload: Bytes::from_static(b"0123456789"),
        };
        let wire = msg.serialize();
        let mut framer = Framer::new();
        let mut seen = Vec::new();
        framer.read(&wire[..wire.len() - 2], |m| seen.push(m));
        assert!(seen.is_empty());
        framer.read(&wire[wire.len() - 2..], |m| seen.push(m));
        assert_eq!(seen, vec![msg]);
    }

    #[test]
    fn recovers_after_garbage_prefix() {
        let msg = MuxMessage {
            id: 1,
            ty: 2,
            payload: Bytes::from_static(b"ok"),
        };
        let mut wire = vec![0xDE, 0xAD, 0xBE, 0xEF];
        wire.extend_from_slice(&msg.serialize());
        let mut framer = Framer::new();
        let mut seen = Vec::new();
        framer.read(&wire, |m| seen.push(m));
        assert_eq!(seen, vec![msg]);
    }

    #[test]
    fn back_to_back_messages() {
        let a = MuxMessage {
            id: 1,
            ty: 2,
            payload: Bytes::from_static(b"a"),
        };
        let b = MuxMessage {
            id: 2,
            ty: 3,
            payload: Bytes::from_static(b"bb"),
        };
        let mut wire = a.serialize().to_vec();
        wire.extend_from_slice(&b.serialize());
        let mut framer = Framer::new();
        let mut seen = Vec::new();
        framer.read(&wire, |m| seen.push(m));
        assert_eq!(seen, vec![a, b]);
    }
}
