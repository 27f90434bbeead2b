// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The downstream (manager-facing) frame header and its dispatch shape
//! (§3, §4.4).
//!
//! Header: `{ control: u8, type: u8, seq: u8, len: u8 }` followed by `len`
//! payload bytes. `control` bit0 is direction (0=request, 1=response), bit1
//! is reliability (0=unreliable, 1=reliable).

use bitflags::bitflags;

use crate::{error::ProtocolError, protocol::downstream_type};

pub const HEADER_LEN: usize = 4;

bitflags! {
    /// The `control` byte of a downstream frame header.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Control: u8 {
        /// bit0: 0 = request, 1 = response.
        const RESPONSE  = 0b01;
        /// bit1: 0 = unreliable, 1 = reliable.
        const RELIABLE  = 0b10;
    }
}

impl Control {
    pub const REQUEST_RELIABLE: Control = Control::RELIABLE;
    pub const REQUEST_UNRELIABLE: Control = Control::empty();
    pub const RESPONSE_RELIABLE: Control =
        Control::from_bits_truncate(Control::RESPONSE.bits() | Control::RELIABLE.bits());

    #[inline]
    pub fn is_response(self) -> bool {
        self.contains(Control::RESPONSE)
    }

    #[inline]
    pub fn is_reliable(self) -> bool {
        self.contains(Control::RELIABLE)
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Control({}|{})",
            if self.is_response() { "response" } else { "request" },
            if self.is_reliable() { "reliable" } else { "unreliable" }
        )
    }
}

/// A decoded downstream frame header plus its payload slice.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub control: Control,
    pub ty: u8,
    pub seq: u8,
    pub len: u8,
}

impl FrameHeader {
    pub fn encode(self) -> [u8; HEADER_LEN] {
        [self.control.bits(), self.ty, self.seq, self.len]
    }

    /// Parses the fixed 4-byte header. Does not validate that `len` matches
    /// the amount of payload actually present — callers check that (§4.4:
    /// "payload length must equal `len`").
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::LengthMismatch {
                expected: HEADER_LEN as u8,
                got: bytes.len(),
            });
        }
        Ok(Self {
            control: Control::from_bits_truncate(bytes[0]),
            ty: bytes[1],
            seq: bytes[2],
            len: bytes[3],
        })
    }
}

/// A downstream frame fully decoded and classified for dispatch by
/// [`crate::peer::session::PeerIO`] (§4.4's incoming-frame dispatch table).
#[derive(Debug, Clone)]
pub enum DownstreamEvent {
    HelloResponse {
        /// Raw success code: 0 = OK, anything else is a rejection (§4.4).
        success: u8,
        version: u8,
        mgr_seq: u8,
        cli_seq: u8,
        mode: u8,
    },
    MgrHello {
        version: u8,
    },
    Notification {
        reliable: bool,
        seq: u8,
        notif_type: u8,
        rest: bytes::Bytes,
    },
    CommandResponse {
        ty: u8,
        seq: u8,
        resp_code: u8,
        rest: bytes::Bytes,
    },
    Discard,
}

/// Classifies one decoded frame per the table in §4.4. `payload` must
/// already have been checked to have length `header.len`.
pub fn classify(header: FrameHeader, payload: &[u8]) -> DownstreamEvent {
    use downstream_type::*;

    match header.ty {
        HELLO_RESPONSE if payload.len() >= 5 => DownstreamEvent::HelloResponse {
            success: payload[0],
            version: payload[1],
            mgr_seq: payload[2],
            cli_seq: payload[3],
            mode: payload[4],
        },
        MGR_HELLO if payload.len() >= 2 => DownstreamEvent::MgrHello { version: payload[1] },
        NOTIFICATION if !header.control.is_response() && !payload.is_empty() => {
            DownstreamEvent::Notification {
                reliable: header.control.is_reliable(),
                seq: header.seq,
                notif_type: payload[0],
                rest: bytes::Bytes::copy_from_slice(&payload[1..]),
            }
        },
        ty if downstream_type::is_api_command(ty)
            && header.control.is_response()
            && header.control.is_reliable()
            && !payload.is_empty() =>
        {
            DownstreamEvent::CommandResponse {
                ty,
                seq: header.seq,
                resp_code: payload[0],
                rest: bytes::Bytes::copy_from_slice(&payload[1..]),
            }
        },
        _ => DownstreamEvent::Discard,
    }
}
