// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The downstream peer session (C4): transport ownership, the hello
//! handshake, and incoming-frame dispatch (§4.4).

pub mod session;
pub mod transport;

pub use session::{PeerCallback, PeerIO};
pub use transport::{Transport, TransportKind, UdpTransport};
