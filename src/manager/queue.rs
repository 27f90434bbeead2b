// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The command queue (§4.7 "Queue"): a non-blocking producer side feeding a
//! worker that pops with a 1-second tick.

use tokio::sync::mpsc;

use crate::{client::session::ClientHandle, protocol::mux::MuxMessage};

/// One queued command. `client` is `None` for manager-internal commands (the
/// synthetic re-subscribe issued after a client leaves, §4.7 "Client
/// removal").
#[derive(Debug)]
pub struct CommandMsg {
    pub client: Option<ClientHandle>,
    pub msg: MuxMessage,
}

pub struct CommandQueue {
    tx: mpsc::UnboundedSender<CommandMsg>,
}

impl CommandQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommandMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Non-blocking by construction (§4.7 "`add_command` is non-blocking").
    pub fn add_command(&self, client: Option<ClientHandle>, msg: MuxMessage) {
        // The receiver only goes away when the worker has stopped, in which
        // case there is nothing useful to do with a send failure.
        let _ = self.tx.send(CommandMsg { client, msg });
    }
}
