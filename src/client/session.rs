// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-TCP-connection client state (C5, §4.5).
//!
//! Each accepted connection gets an auth timer, a hello check, and — once
//! authenticated — a slot in the manager's client map contributing to the
//! aggregate subscription filter.

use std::sync::{Arc, Weak};

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::{Duration, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    manager::ClientManager,
    protocol::{
        mux::{Framer, MuxMessage, MuxOutput},
        mux_type, prefix,
        subscription::SubscriptionFilter,
    },
};

/// Opaque handle into the manager's client map (§9: "handles, not objects").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInitState {
    Waiting,
    Authenticated,
    BadInit,
    Closed,
}

const MUX_HELLO_PAYLOAD_LEN: usize = 9;
const AUTH_TIMEOUT: Duration = Duration::from_millis(
    crate::protocol::CLIENT_AUTH_TIMEOUT_MS,
);

/// A single authenticated (or pending) TCP client.
pub struct ClientSession {
    pub handle: ClientHandle,
    writer: Mutex<OwnedWriteHalf>,
    state: Mutex<ClientInitState>,
    pub filter: Mutex<SubscriptionFilter>,
    remote_name: String,
    manager: Weak<ClientManager>,
    negotiated_protocol_version: u8,
}

impl ClientSession {
    /// `negotiated_protocol_version` is C4's protocol version at the time the
    /// listener started accepting for this connection epoch.
    pub async fn accept(
        stream: TcpStream,
        remote_name: String,
        auth_token: [u8; 8],
        negotiated_protocol_version: u8,
        manager: Arc<ClientManager>,
    ) {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let handle = manager.alloc_handle();

        let session = Arc::new(Self {
            handle,
            writer: Mutex::new(write_half),
            state: Mutex::new(ClientInitState::Waiting),
            filter: Mutex::new(SubscriptionFilter::new()),
            remote_name,
            manager: Arc::downgrade(&manager),
            negotiated_protocol_version,
        });

        match session
            .clone()
            .authenticate(read_half, auth_token)
            .await
        {
            Ok(mut read_half) => {
                manager.register(handle, session.clone());
                info!(handle = handle.0, name = %session.remote_name, "client authenticated");
                if let Err(e) = session.read_loop(&mut read_half).await {
                    debug!(handle = handle.0, "client read loop ended: {e}");
                }
                session.close().await;
            },
            Err(e) => {
                debug!(handle = handle.0, "client rejected: {e}");
            },
        }
    }

    /// Reads and validates the initial `MUX_HELLO`, replies, and returns the
    /// read half for the command loop on success.
    async fn authenticate(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        auth_token: [u8; 8],
    ) -> Result<OwnedReadHalf> {
        let mut framer = Framer::new();
        let mut buf = [0u8; 256];

        let hello = timeout(AUTH_TIMEOUT, async {
            loop {
                let n = read_half.read(&mut buf).await?;
                if n == 0 {
                    anyhow::bail!("connection closed before hello");
                }
                let mut found = None;
                framer.read(&buf[..n], |msg| {
                    if found.is_none() {
                        found = Some(msg);
                    }
                });
                if let Some(msg) = found {
                    return Ok::<MuxMessage, anyhow::Error>(msg);
                }
            }
        })
        .await;

        let msg = match hello {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                *self.state.lock().await = ClientInitState::BadInit;
                return Err(e);
            },
            Err(_elapsed) => {
                *self.state.lock().await = ClientInitState::BadInit;
                return Err(ClientError::AuthTimeout.into());
            },
        };

        let (result_code, validation_err) = self.validate_hello(&msg, auth_token);

        let response = MuxOutput {
            id: 0,
            ty: mux_type::MUX_HELLO,
            prefix: result_code,
            payload: bytes::Bytes::copy_from_slice(&[self.negotiated_protocol_version]),
        };
        self.write_output(&response).await?;

        if let Some(err) = validation_err {
            *self.state.lock().await = ClientInitState::BadInit;
            Err(err.into())
        } else {
            *self.state.lock().await = ClientInitState::Authenticated;
            Ok(read_half)
        }
    }

    /// Returns the wire prefix to send back, plus the typed error to reject
    /// with when validation fails (`None` on success).
    fn validate_hello(&self, msg: &MuxMessage, auth_token: [u8; 8]) -> (u8, Option<ClientError>) {
        if msg.ty != mux_type::MUX_HELLO || msg.payload.len() != MUX_HELLO_PAYLOAD_LEN {
            warn!(
                got = msg.payload.len(),
                "MUX_HELLO payload has the wrong length"
            );
            return (
                prefix::ERR_INVALID_CMD,
                Some(ClientError::BadHelloLength {
                    expected: MUX_HELLO_PAYLOAD_LEN,
                    got: msg.payload.len(),
                }),
            );
        }

        let version = msg.payload[0];
        if version != self.negotiated_protocol_version {
            return (
                prefix::ERR_UNSUPPORTED_VERSION,
                Some(ClientError::UnsupportedVersion(version)),
            );
        }

        if msg.payload[1..9] != auth_token {
            return (prefix::ERR_INVALID_AUTH, Some(ClientError::InvalidAuth));
        }

        (prefix::OK, None)
    }

    /// Post-auth command loop: every parsed message is handed to the manager
    /// queue tagged with this session's handle (§4.5 "Command path").
    async fn read_loop(&self, read_half: &mut OwnedReadHalf) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            anyhow::bail!("manager dropped");
        };

        let mut framer = Framer::new();
        let mut buf = [0u8; 512];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                anyhow::bail!("connection closed");
            }
            let handle = self.handle;
            framer.read(&buf[..n], |msg| {
                manager.enqueue(Some(handle), msg);
            });
        }
    }

    /// Writes a response/notification to this client. A no-op once closed
    /// (§3 "writes on Closed are no-ops").
    pub async fn send_output(&self, out: &MuxOutput) -> Result<()> {
        if *self.state.lock().await == ClientInitState::Closed {
            return Ok(());
        }
        self.write_output(out).await
    }

    async fn write_output(&self, out: &MuxOutput) -> Result<()> {
        let bytes = out.serialize();
        let mut w = self.writer.lock().await;
        w.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        *self.state.lock().await == ClientInitState::Authenticated
    }

    async fn close(&self) {
        *self.state.lock().await = ClientInitState::Closed;
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_client(self.handle).await;
        }
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}
