// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The outer reconnect loop (C8, §4.8): opens the downstream transport,
//! wires C4 through C7 for one connection epoch, runs it to completion, and
//! loops. The client manager (C7) is a process-lifetime singleton (§3
//! "Lifecycle") — only C4, the listener, and the epoch's reset token are
//! rebuilt each time around.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::{Config, PeerPort},
    client::listener::{self, ListenerConfig},
    manager::{ClientManager, worker::ManagerCallback},
    peer::{PeerIO, Transport, UdpTransport},
};

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Opens the `Transport` named by `cfg.port` (§4.8 step 1). Serial device
/// setup (baud, parity, RTS delay) is an out-of-scope external collaborator
/// (§1, §4.4) — only the UDP path is actually wired up; a
/// serial `--port` fails with a descriptive error so the retry loop logs it
/// and tries again rather than the process crashing.
async fn open_transport(port: &PeerPort) -> Result<Arc<dyn Transport>> {
    match port {
        PeerPort::Udp(p) => {
            let socket = UdpSocket::bind(("127.0.0.1", 0))
                .await
                .context("binding downstream UDP socket")?;
            socket
                .connect(("127.0.0.1", *p))
                .await
                .with_context(|| format!("connecting downstream UDP socket to port {p}"))?;
            Ok(Arc::new(UdpTransport::new(socket)))
        },
        PeerPort::Serial(path) => {
            bail!(
                "serial transport for {path} needs a configured serial device driver, which \
                 this crate treats as an external collaborator (out of scope)"
            )
        },
    }
}

/// Runs connection epochs until `shutdown` fires. Each iteration is one pass
/// through §4.8 steps 1-7.
pub async fn run(cfg: Config, manager: Arc<ClientManager>, shutdown: CancellationToken) -> Result<()> {
    while !shutdown.is_cancelled() {
        // Step 1.
        let transport = match open_transport_with_retry(&cfg.port, &shutdown).await {
            Some(t) => t,
            None => return Ok(()), // shutdown fired while retrying
        };

        // Step 2: construct C4, register C7 as its callback.
        let epoch_cancel = manager.begin_epoch().await;
        let callback = Arc::new(ManagerCallback(manager.clone()));
        let peer = PeerIO::new(transport, callback, cfg.read_timeout_ms);

        // Step 3: start the C4 read task, wait for the handshake.
        let reader = tokio::spawn(peer.clone().run(epoch_cancel.clone()));

        let hello_ok = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = epoch_cancel.cancelled() => false,
            ok = peer.wait_for_hello() => ok,
        };

        if !hello_ok {
            info!("downstream hello did not complete this epoch, tearing down");
            epoch_cancel.cancel();
            let _ = reader.await;
            continue;
        }

        // Step 4: start the C6 listener.
        let listener_cfg = ListenerConfig {
            port: cfg.listen_port,
            accept_anyhost: cfg.accept_anyhost,
            auth_token: cfg.auth_token,
        };
        let protocol_version = peer.protocol_version();
        let listener_manager = manager.clone();
        let listener_cancel = epoch_cancel.clone();
        let listener_task = tokio::spawn(async move {
            if let Err(e) = listener::run(listener_cfg, protocol_version, listener_manager, listener_cancel).await {
                warn!("listener exited: {e:#}");
            }
        });

        // Step 5: block on the worker loop — the reactor join point for
        // this epoch.
        tokio::select! {
            _ = shutdown.cancelled() => epoch_cancel.cancel(),
            () = manager.run_worker(&peer, epoch_cancel.clone()) => {},
        }

        // Step 6: stop the listener (which closes all clients), stop C4,
        // join in client-manager-then-peer-reader order.
        epoch_cancel.cancel();
        peer.reset();
        let _ = listener_task.await;
        let _ = reader.await;
        info!("connection epoch ended");

        // Step 7: loop.
    }

    Ok(())
}

/// Step 1's retry-after-1s: returns `None` only if `shutdown` fired while
/// waiting.
async fn open_transport_with_retry(
    port: &PeerPort,
    shutdown: &CancellationToken,
) -> Option<Arc<dyn Transport>> {
    loop {
        if shutdown.is_cancelled() {
            return None;
        }
        match open_transport(port).await {
            Ok(t) => return Some(t),
            Err(e) => {
                warn!("failed to open downstream transport: {e:#}");
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                }
            },
        }
    }
}
