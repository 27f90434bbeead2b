// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP accept loop (C6, §4.6).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{client::session::ClientSession, manager::ClientManager};

pub struct ListenerConfig {
    pub port: u16,
    pub accept_anyhost: bool,
    pub auth_token: [u8; 8],
}

/// Binds and accepts until `cancel` fires. Each accepted connection is
/// handed to [`ClientSession::accept`] on its own task tracked in a
/// `JoinSet` so the caller can abort every still-open client at once
/// (§4.8 step 6 "close all clients").
pub async fn run(
    cfg: ListenerConfig,
    protocol_version: u8,
    manager: Arc<ClientManager>,
    cancel: CancellationToken,
) -> Result<()> {
    let host = if cfg.accept_anyhost { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{host}:{}", cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding TCP listener on {addr}"))?;
    info!(addr = %addr, "listening for clients");

    let mut clients: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(count = clients.len(), "listener stopping, closing all clients");
                clients.abort_all();
                while clients.join_next().await.is_some() {}
                return Ok(());
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {},
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let manager = manager.clone();
                        let auth_token = cfg.auth_token;
                        clients.spawn(async move {
                            ClientSession::accept(
                                stream,
                                peer_addr.to_string(),
                                auth_token,
                                protocol_version,
                                manager,
                            )
                            .await;
                        });
                    },
                    Err(e) => {
                        warn!("accept error: {e}");
                    },
                }
            },
        }
    }
}
