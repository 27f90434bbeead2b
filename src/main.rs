// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use picard_mux::{
    cfg::{cli::load_config_from_args, logger::init_logger},
    manager::{ClientManager, ManagerConfig},
    supervisor,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Exit code 0 on a clean shutdown (or `--help`/`--version`, handled by
/// `clap` before we get here); 1 on a configuration or startup failure
/// (§6), via `#[tokio::main]`'s default `Result` handling.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config_from_args(std::env::args_os())?;
    let _logger_guard = init_logger(&cfg.logging)?;

    if cfg.service.daemon {
        info!(
            service_name = ?cfg.service.service_name,
            "--daemon requested; running in the foreground (OS service wrapper is out of scope)"
        );
    }

    let manager = ClientManager::new(ManagerConfig {
        retries: cfg.picard_retries,
        timeout_ms: cfg.picard_timeout_ms,
    });

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            ctrl_c_shutdown.cancel();
        }
    });

    supervisor::run(cfg, manager, shutdown).await
}
