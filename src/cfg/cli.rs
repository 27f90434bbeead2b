// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::cfg::config::{Config, PeerPort};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Command-line surface (§6).
#[derive(Parser, Debug)]
#[command(name = "picard-mux", version, about = "Serial API multiplexer")]
pub struct Cli {
    /// Serial device path, or a numeric UDP port on loopback.
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// TCP port clients connect to.
    #[arg(short = 'l', long = "listen")]
    pub listen: Option<u16>,

    /// Accept TCP clients on all interfaces instead of loopback only.
    #[arg(long = "accept-anyhost")]
    pub accept_anyhost: bool,

    /// Serial RTS assertion delay, milliseconds.
    #[arg(long = "rts-delay")]
    pub rts_delay: Option<u64>,

    /// Downstream in-flight command timeout, milliseconds.
    #[arg(long = "picard-timeout")]
    pub picard_timeout: Option<u64>,

    /// Retry attempts for a timed-out downstream command.
    #[arg(long = "picard-retries")]
    pub picard_retries: Option<u32>,

    /// Downstream transport read timeout, milliseconds.
    #[arg(long = "read-timeout")]
    pub read_timeout: Option<u64>,

    /// Enable serial hardware flow control.
    #[arg(long = "flow-control")]
    pub flow_control: bool,

    /// Minimum log level (error, warn, info, debug, trace).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Log file path; stdout when omitted.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Number of rotated log backups to retain.
    #[arg(long = "log-num-backups")]
    pub log_num_backups: Option<u32>,

    /// Log file size (bytes) that triggers rotation.
    #[arg(long = "log-max-size")]
    pub log_max_size: Option<u64>,

    /// Run as a background daemon. Out of scope (§1); accepted and logged.
    #[arg(long = "daemon")]
    pub daemon: bool,

    /// Service name to register with the OS service manager. Out of scope
    /// (§1); accepted and logged.
    #[arg(long = "service-name")]
    pub service_name: Option<String>,

    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,

    /// Working directory for relative paths.
    #[arg(long = "directory")]
    pub directory: Option<PathBuf>,
}

impl Cli {
    /// Merges CLI overrides onto a file-loaded `Config` (§4.9: "CLI flags
    /// override file values").
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(port) = &self.port {
            cfg.port = PeerPort::parse(port);
        }
        if let Some(listen) = self.listen {
            cfg.listen_port = listen;
        }
        if self.accept_anyhost {
            cfg.accept_anyhost = true;
        }
        if let Some(v) = self.rts_delay {
            cfg.rts_delay_ms = v;
        }
        if let Some(v) = self.picard_timeout {
            cfg.picard_timeout_ms = v;
        }
        if let Some(v) = self.picard_retries {
            cfg.picard_retries = v;
        }
        if let Some(v) = self.read_timeout {
            cfg.read_timeout_ms = v;
        }
        if self.flow_control {
            cfg.flow_control = true;
        }
        if let Some(level) = &self.log_level {
            cfg.logging.level = level.clone();
        }
        if let Some(path) = &self.log_file {
            cfg.logging.file = Some(path.clone());
        }
        if let Some(n) = self.log_num_backups {
            cfg.logging.num_backups = n;
        }
        if let Some(n) = self.log_max_size {
            cfg.logging.max_size_bytes = n;
        }
        if self.daemon {
            cfg.service.daemon = true;
        }
        if let Some(name) = &self.service_name {
            cfg.service.service_name = Some(name.clone());
        }
        if let Some(dir) = &self.directory {
            cfg.directory = Some(dir.clone());
        }
    }
}

/// Parses argv, loads the config file named by `--config/-c` (or the
/// process's default path), applies CLI overrides, and validates the
/// result. Configuration errors are fatal (§7 "Configuration errors").
pub fn load_config_from_args<I, T>(args: I) -> Result<Config>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let config_path = cli.config.clone().unwrap_or_else(|| "config.yaml".to_string());
    let resolved = resolve_config_path(&config_path)
        .with_context(|| format!("resolving config path {config_path}"))?;
    let mut cfg = Config::load_from_file(&resolved)
        .with_context(|| format!("loading config from {}", resolved.display()))?;
    cli.apply(&mut cfg);
    cfg.validate_and_normalize()?;
    Ok(cfg)
}
