// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::protocol::{
    CLIENT_AUTH_TIMEOUT_MS, DEFAULT_COMMAND_RETRIES, DEFAULT_COMMAND_TIMEOUT_MS, READ_TIMEOUT_MS,
};

/// Where the downstream manager lives: a serial device path, or a numeric
/// UDP port on loopback (§1, §6 — `--port/-p` accepts either syntax).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerPort {
    Serial(String),
    Udp(u16),
}

impl PeerPort {
    /// Parses the `--port/-p` CLI syntax: a bare integer is a UDP port,
    /// anything else is a serial device path.
    pub fn parse(s: &str) -> Self {
        match s.parse::<u16>() {
            Ok(port) => PeerPort::Udp(port),
            Err(_) => PeerPort::Serial(s.to_string()),
        }
    }
}

impl std::fmt::Display for PeerPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerPort::Serial(path) => write!(f, "{path}"),
            PeerPort::Udp(port) => write!(f, "udp:{port}"),
        }
    }
}

/// Logging knobs (§6 `--log-level`, `--log-file`, `--log-num-backups`,
/// `--log-max-size`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Absent means stdout.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_log_num_backups")]
    pub num_backups: u32,
    #[serde(default = "default_log_max_size")]
    pub max_size_bytes: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_num_backups() -> u32 {
    5
}

fn default_log_max_size() -> u64 {
    10 * 1024 * 1024
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            num_backups: default_log_num_backups(),
            max_size_bytes: default_log_max_size(),
        }
    }
}

/// OS service/daemon wrapper knobs. Out of scope per §1 — plumbed
/// through and logged, never acted on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub daemon: bool,
    #[serde(default)]
    pub service_name: Option<String>,
}

/// The multiplexer's full runtime configuration: everything the CLI surface
/// in §6 can set, loadable from a YAML file via `--config/-c` and
/// overridable by individual flags (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Downstream manager transport (`--port/-p`).
    pub port: PeerPort,
    /// TCP port clients connect to (`--listen/-l`).
    pub listen_port: u16,
    /// Bind all interfaces instead of loopback only (`--accept-anyhost`).
    #[serde(default)]
    pub accept_anyhost: bool,
    /// RTS assertion delay in milliseconds for serial transports
    /// (`--rts-delay`); meaningless for UDP. Transport setup itself is out
    /// of scope (§1) — this is plumbed to whatever constructs the
    /// `Transport` for the caller.
    #[serde(default)]
    pub rts_delay_ms: u64,
    /// In-flight downstream command timeout (`--picard-timeout`).
    #[serde(default = "default_picard_timeout_ms")]
    pub picard_timeout_ms: u64,
    /// Retry attempts for a timed-out downstream command
    /// (`--picard-retries`).
    #[serde(default = "default_picard_retries")]
    pub picard_retries: u32,
    /// Downstream transport read timeout (`--read-timeout`).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Enables serial hardware flow control (`--flow-control`); meaningless
    /// for UDP.
    #[serde(default)]
    pub flow_control: bool,
    /// Client auth timeout in milliseconds (not on the CLI surface; fixed
    /// by the protocol, kept configurable for tests).
    #[serde(default = "default_auth_timeout_ms")]
    pub client_auth_timeout_ms: u64,
    /// Shared secret every `MUX_HELLO` must present (§4.5).
    pub auth_token: [u8; 8],
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    /// Working directory for relative paths (`--directory`).
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_picard_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

fn default_picard_retries() -> u32 {
    DEFAULT_COMMAND_RETRIES
}

fn default_read_timeout_ms() -> u64 {
    READ_TIMEOUT_MS
}

fn default_auth_timeout_ms() -> u64 {
    CLIENT_AUTH_TIMEOUT_MS
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants not expressible in the type system.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.listen_port != 0, "listen_port must be nonzero");
        ensure!(self.picard_retries >= 1, "picard_retries must be >= 1");
        ensure!(self.read_timeout_ms > 0, "read_timeout_ms must be > 0");
        ensure!(self.picard_timeout_ms > 0, "picard_timeout_ms must be > 0");
        Ok(())
    }
}
