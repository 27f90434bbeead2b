// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the multiplexer.
//!
//! Transient, locally-absorbed failures (bad FCS, a response seq that
//! doesn't match the in-flight command) are represented as typed
//! [`ProtocolError`] / [`FramingError`] values so callers can match on them
//! and decide whether to drop-and-continue or escalate. Anything that leaves
//! the downstream session in an unknown state is widened to
//! [`anyhow::Error`] at the task boundary and handled by triggering a
//! connection reset.

use thiserror::Error;

/// Errors raised while decoding the downstream HDLC/PDU framing.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("FCS check failed")]
    BadFcs,
}

/// Errors raised while interpreting a downstream frame that decoded cleanly
/// but violates the protocol (§7 "Protocol errors").
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload length {got} does not match header len {expected}")]
    LengthMismatch { expected: u8, got: usize },
    #[error("response seq {got} does not match in-flight seq {expected}")]
    SequenceMismatch { expected: u8, got: u8 },
}

/// Errors that cause a client connection to be rejected or closed (§7
/// "Client errors"). These never escalate to a global reset.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("bad MUX_HELLO: expected {expected} bytes, got {got}")]
    BadHelloLength { expected: usize, got: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid auth token")]
    InvalidAuth,
    #[error("auth timer expired before a valid hello")]
    AuthTimeout,
}

/// Errors raised while loading and validating configuration (§7
/// "Configuration errors" — fatal, reported to stderr, exit 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
