/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Protocol-level variants abort the current multi-step flow and surface as
/// one user-facing failure; callers that treat a sub-step as non-critical
/// (baud change, a single info probe) catch and log instead of propagating.
#[derive(Error, Debug)]
pub enum Error {
    /// Opening or re-opening the device transport failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bad delimiters or a truncated frame on the Spreadtrum link.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Frame trailer did not match the recomputed checksum.
    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{got:04X}")]
    ChecksumMismatch { expected: u16, got: u16 },

    /// The device answered with something other than what the protocol
    /// requires at this point.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A read did not complete within its per-call timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled through the cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Missing or invalid FDL/DA paths, addresses or profile fields.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    pub fn conn(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }

    pub fn proto(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
