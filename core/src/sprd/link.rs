/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use log::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::sprd::checksum::ChecksumMode;
use crate::sprd::frame::{self, FLAG};

const READ_CHUNK: usize = 4096;

/// Whether the link currently owns an open transport. Mutated only by
/// [`SprdLink::connect`] / [`SprdLink::disconnect`], never implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Synchronous command/response link to a Spreadtrum boot ROM or FDL.
///
/// One request is in flight at a time: a command is never sent before the
/// previous response (or its timeout) is resolved.
pub struct SprdLink {
    conn: Connection,
    state: ConnectionState,
    mode: ChecksumMode,
}

impl SprdLink {
    pub fn new(conn: Connection) -> Self {
        SprdLink { conn, state: ConnectionState::Disconnected, mode: ChecksumMode::Xmodem }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn checksum_mode(&self) -> ChecksumMode {
        self.mode
    }

    /// Switches the checksum used for all subsequent frames. The boot ROM
    /// speaks Xmodem; once FDL1 runs, the device expects the Fdl sum.
    pub fn set_checksum_mode(&mut self, mode: ChecksumMode) {
        debug!("Switching link checksum mode to {:?}", mode);
        self.mode = mode;
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.conn.open().await?;
        self.state = ConnectionState::Connected;
        debug!("Link connected on {}", self.conn.port.port_name());
        Ok(())
    }

    /// Idempotent; already being disconnected is only worth a warning.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            warn!("disconnect() called on an already disconnected link");
            return;
        }

        if let Err(e) = self.conn.close().await {
            warn!("Failed to close port cleanly: {}", e);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Sends one framed command and reads exactly one framed response.
    ///
    /// Framing, checksum and timeout failures are logged and reported as
    /// `Ok(None)` so the caller decides how to react; cancellation and a
    /// disconnected link are hard errors.
    pub async fn execute_command(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        if self.state != ConnectionState::Connected {
            return Err(Error::conn("Link is not connected"));
        }

        let request = frame::encode_frame(payload, self.mode);
        debug!("[TX] frame ({} bytes): {}", request.len(), hex::encode(&request));
        self.conn.write_all(&request).await?;

        let Some(raw) = self.read_frame(timeout).await? else {
            warn!("No response frame within {:?}", timeout);
            return Ok(None);
        };

        match frame::decode_frame(&raw, self.mode) {
            Ok(response) => Ok(Some(response)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!("Discarding undecodable response frame: {}", e);
                Ok(None)
            }
        }
    }

    /// Accumulates bytes until one complete `0x7E .. 0x7E` frame is seen or
    /// the timeout elapses.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::new();

        loop {
            if let Some(frame) = extract_frame(&buf) {
                return Ok(Some(frame));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                if !buf.is_empty() {
                    debug!("Partial frame at timeout: {}", hex::encode(&buf));
                }
                return Ok(None);
            }

            let chunk = self.conn.read_available(READ_CHUNK, deadline - now).await?;
            buf.extend_from_slice(&chunk);
        }
    }
}

/// Finds the first complete delimited frame in `buf`, including both flags.
fn extract_frame(buf: &[u8]) -> Option<Vec<u8>> {
    let start = buf.iter().position(|&b| b == FLAG)?;
    // The interior must be non-empty, so the closing flag is looked for
    // strictly after start + 1.
    let rest = buf.get(start + 2..)?;
    let end = rest.iter().position(|&b| b == FLAG)? + start + 2;
    Some(buf[start..=end].to_vec())
}
