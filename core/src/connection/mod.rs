/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod mock;
pub mod port;

use std::time::Duration;

use log::debug;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::connection::port::DevicePort;
use crate::error::{Error, Result};

/// Cancellation-aware wrapper around a [`DevicePort`].
///
/// All protocol traffic goes through this type. Each read carries its own
/// timeout, and every suspension point observes the cancellation token, so a
/// stop request is seen within one read's latency. Cancellation is only
/// checked between whole writes and reads, never inside them, which keeps the
/// transport from being abandoned mid-frame.
pub struct Connection {
    pub port: Box<dyn DevicePort>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(port: Box<dyn DevicePort>) -> Self {
        Connection { port, cancel: CancellationToken::new() }
    }

    pub fn with_cancel(port: Box<dyn DevicePort>, cancel: CancellationToken) -> Self {
        Connection { port, cancel }
    }

    /// Token observed by every blocking helper on this connection.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }

    pub async fn open(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.port.open().await
    }

    pub async fn close(&mut self) -> Result<()> {
        // Closing is part of cleanup and must still work after cancellation.
        self.port.close().await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.port.write_all(data).await?;
        self.port.flush().await
    }

    /// Reads exactly `buf.len()` bytes within `wait`.
    pub async fn read_exact_timeout(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize> {
        self.ensure_live()?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            read = timeout(wait, self.port.read_exact(buf)) => match read {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout(wait)),
            },
        }
    }

    /// Reads a single byte within `wait`.
    pub async fn read_byte(&mut self, wait: Duration) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_timeout(&mut buf, wait).await?;
        Ok(buf[0])
    }

    /// Reads whatever the device has pending, up to `max` bytes, polling
    /// until `wait` elapses. An empty result means the device stayed silent.
    pub async fn read_available(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            self.ensure_live()?;

            let chunk = self.port.read_available(max).await?;
            if !chunk.is_empty() {
                debug!("[RX] {} bytes: {}", chunk.len(), hex::encode(&chunk));
                return Ok(chunk);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(2)) => {}
            }
        }
    }

    /// Cancellable sleep, used for settle and backoff intervals.
    pub async fn sleep(&self, wait: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
