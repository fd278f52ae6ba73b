/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{Level, debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::observer::Observer;

/// Anything smaller than this cannot be a real Download Agent.
pub const DA_MIN_SIZE: usize = 256;

/// Where the boot ROM wants the DA staged.
pub const DA_DEFAULT_LOAD_ADDR: u32 = 0x0020_1000;

/// Payload chunk size during the unacknowledged bulk phase.
pub const DA_CHUNK_SIZE: usize = 1024;

/// Upload progress is scaled into this slice of the overall run.
const PROGRESS_START: u8 = 40;
const PROGRESS_END: u8 = 90;

const SYNC_ATTEMPTS: u32 = 3;
const SYNC_TIMEOUT: Duration = Duration::from_millis(500);
const SYNC_PRE_DELAY: Duration = Duration::from_millis(50);
const SYNC_BACKOFF: Duration = Duration::from_millis(300);
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(2);
const RESULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte the device answers a sync request with when it is ready for a DA.
const SYNC_READY: u8 = 0x5F;
/// Byte the device answers with when a DA is already running.
const SYNC_ALREADY_RUNNING: u8 = 0xA1;
/// Header acknowledgment.
const HEADER_ACK: u8 = 0xA1;
/// Execution results that count as success.
const EXEC_OK: [u8; 3] = [0xE0, 0xC0, 0xA1];

/// A Download Agent binary as handed in by the caller.
#[derive(Debug, Clone)]
pub struct DaFile {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

impl DaFile {
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        DaFile { path: path.into(), data }
    }

    /// Reads and validates a DA from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;

        let da = DaFile { path: path.to_path_buf(), data };
        da.validate()?;
        Ok(da)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.len() < DA_MIN_SIZE {
            return Err(Error::config(format!(
                "DA file {} is only {} bytes (minimum {})",
                self.path.display(),
                self.data.len(),
                DA_MIN_SIZE
            )));
        }
        Ok(())
    }

    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// Pushes a Download Agent into device RAM: sync, header, unacknowledged
/// chunked payload, execution-result check.
pub struct DaUploader {
    observer: Arc<dyn Observer>,
    load_addr: u32,
}

impl DaUploader {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        DaUploader { observer, load_addr: DA_DEFAULT_LOAD_ADDR }
    }

    pub fn with_load_addr(mut self, addr: u32) -> Self {
        self.load_addr = addr;
        self
    }

    fn emit(&self, level: Level, msg: &str) {
        log::log!(level, "{}", msg);
        self.observer.log(level, msg);
    }

    /// Runs the whole upload. Returns `Ok(false)` when the device reported a
    /// DA already running and nothing was transferred.
    pub async fn upload(&self, conn: &mut Connection, da: &DaFile) -> Result<bool> {
        da.validate()?;

        if !self.sync(conn).await? {
            self.emit(Level::Info, "DA already running, skipping upload");
            return Ok(false);
        }

        self.send_header(conn, da.data.len() as u32).await?;
        self.send_payload(conn, &da.data).await?;
        self.check_result(conn).await?;

        self.emit(Level::Info, &format!("DA {} uploaded and running", da.file_name()));
        Ok(true)
    }

    /// Up to three sync attempts with backoff. `Ok(true)` means the device
    /// is ready to receive; `Ok(false)` means a DA is already running.
    async fn sync(&self, conn: &mut Connection) -> Result<bool> {
        for attempt in 1..=SYNC_ATTEMPTS {
            conn.sleep(SYNC_PRE_DELAY).await?;
            conn.write_all(&[0xA0]).await?;

            match conn.read_byte(SYNC_TIMEOUT).await {
                Ok(SYNC_READY) => {
                    debug!("DA sync acknowledged on attempt {}", attempt);
                    return Ok(true);
                }
                Ok(SYNC_ALREADY_RUNNING) => return Ok(false),
                Ok(other) => {
                    warn!("DA sync attempt {} got unexpected 0x{:02X}", attempt, other);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("DA sync attempt {} got no response: {}", attempt, e);
                }
            }

            if attempt < SYNC_ATTEMPTS {
                conn.sleep(SYNC_BACKOFF).await?;
            }
        }

        Err(Error::proto(format!("Device did not sync after {} attempts", SYNC_ATTEMPTS)))
    }

    /// 8-byte header: load address then payload size. Unlike the Spreadtrum
    /// protocol's explicit big-endian fields, this header travels in the
    /// transport's native byte order.
    async fn send_header(&self, conn: &mut Connection, size: u32) -> Result<()> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&self.load_addr.to_ne_bytes());
        header[4..].copy_from_slice(&size.to_ne_bytes());

        debug!("DA header: addr=0x{:08X}, size={}", self.load_addr, size);
        conn.write_all(&header).await?;

        let ack = conn.read_byte(SYNC_TIMEOUT).await.map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::proto(format!("No header acknowledgment: {}", other)),
        })?;

        if ack != HEADER_ACK {
            return Err(Error::proto(format!(
                "Header rejected: expected 0x{:02X}, got 0x{:02X}",
                HEADER_ACK, ack
            )));
        }

        Ok(())
    }

    /// Streams the payload in 1 KiB chunks. No acknowledgment is expected
    /// per chunk; a minimal delay keeps slower boot ROMs from overrunning.
    async fn send_payload(&self, conn: &mut Connection, data: &[u8]) -> Result<()> {
        let total = data.len();
        let mut sent = 0usize;
        let span = (PROGRESS_END - PROGRESS_START) as usize;

        for chunk in data.chunks(DA_CHUNK_SIZE) {
            conn.write_all(chunk).await?;
            sent += chunk.len();

            self.observer.progress(PROGRESS_START + (sent * span / total) as u8);
            conn.sleep(INTER_CHUNK_DELAY).await?;
        }

        debug!("DA payload sent: {} bytes", total);
        Ok(())
    }

    async fn check_result(&self, conn: &mut Connection) -> Result<()> {
        let result = conn.read_byte(RESULT_TIMEOUT).await.map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::proto(format!("No execution result: {}", other)),
        })?;

        if !EXEC_OK.contains(&result) {
            return Err(Error::proto(format!("DA execution failed with 0x{:02X}", result)));
        }

        debug!("DA execution result: 0x{:02X}", result);
        Ok(())
    }
}
