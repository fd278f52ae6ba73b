/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use async_trait::async_trait;

use crate::error::Result;

/// Spreadtrum boot-ROM USB identity. A port backend matching these IDs talks
/// the BSL protocol handled by [`crate::sprd`].
pub const SPRD_BOOT_VID: u16 = 0x1782;
pub const SPRD_BOOT_PID: u16 = 0x4D00;

/// MediaTek port identities, in (vid, pid) form. 0x0003 is the bare boot-ROM,
/// 0x2000/0x2001 are preloader-stage virtual serial ports.
pub const MTK_KNOWN_PORTS: [(u16, u16); 3] =
    [(0x0E8D, 0x0003), (0x0E8D, 0x2000), (0x0E8D, 0x2001)];

/// Raw byte transport to a device in boot-ROM or boot-loader stage.
///
/// This is the external boundary of the crate: implementations own the USB
/// endpoint or serial port and are expected to present it as an already
/// enumerated byte stream. The protocol engines never look below this trait.
#[async_trait]
pub trait DevicePort: Send {
    /// Opens (or re-opens) the underlying transport.
    async fn open(&mut self) -> Result<()>;

    /// Closes the transport. Must be safe to call when already closed.
    async fn close(&mut self) -> Result<()>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Reads exactly `buf.len()` bytes, blocking until the transport
    /// delivers them or fails.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reads whatever the device has pending, up to `max` bytes. Returns an
    /// empty buffer when nothing is available.
    async fn read_available(&mut self, max: usize) -> Result<Vec<u8>>;

    async fn flush(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn port_name(&self) -> String;
}
