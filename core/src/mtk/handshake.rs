/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use log::{debug, info};

use crate::connection::Connection;
use crate::error::{Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// The two sync exchanges establishing boot-ROM communication:
/// `0xA0 -> 0x5F`, then `0x0A -> 0xF5`.
const SYNC_STEPS: [(u8, u8); 2] = [(0xA0, 0x5F), (0x0A, 0xF5)];

/// Performs the two-byte boot-ROM sync. Any mismatch or short read is fatal
/// for this session; the device is not in a state worth talking to.
pub async fn brom_handshake(conn: &mut Connection) -> Result<()> {
    info!("Starting boot ROM handshake...");

    for (tx, expected) in SYNC_STEPS {
        conn.write_all(&[tx]).await?;

        let got = match conn.read_byte(HANDSHAKE_TIMEOUT).await {
            Ok(b) => b,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                return Err(Error::proto(format!(
                    "Handshake got no reply to 0x{:02X}: {}",
                    tx, e
                )));
            }
        };

        debug!("Handshake: sent 0x{:02X}, got 0x{:02X}", tx, got);
        if got != expected {
            return Err(Error::proto(format!(
                "Handshake failed: sent 0x{:02X}, expected 0x{:02X}, got 0x{:02X}",
                tx, expected, got
            )));
        }
    }

    info!("Handshake completed!");
    Ok(())
}
