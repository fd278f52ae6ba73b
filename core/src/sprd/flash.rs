/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::sync::Arc;
use std::time::Duration;

use log::{Level, debug, info};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::observer::Observer;
use crate::sprd::checksum::ChecksumMode;
use crate::sprd::cmds::{self, BslCommand, BslReply};
use crate::sprd::link::SprdLink;
use crate::sprd::profile::ChipsetProfile;

/// FDL payloads are streamed in chunks of this size, each one acknowledged
/// before the next is sent.
pub const FDL_CHUNK_SIZE: usize = 1024;

/// Identifier fragments a boot ROM may announce after a CONNECT ack.
const BOOT_ROM_SIGNATURES: [&str; 3] = ["SPRD", "Spreadtrum", "BTLD"];
/// Identifier fragments announced by a running FDL.
const FDL_SIGNATURES: [&str; 2] = ["FDL", "Spreadtrum"];

/// Where the bootstrap currently stands. `Failed` is reachable from every
/// other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashState {
    #[default]
    Idle,
    Connected,
    BootRomHandshook,
    Fdl1Loaded,
    Fdl1Running,
    Fdl1Handshook,
    Fdl2Loaded,
    BaudChanged,
    Done,
    Failed,
}

/// Linear state machine that boots a Spreadtrum device from its boot ROM
/// into a running FDL: handshake, load + execute FDL1, reconnect, FDL1
/// handshake, load + execute FDL2 (optional), baud change.
pub struct SprdFlashEngine {
    link: SprdLink,
    profile: ChipsetProfile,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
    state: FlashState,
    /// How long the device gets to re-enumerate as FDL1 after execution.
    settle: Duration,
    handshake_timeout: Duration,
    ack_timeout: Duration,
    /// Bulk chunk acknowledgments get more headroom than handshake reads.
    chunk_timeout: Duration,
}

impl SprdFlashEngine {
    pub fn new(mut link: SprdLink, profile: ChipsetProfile, observer: Arc<dyn Observer>) -> Self {
        let cancel = link.connection().cancel_token();
        SprdFlashEngine {
            link,
            profile,
            observer,
            cancel,
            state: FlashState::Idle,
            settle: Duration::from_millis(1500),
            handshake_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(1),
            chunk_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Cancelling this token stops the run within one chunk's latency.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, level: Level, msg: &str) {
        log::log!(level, "{}", msg);
        self.observer.log(level, msg);
    }

    /// Runs the whole bootstrap. The connection is released and the final
    /// busy/progress state reported no matter how the run ends.
    pub async fn run(&mut self) -> Result<()> {
        self.observer.busy(true);
        let result = self.run_inner().await;

        if self.link.is_connected() {
            self.link.disconnect().await;
        }

        match &result {
            Ok(()) => {
                self.state = FlashState::Done;
                self.observer.progress(100);
                self.emit(Level::Info, &format!("{}: loader bootstrap complete", self.profile.name));
            }
            Err(e) => {
                self.state = FlashState::Failed;
                self.observer.error("Loader bootstrap failed", Some(&e.to_string()));
            }
        }

        self.observer.busy(false);
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.link.connect().await?;
        self.state = FlashState::Connected;

        self.link.set_checksum_mode(ChecksumMode::Xmodem);
        self.handshake(&BOOT_ROM_SIGNATURES).await?;
        self.state = FlashState::BootRomHandshook;

        let fdl1 = self
            .profile
            .fdl1
            .clone()
            .ok_or_else(|| Error::config("Profile has no FDL1 image"))?;
        let fdl1_data = fdl1.load().await?;

        self.load_stage(&fdl1_data, fdl1.addr).await?;
        self.state = FlashState::Fdl1Loaded;
        self.exec_stage(fdl1.addr).await?;
        self.state = FlashState::Fdl1Running;

        // FDL1 re-enumerates the device; reconnect failure means it never
        // came up and there is nothing to talk to anymore.
        self.emit(Level::Info, "Reconnecting to FDL1...");
        self.link.disconnect().await;
        self.link.connection().sleep(self.settle).await?;
        self.link
            .connect()
            .await
            .map_err(|e| Error::conn(format!("FDL1 did not come back up: {}", e)))?;

        self.link.set_checksum_mode(ChecksumMode::Fdl);
        self.handshake(&FDL_SIGNATURES).await?;
        self.state = FlashState::Fdl1Handshook;

        match self.profile.fdl2.clone() {
            Some(fdl2) => {
                let fdl2_data = fdl2.load().await?;
                self.load_stage(&fdl2_data, fdl2.addr).await?;
                self.state = FlashState::Fdl2Loaded;
                self.exec_stage(fdl2.addr).await?;
            }
            None => {
                self.emit(Level::Warn, "No FDL2 configured, skipping second stage");
            }
        }

        if let Err(e) = self.change_baud().await {
            if matches!(e, Error::Cancelled) {
                return Err(e);
            }
            // The loader is already up at this point; a refused baud change
            // is not worth failing the whole run over.
            self.emit(Level::Warn, &format!("Baud change refused: {}", e));
        }
        self.state = FlashState::BaudChanged;

        Ok(())
    }

    /// CONNECT round trip. The reply may carry an ASCII identifier beyond
    /// the 4-byte header; an unexpected one is reported but not fatal.
    async fn handshake(&mut self, signatures: &[&str]) -> Result<()> {
        let body =
            self.command_expect_ack(BslCommand::Connect, &[], self.handshake_timeout, "CONNECT").await?;

        let ident = String::from_utf8_lossy(&body);
        let ident = ident.trim_matches('\0').trim();
        if !ident.is_empty() {
            let lowered = ident.to_ascii_lowercase();
            if signatures.iter().any(|s| lowered.contains(&s.to_ascii_lowercase())) {
                self.emit(Level::Info, &format!("Device identifies as \"{}\"", ident));
            } else {
                self.emit(
                    Level::Warn,
                    &format!("Unexpected device identifier \"{}\", continuing anyway", ident),
                );
            }
        }

        Ok(())
    }

    /// Streams one FDL stage: START_DATA, ack-gated 1 KiB chunks, END_DATA.
    /// A missing or wrong ack aborts immediately; there is no per-chunk
    /// retry at this protocol level.
    async fn load_stage(&mut self, data: &[u8], addr: u32) -> Result<()> {
        let total = data.len();
        info!("Loading {} byte stage at 0x{:08X}", total, addr);

        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&addr.to_be_bytes());
        params.extend_from_slice(&(total as u32).to_be_bytes());
        self.command_expect_ack(BslCommand::StartData, &params, self.ack_timeout, "START_DATA")
            .await?;

        let mut sent = 0usize;
        for chunk in data.chunks(FDL_CHUNK_SIZE) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut packet = Vec::with_capacity(2 + chunk.len());
            packet.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            packet.extend_from_slice(chunk);
            self.command_expect_ack(BslCommand::MidstData, &packet, self.chunk_timeout, "MIDST_DATA")
                .await?;

            sent += chunk.len();
            self.observer.progress((sent * 100 / total) as u8);
            debug!("Sent {}/{} bytes", sent, total);
        }

        self.command_expect_ack(BslCommand::EndData, &[], self.ack_timeout, "END_DATA").await?;
        Ok(())
    }

    async fn exec_stage(&mut self, addr: u32) -> Result<()> {
        info!("Executing stage at 0x{:08X}", addr);
        self.command_expect_ack(BslCommand::ExecData, &addr.to_be_bytes(), self.ack_timeout, "EXEC_DATA")
            .await?;
        Ok(())
    }

    async fn change_baud(&mut self) -> Result<()> {
        info!("Requesting baud change to {}", self.profile.baud);
        self.command_expect_ack(
            BslCommand::ChangeBaud,
            &self.profile.baud.to_be_bytes(),
            self.ack_timeout,
            "CHANGE_BAUD",
        )
        .await?;
        Ok(())
    }

    /// Sends a command and requires an ACK reply, returning the reply body.
    async fn command_expect_ack(
        &mut self,
        cmd: BslCommand,
        params: &[u8],
        timeout: Duration,
        what: &str,
    ) -> Result<Vec<u8>> {
        let packet = cmds::command_packet(cmd, params);

        let Some(payload) = self.link.execute_command(&packet, timeout).await? else {
            return Err(Error::proto(format!("{}: no valid response", what)));
        };

        let Some((code, body)) = cmds::split_response(&payload) else {
            return Err(Error::proto(format!(
                "{}: response too short ({} bytes)",
                what,
                payload.len()
            )));
        };

        if code != BslReply::Ack as u16 {
            let reply = BslReply::try_from(code)
                .map(|r| format!("{:?}", r))
                .unwrap_or_else(|_| format!("0x{:04X}", code));
            return Err(Error::proto(format!("{}: expected ACK, got {}", what, reply)));
        }

        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::connection::mock::{MockPort, MockPortHandle};
    use crate::observer::NullObserver;
    use crate::observer::test_support::RecordingObserver;
    use crate::sprd::frame;

    fn ack_frame(mode: ChecksumMode) -> Vec<u8> {
        frame::encode_frame(&[0x00, 0x80, 0x00, 0x00], mode)
    }

    fn ack_frame_with_ident(mode: ChecksumMode, ident: &str) -> Vec<u8> {
        let mut payload = vec![0x00, 0x80];
        payload.extend_from_slice(&(ident.len() as u16).to_be_bytes());
        payload.extend_from_slice(ident.as_bytes());
        frame::encode_frame(&payload, mode)
    }

    fn fast_engine(port: MockPort, profile: ChipsetProfile) -> SprdFlashEngine {
        let link = SprdLink::new(Connection::new(Box::new(port)));
        let mut engine =
            SprdFlashEngine::new(link, profile, Arc::new(NullObserver)).with_settle(Duration::from_millis(5));
        engine.handshake_timeout = Duration::from_millis(30);
        engine.ack_timeout = Duration::from_millis(30);
        engine.chunk_timeout = Duration::from_millis(30);
        engine
    }

    fn decoded_writes(handle: &MockPortHandle, mode: ChecksumMode) -> Vec<Vec<u8>> {
        handle
            .writes()
            .iter()
            .map(|w| frame::decode_frame(w, mode).expect("engine wrote a malformed frame"))
            .collect()
    }

    #[tokio::test]
    async fn stage_upload_chunks_and_acks() {
        let port = MockPort::new();
        let handle = port.handles();
        // START_DATA + 3 chunks + END_DATA, each acked
        for _ in 0..5 {
            handle.queue_read(&ack_frame(ChecksumMode::Xmodem));
        }

        let mut engine = fast_engine(port, ChipsetProfile::new("test"));
        engine.link.connect().await.unwrap();

        let payload = vec![0xA5u8; 2500];
        engine.load_stage(&payload, 0x4000_0000).await.unwrap();

        let cmds_sent = decoded_writes(&handle, ChecksumMode::Xmodem);
        assert_eq!(cmds_sent.len(), 5);

        // START_DATA: addr + total length, both big-endian
        assert_eq!(cmds_sent[0][..4], [0x00, 0x01, 0x00, 0x08]);
        assert_eq!(cmds_sent[0][4..8], 0x4000_0000u32.to_be_bytes());
        assert_eq!(cmds_sent[0][8..12], 2500u32.to_be_bytes());

        // Exactly three MIDST_DATA chunks of 1024, 1024 and 452 bytes
        for (i, expected) in [(1usize, 1024u16), (2, 1024), (3, 452)] {
            assert_eq!(cmds_sent[i][..2], [0x00, 0x02], "chunk {} is not MIDST_DATA", i);
            let chunk_len = u16::from_be_bytes([cmds_sent[i][4], cmds_sent[i][5]]);
            assert_eq!(chunk_len, expected);
            assert_eq!(cmds_sent[i].len(), 4 + 2 + expected as usize);
        }

        assert_eq!(cmds_sent[4][..4], [0x00, 0x03, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn withheld_chunk_ack_stops_the_stream() {
        let port = MockPort::new();
        let handle = port.handles();
        // START_DATA and first chunk acked, second chunk ack withheld
        handle.queue_read(&ack_frame(ChecksumMode::Xmodem));
        handle.queue_read(&ack_frame(ChecksumMode::Xmodem));

        let mut engine = fast_engine(port, ChipsetProfile::new("test"));
        engine.link.connect().await.unwrap();

        let payload = vec![0x5Au8; 2500];
        let res = engine.load_stage(&payload, 0x4000_0000).await;
        assert!(matches!(res, Err(Error::Protocol(_))));

        // START_DATA + chunk 1 + chunk 2; the third chunk must never leave
        let cmds_sent = decoded_writes(&handle, ChecksumMode::Xmodem);
        assert_eq!(cmds_sent.len(), 3);
        assert_eq!(cmds_sent[2][..2], [0x00, 0x02]);
    }

    #[tokio::test]
    async fn cancellation_is_observed_mid_stage() {
        let port = MockPort::new();
        let handle = port.handles();
        handle.queue_read(&ack_frame(ChecksumMode::Xmodem)); // START_DATA
        handle.queue_read(&ack_frame(ChecksumMode::Xmodem)); // chunk 1

        let mut engine = fast_engine(port, ChipsetProfile::new("test"));
        engine.link.connect().await.unwrap();

        // Cancel after the first chunk ack is consumed: the loop must notice
        // before sending the next chunk.
        let token = engine.cancel_token();
        let payload = vec![0xEEu8; 4096];

        // Queue no further acks; cancel from a parallel task while the
        // engine waits on the (never answered) second chunk.
        let waiter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let res = engine.load_stage(&payload, 0x0).await;
        waiter.await.unwrap();
        assert!(matches!(res, Err(Error::Cancelled) | Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn reconnect_failure_after_fdl1_is_fatal() {
        let fdl1_path = std::env::temp_dir().join("antumbra_test_fdl1_reconnect.bin");
        std::fs::write(&fdl1_path, vec![0x22u8; 100]).unwrap();

        let port = MockPort::new();
        let handle = port.handles();
        // CONNECT, START, one chunk, END, EXEC all acked
        for _ in 0..5 {
            handle.queue_read(&ack_frame(ChecksumMode::Xmodem));
        }
        // The device never re-enumerates as FDL1
        handle.fail_next_opens(1);

        let profile = ChipsetProfile::new("SC7731E").with_fdl1(&fdl1_path, 0x1000);
        let mut engine = fast_engine(port, profile);

        let res = engine.run().await;
        assert!(matches!(res, Err(Error::Connection(_))));
        assert_eq!(engine.state(), FlashState::Failed);

        std::fs::remove_file(&fdl1_path).ok();
    }

    #[tokio::test]
    async fn full_run_without_fdl2_skips_and_still_changes_baud() {
        let _ = env_logger::builder().is_test(true).try_init();

        // FDL1 binary on disk, 1500 bytes -> two chunks
        let fdl1_path = std::env::temp_dir().join("antumbra_test_fdl1.bin");
        std::fs::write(&fdl1_path, vec![0x11u8; 1500]).unwrap();

        let port = MockPort::new();
        let handle = port.handles();
        // Boot ROM stage (Xmodem mode): CONNECT, START, chunk, chunk, END, EXEC
        handle.queue_read(&ack_frame_with_ident(ChecksumMode::Xmodem, "SPRD3"));
        for _ in 0..5 {
            handle.queue_read(&ack_frame(ChecksumMode::Xmodem));
        }
        // FDL1 stage (Fdl mode): CONNECT, CHANGE_BAUD
        handle.queue_read(&ack_frame_with_ident(ChecksumMode::Fdl, "FDL1"));
        handle.queue_read(&ack_frame(ChecksumMode::Fdl));

        let profile = ChipsetProfile::new("SC9863A")
            .with_fdl1(&fdl1_path, 0x5500)
            .with_baud(921_600);

        let observer = Arc::new(RecordingObserver::default());
        let link = SprdLink::new(Connection::new(Box::new(port)));
        let mut engine = SprdFlashEngine::new(link, profile, observer.clone())
            .with_settle(Duration::from_millis(5));
        engine.handshake_timeout = Duration::from_millis(50);
        engine.ack_timeout = Duration::from_millis(50);
        engine.chunk_timeout = Duration::from_millis(50);

        engine.run().await.unwrap();
        assert_eq!(engine.state(), FlashState::Done);

        // 6 boot ROM frames in Xmodem mode, then 2 FDL frames
        let writes = handle.writes();
        assert_eq!(writes.len(), 8);
        let brom: Vec<_> =
            writes[..6].iter().map(|w| frame::decode_frame(w, ChecksumMode::Xmodem).unwrap()).collect();
        let fdl: Vec<_> =
            writes[6..].iter().map(|w| frame::decode_frame(w, ChecksumMode::Fdl).unwrap()).collect();

        // No MIDST_DATA or EXEC_DATA was issued after the FDL1 handshake
        assert!(fdl.iter().all(|p| p[..2] != [0x00, 0x02] && p[..2] != [0x00, 0x04]));
        // The baud change still went out, big-endian
        assert_eq!(fdl[1][..4], [0x00, 0x09, 0x00, 0x04]);
        assert_eq!(fdl[1][4..8], 921_600u32.to_be_bytes());
        // EXEC_DATA targeted the FDL1 address only
        assert_eq!(brom[5][..2], [0x00, 0x04]);
        assert_eq!(brom[5][4..8], 0x5500u32.to_be_bytes());

        // The skip was surfaced to the observer
        let messages = observer.messages.lock().unwrap();
        assert!(messages.iter().any(|(l, m)| *l == Level::Warn && m.contains("FDL2")));

        std::fs::remove_file(&fdl1_path).ok();
    }

    #[tokio::test]
    async fn failed_handshake_fails_the_run() {
        let port = MockPort::new();
        // No response at all to CONNECT
        let profile = ChipsetProfile::new("dead").with_fdl1("/nonexistent/fdl1.bin", 0x0);
        let mut engine = fast_engine(port, profile);

        let res = engine.run().await;
        assert!(res.is_err());
        assert_eq!(engine.state(), FlashState::Failed);
    }
}
