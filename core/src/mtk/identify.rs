/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mtk::chips::{self, GENERIC_BROM_NAME, SERIES_KEYWORDS};

/// Default per-probe response window.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

const PROBE_RESPONSE_MAX: usize = 64;

const STANDARD_PROBE: [u8; 2] = [0xFD, 0xD0];

/// Extended probes, tried in order; the first one yielding at least two
/// response bytes wins.
const EXTENDED_PROBES: [(&str, [u8; 2]); 3] = [
    ("DA_Identification", [0xDA, 0xDA]),
    ("Secure_Chip_ID", [0xA5, 0x5A]),
    ("Factory_Mode", [0xF0, 0x0F]),
];

const BOOTROM_PROBE: &[u8] = b"MTkl";

/// Which strategy produced a [`DetectionResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSource {
    Standard,
    Extended { command: &'static str },
    BootRom,
}

/// One probe's verdict about the chip on the other end.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Resolved chip name, or `Unknown_0x%04X` (optionally with a series
    /// suffix), or [`GENERIC_BROM_NAME`].
    pub chip_name: String,
    pub hw_code: u16,
    /// Raw response bytes, hex encoded, for logs and ranking.
    pub raw_hex: String,
    pub source: ProbeSource,
    pub verified: bool,
    pub notes: Option<String>,
    pub error: Option<String>,
}

impl DetectionResult {
    fn failed(source: ProbeSource, error: impl Into<String>) -> Self {
        DetectionResult {
            chip_name: "Unknown".to_string(),
            hw_code: 0,
            raw_hex: String::new(),
            source,
            verified: false,
            notes: None,
            error: Some(error.into()),
        }
    }

    fn from_code(source: ProbeSource, code: u16, raw: &[u8]) -> Self {
        let tail = if raw.len() > 2 { &raw[2..] } else { &[][..] };
        let (chip_name, recognized, notes) = chips::resolve(code, tail);
        DetectionResult {
            chip_name,
            hw_code: code,
            raw_hex: hex::encode(raw),
            source,
            verified: recognized,
            notes,
            error: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.chip_name.starts_with("Unknown")
    }

    pub fn is_generic_brom(&self) -> bool {
        self.chip_name == GENERIC_BROM_NAME
    }

    fn has_series_keyword(&self) -> bool {
        SERIES_KEYWORDS.iter().any(|kw| {
            self.chip_name.contains(kw)
                || self.notes.as_deref().is_some_and(|n| n.contains(kw))
        })
    }

    fn response_len(&self) -> usize {
        self.raw_hex.len() / 2
    }
}

/// Writes a probe and collects whatever the device answers within `wait`.
async fn exchange(conn: &mut Connection, probe: &[u8], wait: Duration) -> Result<Vec<u8>> {
    conn.write_all(probe).await?;
    conn.read_available(PROBE_RESPONSE_MAX, wait).await
}

async fn probe_standard(conn: &mut Connection, wait: Duration) -> Result<DetectionResult> {
    let resp = match exchange(conn, &STANDARD_PROBE, wait).await {
        Ok(r) => r,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => return Ok(DetectionResult::failed(ProbeSource::Standard, e.to_string())),
    };

    if resp.len() < 2 {
        return Ok(DetectionResult::failed(
            ProbeSource::Standard,
            format!("Short response: {} bytes", resp.len()),
        ));
    }

    let code = u16::from_le_bytes([resp[0], resp[1]]);
    Ok(DetectionResult::from_code(ProbeSource::Standard, code, &resp))
}

async fn probe_extended(conn: &mut Connection, wait: Duration) -> Result<DetectionResult> {
    for (name, probe) in EXTENDED_PROBES {
        let resp = match exchange(conn, &probe, wait).await {
            Ok(r) => r,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                debug!("Extended probe {} failed: {}", name, e);
                continue;
            }
        };

        if resp.len() >= 2 {
            let code = u16::from_le_bytes([resp[0], resp[1]]);
            return Ok(DetectionResult::from_code(
                ProbeSource::Extended { command: name },
                code,
                &resp,
            ));
        }

        debug!("Extended probe {} got {} bytes, trying next", name, resp.len());
    }

    Ok(DetectionResult::failed(
        ProbeSource::Extended { command: "exhausted" },
        "No extended probe answered",
    ))
}

async fn probe_bootrom(conn: &mut Connection, wait: Duration) -> Result<DetectionResult> {
    let resp = match exchange(conn, BOOTROM_PROBE, wait).await {
        Ok(r) => r,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => return Ok(DetectionResult::failed(ProbeSource::BootRom, e.to_string())),
    };

    let text = String::from_utf8_lossy(&resp);
    if text.contains("USB_DOWNLOAD_AGENT") || text.contains("BROM") {
        return Ok(DetectionResult {
            chip_name: GENERIC_BROM_NAME.to_string(),
            hw_code: 0,
            raw_hex: hex::encode(&resp),
            source: ProbeSource::BootRom,
            verified: true,
            notes: None,
            error: None,
        });
    }

    if resp.len() < 2 {
        return Ok(DetectionResult::failed(
            ProbeSource::BootRom,
            format!("Short response: {} bytes", resp.len()),
        ));
    }

    let code = u16::from_le_bytes([resp[0], resp[1]]);
    Ok(DetectionResult::from_code(ProbeSource::BootRom, code, &resp))
}

/// Runs all three probe strategies and arbitrates their results into one.
pub async fn identify_chip(conn: &mut Connection, wait: Duration) -> Result<DetectionResult> {
    let mut results = Vec::with_capacity(3);

    results.push(probe_standard(conn, wait).await?);
    results.push(probe_extended(conn, wait).await?);
    results.push(probe_bootrom(conn, wait).await?);

    for r in &results {
        debug!(
            "{:?}: {} (verified: {}, raw: {}, error: {:?})",
            r.source, r.chip_name, r.verified, r.raw_hex, r.error
        );
    }

    let winner = arbitrate(results);
    match &winner.error {
        None => info!("Chip identified: {} (0x{:04X})", winner.chip_name, winner.hw_code),
        Some(e) => warn!("Chip identification degraded: {} ({})", winner.chip_name, e),
    }

    Ok(winner)
}

/// Picks the first candidate with a strictly better key, so earlier probes
/// win ties and the outcome never depends on iteration accidents.
fn best_by<K: Ord, F: Fn(&DetectionResult) -> K>(
    results: &[DetectionResult],
    key: F,
) -> Option<DetectionResult> {
    let mut best: Option<&DetectionResult> = None;
    for r in results {
        match best {
            None => best = Some(r),
            Some(b) if key(r) > key(b) => best = Some(r),
            _ => {}
        }
    }
    best.cloned()
}

fn full_rank(r: &DetectionResult) -> (bool, bool, usize, bool) {
    (r.verified, r.has_series_keyword(), r.response_len(), r.error.is_none())
}

/// Deterministic arbitration over the probes' results, in priority order:
/// properly named verified results, then named results, then a verified
/// generic boot-ROM sighting, then unknowns with a series hint, then
/// whatever is left, flagged as uncertain.
pub fn arbitrate(results: Vec<DetectionResult>) -> DetectionResult {
    if results.is_empty() {
        return all_attempts_failed();
    }

    let named: Vec<DetectionResult> = results
        .iter()
        .filter(|r| !r.is_unknown() && !r.is_generic_brom())
        .cloned()
        .collect();

    // (1) verified, properly named
    let verified_named: Vec<DetectionResult> =
        named.iter().filter(|r| r.verified).cloned().collect();
    if let Some(winner) = best_by(&verified_named, full_rank) {
        return winner;
    }

    // (2) best named result
    if let Some(winner) = best_by(&named, full_rank) {
        return winner;
    }

    // (3) verified generic boot-ROM sighting
    if let Some(generic) = results.iter().find(|r| r.is_generic_brom() && r.verified) {
        return generic.clone();
    }

    // (4) unknown, but at least a series hint
    let hinted: Vec<DetectionResult> = results
        .iter()
        .filter(|r| r.is_unknown() && r.has_series_keyword())
        .cloned()
        .collect();
    if let Some(winner) = best_by(&hinted, |r| (r.response_len(), r.error.is_none())) {
        return winner;
    }

    // (5) best of the rest, flagged as uncertain
    let mut winner = best_by(&results, full_rank).expect("results are non-empty");
    winner.notes = Some(match winner.notes.take() {
        Some(n) => format!("{}; uncertain identification", n),
        None => "uncertain identification".to_string(),
    });
    winner
}

/// The canonical "nothing answered" result.
pub fn all_attempts_failed() -> DetectionResult {
    DetectionResult {
        chip_name: "Unknown, all attempts failed".to_string(),
        hw_code: 0,
        raw_hex: String::new(),
        source: ProbeSource::Standard,
        verified: false,
        notes: None,
        error: Some("No probe produced a result".to_string()),
    }
}
