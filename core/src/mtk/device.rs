/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::sync::Arc;
use std::time::Duration;

use log::{Level, debug, info, warn};
use tokio::sync::RwLock;

use crate::connection::Connection;
use crate::connection::port::DevicePort;
use crate::error::{Error, Result};
use crate::mtk::da::{DaFile, DaUploader};
use crate::mtk::handshake::brom_handshake;
use crate::mtk::identify::{DetectionResult, PROBE_TIMEOUT, identify_chip};
use crate::observer::Observer;

const INFO_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const INFO_RESPONSE_MAX: usize = 128;

/// Device-information probes understood by most boot ROMs.
const GENERIC_PROBES: &[(&str, &[u8])] = &[
    ("model", &[0xFC, 0x01]),
    ("build", &[0xFC, 0x02]),
    ("hw_version", &[0xFC, 0x03]),
    ("serial", &[0xFC, 0x04]),
];

/// Vendor preloaders answer their own probe sets; tried after the generic
/// table, in order.
const OEM_PROBE_TABLES: &[(&str, &[(&str, &[u8])])] = &[
    ("Generic", GENERIC_PROBES),
    ("Xiaomi", &[("model", &[0xF8, 0x4D]), ("fw_branch", &[0xF8, 0x56])]),
    ("Oppo", &[("model", &[0xF7, 0x4F]), ("project", &[0xF7, 0x50])]),
    ("Vivo", &[("model", &[0xF6, 0x56])]),
];

/// Maps a chip name or series keyword to DA-filename fragments known to work
/// with it. Scanned in order; specific chips first, series keywords next,
/// bare hardware codes last.
const DA_COMPAT_RULES: &[(&str, &[&str])] = &[
    ("MT6739", &["MT6739"]),
    ("MT6761", &["MT6761", "Helio_A22"]),
    ("MT6762", &["MT6762", "Helio_P22", "Helio_A25"]),
    ("MT6765", &["MT6765", "Helio_P35", "Helio_G35"]),
    ("MT6768", &["MT6768", "Helio_P65", "Helio_G80", "Helio_G85"]),
    ("MT6771", &["MT6771", "Helio_P60", "Helio_P70"]),
    ("MT6781", &["MT6781", "Helio_G96"]),
    ("MT6785", &["MT6785", "Helio_G90"]),
    ("MT6833", &["MT6833", "Dimensity_700"]),
    ("MT6853", &["MT6853", "Dimensity_720", "Dimensity_800U"]),
    ("MT6873", &["MT6873", "Dimensity_800"]),
    ("MT6877", &["MT6877", "Dimensity_900"]),
    ("MT6885", &["MT6885", "Dimensity_1000"]),
    ("MT6893", &["MT6893", "Dimensity_1200"]),
    ("Helio", &["Helio"]),
    ("Dimensity", &["Dimensity"]),
    ("0x0766", &["MT6765", "Helio_P35"]),
    ("0x0813", &["MT6785", "Helio_G90"]),
];

/// Verdict of the DA-against-chip check. Incompatibility is a warning, not
/// an error: the upload is skipped rather than forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible(String),
    /// No rule covers this chip; proceed, but say so.
    Unverified,
}

/// Checks a DA filename against the detected chip.
pub fn check_da_compatibility(
    chip_name: &str,
    hw_code: u16,
    da_file_name: &str,
) -> Compatibility {
    let chip = chip_name.to_ascii_lowercase();
    let da = da_file_name.to_ascii_lowercase();

    let matched = DA_COMPAT_RULES.iter().find(|(key, _)| {
        let key = key.to_ascii_lowercase();
        chip.contains(&key) || key.contains(&chip)
    });

    // Unknown chips may still be matched through their bare hardware code.
    let matched = matched.or_else(|| {
        let code_key = format!("0x{:04x}", hw_code);
        DA_COMPAT_RULES.iter().find(|(key, _)| key.to_ascii_lowercase() == code_key)
    });

    let Some((key, fragments)) = matched else {
        return Compatibility::Unverified;
    };

    if fragments.iter().any(|f| da.contains(&f.to_ascii_lowercase())) {
        Compatibility::Compatible
    } else {
        Compatibility::Incompatible(format!(
            "DA \"{}\" does not look like a {} agent (rule \"{}\")",
            da_file_name, chip_name, key
        ))
    }
}

/// What happened when a probed value was stored.
enum InfoOutcome {
    New,
    Unchanged,
    Overwritten(String),
}

#[derive(Clone, Default)]
pub struct ReportData {
    pub chipset: String,
    pub hw_code: u16,
    pub verified: bool,
    pub detection: Option<DetectionResult>,
    pub da_uploaded: bool,
    pub info: Vec<(String, String)>,
}

/// Safe wrapper around the session's findings with async read/write access.
#[derive(Clone)]
pub struct DeviceReport {
    inner: Arc<RwLock<ReportData>>,
}

impl DeviceReport {
    pub fn new() -> Self {
        DeviceReport { inner: Arc::new(RwLock::new(ReportData::default())) }
    }

    pub async fn get_data(&self) -> ReportData {
        self.inner.read().await.clone()
    }

    pub async fn chipset(&self) -> String {
        self.inner.read().await.chipset.clone()
    }

    pub async fn hw_code(&self) -> u16 {
        self.inner.read().await.hw_code
    }

    pub async fn da_uploaded(&self) -> bool {
        self.inner.read().await.da_uploaded
    }

    pub async fn info_value(&self, key: &str) -> Option<String> {
        let guard = self.inner.read().await;
        guard.info.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    async fn set_detection(&self, detection: &DetectionResult) {
        let mut guard = self.inner.write().await;
        guard.chipset = detection.chip_name.clone();
        guard.hw_code = detection.hw_code;
        guard.verified = detection.verified;
        guard.detection = Some(detection.clone());
    }

    async fn set_da_uploaded(&self, uploaded: bool) {
        self.inner.write().await.da_uploaded = uploaded;
    }

    async fn set_info(&self, key: &str, value: &str) -> InfoOutcome {
        let mut guard = self.inner.write().await;

        match guard.info.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) if existing == value => InfoOutcome::Unchanged,
            Some((_, existing)) => {
                let old = std::mem::replace(existing, value.to_string());
                InfoOutcome::Overwritten(old)
            }
            None => {
                guard.info.push((key.to_string(), value.to_string()));
                InfoOutcome::New
            }
        }
    }
}

impl Default for DeviceReport {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for creating a new [`MtkDevice`].
///
/// A port must be provided. The DA file is optional but recommended: without
/// one, the session stops at identification and info queries.
#[derive(Default)]
pub struct MtkDeviceBuilder {
    port: Option<Box<dyn DevicePort>>,
    da: Option<DaFile>,
    observer: Option<Arc<dyn Observer>>,
}

impl MtkDeviceBuilder {
    pub fn with_port(mut self, port: Box<dyn DevicePort>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_da_file(mut self, da: DaFile) -> Self {
        self.da = Some(da);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<MtkDevice> {
        let port = self
            .port
            .ok_or_else(|| Error::config("A port must be provided to build an MtkDevice"))?;
        let observer =
            self.observer.unwrap_or_else(|| Arc::new(crate::observer::NullObserver));

        Ok(MtkDevice {
            conn: Connection::new(port),
            da: self.da,
            observer,
            report: DeviceReport::new(),
            probe_timeout: PROBE_TIMEOUT,
        })
    }
}

/// Orchestrates one MediaTek session: handshake, chip identification, DA
/// compatibility check and upload, device-info query.
pub struct MtkDevice {
    conn: Connection,
    da: Option<DaFile>,
    observer: Arc<dyn Observer>,
    report: DeviceReport,
    probe_timeout: Duration,
}

impl MtkDevice {
    /// Shared view of everything learned about the device so far.
    pub fn report(&self) -> DeviceReport {
        self.report.clone()
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn emit(&self, level: Level, msg: &str) {
        log::log!(level, "{}", msg);
        self.observer.log(level, msg);
    }

    /// Runs the full session. Returns the arbitration winner; the rest of
    /// the findings land in [`MtkDevice::report`].
    pub async fn process(&mut self) -> Result<DetectionResult> {
        self.observer.busy(true);
        let result = self.process_inner().await;

        if let Err(e) = &result {
            self.observer.error("Device processing failed", Some(&e.to_string()));
        }

        self.observer.busy(false);
        result
    }

    async fn process_inner(&mut self) -> Result<DetectionResult> {
        self.conn.open().await?;

        brom_handshake(&mut self.conn).await?;
        self.observer.progress(10);

        let detection = identify_chip(&mut self.conn, self.probe_timeout).await?;
        self.report.set_detection(&detection).await;
        self.emit(
            Level::Info,
            &format!("Detected chipset: {} (0x{:04X})", detection.chip_name, detection.hw_code),
        );
        self.observer.progress(30);

        match self.da.take() {
            Some(da) => {
                self.maybe_upload_da(&detection, &da).await?;
                self.da = Some(da);
            }
            None => {
                self.emit(Level::Warn, "No DA file set, skipping upload");
            }
        }
        self.observer.progress(90);

        let retrieved = self.query_device_info().await?;
        if retrieved == 0 {
            return Err(Error::proto("Device answered no info probe with a usable value"));
        }

        self.observer.progress(100);
        Ok(detection)
    }

    async fn maybe_upload_da(&mut self, detection: &DetectionResult, da: &DaFile) -> Result<()> {
        match check_da_compatibility(&detection.chip_name, detection.hw_code, &da.file_name()) {
            Compatibility::Incompatible(reason) => {
                // Forcing a wrong DA can brick the boot path; skipping is
                // the only sane reaction.
                self.emit(Level::Warn, &format!("Skipping DA upload: {}", reason));
                return Ok(());
            }
            Compatibility::Unverified => {
                self.emit(
                    Level::Warn,
                    &format!(
                        "No compatibility rule for {}, uploading {} unverified",
                        detection.chip_name,
                        da.file_name()
                    ),
                );
            }
            Compatibility::Compatible => {
                info!("DA {} is compatible with {}", da.file_name(), detection.chip_name);
            }
        }

        let uploaded = DaUploader::new(self.observer.clone()).upload(&mut self.conn, da).await?;
        self.report.set_da_uploaded(uploaded).await;
        Ok(())
    }

    /// Walks the probe tables in order. A later probe that yields a
    /// different value for an already-known key overwrites it; individual
    /// probe failures never abort the query.
    async fn query_device_info(&mut self) -> Result<usize> {
        let mut retrieved = 0usize;

        for (oem, table) in OEM_PROBE_TABLES {
            for (key, probe) in *table {
                let value = match self.probe_info(probe).await {
                    Ok(v) => v,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        debug!("Info probe {}/{} failed: {}", oem, key, e);
                        continue;
                    }
                };

                let Some(value) = value else { continue };

                match self.report.set_info(key, &value).await {
                    InfoOutcome::New => {
                        info!("{}: {} = \"{}\"", oem, key, value);
                        retrieved += 1;
                    }
                    InfoOutcome::Unchanged => {}
                    InfoOutcome::Overwritten(old) => {
                        warn!("{}: {} = \"{}\" (overwrites earlier \"{}\")", oem, key, value, old);
                    }
                }
            }
        }

        Ok(retrieved)
    }

    async fn probe_info(&mut self, probe: &[u8]) -> Result<Option<String>> {
        self.conn.write_all(probe).await?;
        let resp = self.conn.read_available(INFO_RESPONSE_MAX, INFO_PROBE_TIMEOUT).await?;

        Ok(decode_info_value(&resp))
    }
}

/// Decodes a probe response as trimmed ASCII and filters out values that are
/// empty or error-shaped.
fn decode_info_value(resp: &[u8]) -> Option<String> {
    if resp.is_empty() {
        return None;
    }

    let text = String::from_utf8_lossy(resp);
    let trimmed = text.trim_matches('\0').trim();

    if trimmed.is_empty() || !trimmed.chars().any(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let lowered = trimmed.to_ascii_lowercase();
    if lowered.contains("error") || lowered.contains("fail") {
        return None;
    }

    Some(trimmed.to_string())
}
