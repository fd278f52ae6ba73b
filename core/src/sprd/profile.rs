/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use crate::error::{Error, Result};

/// One FDL stage: where the binary lives on disk and where the device wants
/// it loaded.
#[derive(Debug, Clone)]
pub struct FdlImage {
    pub path: PathBuf,
    pub addr: u32,
}

impl FdlImage {
    pub fn new(path: impl Into<PathBuf>, addr: u32) -> Self {
        FdlImage { path: path.into(), addr }
    }

    /// Reads the stage binary from disk.
    pub async fn load(&self) -> Result<Vec<u8>> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::config(format!("Failed to read {}: {}", self.path.display(), e)))?;

        if data.is_empty() {
            return Err(Error::config(format!("{} is empty", self.path.display())));
        }

        Ok(data)
    }
}

/// Per-chipset configuration handed in by the caller. The flash engine
/// consumes this read-only; ownership and persistence are the caller's
/// problem.
#[derive(Debug, Clone, Default)]
pub struct ChipsetProfile {
    pub name: String,
    pub fdl1: Option<FdlImage>,
    /// Optional: many chipsets only need FDL1 for info queries.
    pub fdl2: Option<FdlImage>,
    pub baud: u32,
    pub flash_base: u32,
    pub read_partition: u32,
}

impl ChipsetProfile {
    pub fn new(name: impl Into<String>) -> Self {
        ChipsetProfile { name: name.into(), baud: 115_200, ..Default::default() }
    }

    pub fn with_fdl1(mut self, path: impl Into<PathBuf>, addr: u32) -> Self {
        self.fdl1 = Some(FdlImage::new(path, addr));
        self
    }

    pub fn with_fdl2(mut self, path: impl Into<PathBuf>, addr: u32) -> Self {
        self.fdl2 = Some(FdlImage::new(path, addr));
        self
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    pub fn with_flash_base(mut self, base: u32) -> Self {
        self.flash_base = base;
        self
    }
}
