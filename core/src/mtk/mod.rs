/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod chips;
pub mod da;
pub mod device;
pub mod handshake;
pub mod identify;

pub use da::{DaFile, DaUploader};
pub use device::{Compatibility, DeviceReport, MtkDevice, MtkDeviceBuilder};
pub use handshake::brom_handshake;
pub use identify::{DetectionResult, ProbeSource, identify_chip};
