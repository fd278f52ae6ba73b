/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod connection;
pub mod error;
pub mod mtk;
pub mod observer;
pub mod sprd;

pub use connection::Connection;
pub use connection::port::DevicePort;
pub use error::{Error, Result};
pub use mtk::{DaFile, MtkDevice, MtkDeviceBuilder};
pub use observer::{NullObserver, Observer};
pub use sprd::{ChipsetProfile, SprdFlashEngine, SprdLink};
