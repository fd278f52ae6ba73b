/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod checksum;
pub mod cmds;
pub mod flash;
pub mod frame;
pub mod link;
pub mod profile;

pub use checksum::ChecksumMode;
pub use flash::{FlashState, SprdFlashEngine};
pub use link::{ConnectionState, SprdLink};
pub use profile::{ChipsetProfile, FdlImage};
