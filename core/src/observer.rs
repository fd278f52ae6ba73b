/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::Level;

/// External observer of a protocol run.
///
/// The protocol engines call into this synchronously, fire-and-forget; an
/// implementation must return quickly and must never influence control flow.
/// Everything reported here is also mirrored to the `log` facade, so a
/// front-end that only wants a log stream can ignore this trait entirely.
pub trait Observer: Send + Sync {
    /// Overall progress of the current operation, 0..=100.
    fn progress(&self, _percent: u8) {}

    /// A leveled, human-readable status message.
    fn log(&self, _level: Level, _msg: &str) {}

    /// The engine entered or left a busy section.
    fn busy(&self, _busy: bool) {}

    /// A user-facing failure, with optional technical detail for logs.
    fn error(&self, _msg: &str, _detail: Option<&str>) {}
}

/// Observer that discards everything.
pub struct NullObserver;

impl Observer for NullObserver {}
