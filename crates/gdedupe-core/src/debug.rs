//! Debug verbosity of the dedupe class.
//!
//! One value per loaded class: set from config by `DedupeClass::init`, reset
//! to zero by `DedupeClass::fini`, and shared with every device by `Arc`.
//! Level 1 covers lifecycle events, level 2 per-request detail, level 3
//! per-block detail. Output still goes through `tracing` at `debug` level, so
//! the subscriber filter applies on top.

use std::sync::atomic::{AtomicU32, Ordering};

/// Runtime-adjustable debug level.
#[derive(Debug, Default)]
pub struct DebugLevel(AtomicU32);

impl DebugLevel {
    /// Create with an initial level.
    pub fn new(level: u32) -> Self {
        Self(AtomicU32::new(level))
    }

    /// Current level.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Change the level.
    pub fn set(&self, level: u32) {
        self.0.store(level, Ordering::Relaxed);
    }

    /// Back to zero.
    pub fn reset(&self) {
        self.set(0);
    }

    /// True if messages at `level` should be emitted.
    pub fn enabled(&self, level: u32) -> bool {
        self.get() >= level
    }
}

/// Emit a `tracing::debug!` event if the debug level allows it.
#[macro_export]
macro_rules! dedupe_debug {
    ($dbg:expr, $lvl:expr, $($arg:tt)+) => {
        if $dbg.enabled($lvl) {
            tracing::debug!(dbg = $lvl, $($arg)+);
        }
    };
}
