//! Activity indication.
//!
//! The gateway has no display, so a single LED tells a technician what it is
//! doing: blinking while waiting for the network, steady on while connected
//! to the server, and a short toggle every time a frame moves in either
//! direction.

use std::fs;
use std::path::PathBuf;

use crate::tracing::prelude::*;

/// Sink for activity signals.
pub trait ActivityIndicator: Send {
    /// Signal a single unit of activity.
    fn pulse(&mut self);

    /// Reflect whether a server connection is up.
    fn set_connected(&mut self, connected: bool);
}

/// Indicator that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl ActivityIndicator for NoIndicator {
    fn pulse(&mut self) {}

    fn set_connected(&mut self, _connected: bool) {}
}

/// LED driven through the Linux LED class (`/sys/class/leds/<name>`).
#[derive(Debug)]
pub struct LedIndicator {
    brightness: PathBuf,
    lit: bool,
    warned: bool,
}

impl LedIndicator {
    /// LED by name under `/sys/class/leds`.
    pub fn new(name: &str) -> Self {
        Self::with_path(PathBuf::from("/sys/class/leds").join(name).join("brightness"))
    }

    /// LED whose brightness attribute lives at `brightness`.
    pub fn with_path(brightness: PathBuf) -> Self {
        Self {
            brightness,
            lit: false,
            warned: false,
        }
    }

    fn write(&mut self, lit: bool) {
        self.lit = lit;
        let value = if lit { "1" } else { "0" };
        if let Err(e) = fs::write(&self.brightness, value) {
            if !self.warned {
                debug!(
                    path = %self.brightness.display(),
                    error = %e,
                    "Cannot drive activity LED"
                );
                self.warned = true;
            }
        }
    }
}

impl ActivityIndicator for LedIndicator {
    fn pulse(&mut self) {
        let lit = !self.lit;
        self.write(lit);
    }

    fn set_connected(&mut self, connected: bool) {
        self.write(connected);
    }
}

impl<T: ActivityIndicator + ?Sized> ActivityIndicator for Box<T> {
    fn pulse(&mut self) {
        (**self).pulse()
    }

    fn set_connected(&mut self, connected: bool) {
        (**self).set_connected(connected)
    }
}

/// Indicator that counts signals, for tests.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct CountingIndicator {
    pub pulses: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    pub connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl CountingIndicator {
    pub fn pulses(&self) -> usize {
        self.pulses.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ActivityIndicator for CountingIndicator {
    fn pulse(&mut self) {
        self.pulses.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected
            .store(connected, std::sync::atomic::Ordering::SeqCst);
    }
}
