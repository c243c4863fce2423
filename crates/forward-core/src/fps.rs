// SPDX-License-Identifier: CEPL-1.0
use std::time::{Duration, Instant};

/// Counts presented frames and reports the rate once per `window`.
#[derive(Debug)]
pub struct FpsCounter {
    window: Duration,
    frames: u32,
    total: u64,
    since: Instant,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            frames: 0,
            total: 0,
            since: now,
        }
    }

    pub fn frame(&mut self) {
        self.frames = self.frames.saturating_add(1);
        self.total = self.total.saturating_add(1);
    }

    /// Frames presented since construction.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the frame count of the elapsed window and starts a new one,
    /// or `None` while the window is still open.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        if now.saturating_duration_since(self.since) < self.window {
            return None;
        }
        let frames = self.frames;
        self.frames = 0;
        self.since = now;
        Some(frames)
    }

    /// Drops the partial window, e.g. while rendering is paused.
    pub fn reset(&mut self, now: Instant) {
        self.frames = 0;
        self.since = now;
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
