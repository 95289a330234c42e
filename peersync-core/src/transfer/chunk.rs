//! Chunk arithmetic and send pacing.

use std::time::Duration;

/// Default maximum payload bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// A longer pause is inserted after every this many chunks.
pub const BATCH_LEN: u32 = 100;

/// Number of chunks needed for `len` bytes. Zero for an empty payload.
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1);
    len.div_ceil(chunk_size) as u32
}

/// Splits a payload into `chunk_size` slices, last one possibly shorter.
pub fn split(bytes: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(chunk_size.max(1))
}

/// Pacing between chunk sends.
///
/// The delay before chunk `i` grows by `ramp` per chunk up to `max_delay`;
/// every [`BATCH_LEN`] chunks an extra `batch_pause` is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub base_delay: Duration,
    pub ramp: Duration,
    pub max_delay: Duration,
    pub batch_pause: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            ramp: Duration::from_micros(20),
            max_delay: Duration::from_millis(25),
            batch_pause: Duration::from_millis(100),
        }
    }
}

impl Pacing {
    /// No delays at all.
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ramp: Duration::ZERO,
            max_delay: Duration::ZERO,
            batch_pause: Duration::ZERO,
        }
    }

    /// Delay to wait before sending chunk `index`. Chunk 0 goes out immediately.
    pub fn delay_before(&self, index: u32) -> Duration {
        if index == 0 {
            return Duration::ZERO;
        }
        let ramped = (self.base_delay + self.ramp * index).min(self.max_delay.max(self.base_delay));
        if index % BATCH_LEN == 0 {
            ramped + self.batch_pause
        } else {
            ramped
        }
    }
}
