//! Snowflake-style distributed ids.
//!
//! An id packs `[timestamp ms since epoch][worker id][sequence]` into a
//! positive i64. The worker id is the machine tag of the process that
//! minted the id, which lets identity-sharded selection route an actor back to
//! the server that owns it.

use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bit layout of generated ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdLayout {
    pub worker_bits: u8,
    pub sequence_bits: u8,
    /// Milliseconds since the Unix epoch that timestamp 0 stands for.
    pub epoch_ms: u64,
}

impl Default for IdLayout {
    fn default() -> Self {
        Self {
            worker_bits: 10,
            sequence_bits: 12,
            // 2024-01-01T00:00:00Z
            epoch_ms: 1_704_067_200_000,
        }
    }
}

impl IdLayout {
    pub fn max_worker_id(&self) -> u32 {
        ((1u64 << self.worker_bits) - 1) as u32
    }

    pub fn max_sequence(&self) -> u32 {
        ((1u64 << self.sequence_bits) - 1) as u32
    }

    /// The worker tag carried by `id`.
    pub fn worker_id(&self, id: i64) -> u32 {
        (((id as u64) >> self.sequence_bits) & self.max_worker_id() as u64) as u32
    }

    /// Milliseconds since `epoch_ms` at which `id` was minted.
    pub fn timestamp(&self, id: i64) -> u64 {
        (id as u64) >> (self.sequence_bits + self.worker_bits)
    }

    pub fn compose(&self, timestamp: u64, worker_id: u32, sequence: u32) -> i64 {
        let shift = self.sequence_bits + self.worker_bits;
        let id = (timestamp << shift)
            | ((worker_id & self.max_worker_id()) as u64) << self.sequence_bits
            | (sequence & self.max_sequence()) as u64;
        (id & i64::MAX as u64) as i64
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_timestamp: u64,
    sequence: u32,
}

/// Mints unique, roughly time-ordered ids for one worker.
#[derive(Debug)]
pub struct IdGenerator {
    layout: IdLayout,
    worker_id: u32,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// `worker_id` is masked to the layout's worker bits.
    pub fn new(worker_id: u32) -> Self {
        Self::with_layout(worker_id, IdLayout::default())
    }

    pub fn with_layout(worker_id: u32, layout: IdLayout) -> Self {
        Self {
            worker_id: worker_id & layout.max_worker_id(),
            layout,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    pub fn layout(&self) -> &IdLayout {
        &self.layout
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Mints the next id.
    ///
    /// Blocks the calling thread, yielding, when the sequence for the
    /// current millisecond is used up. Async callers that mint in bursts
    /// should use [`try_next_id`](Self::try_next_id) and sleep instead.
    pub fn next_id(&self) -> i64 {
        loop {
            match self.mint(self.now()) {
                Ok(id) => return id,
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    /// Mints the next id without waiting.
    ///
    /// # Errors
    ///
    /// When the current millisecond has no sequence numbers left, returns how
    /// long to wait before the next attempt can succeed.
    pub fn try_next_id(&self) -> Result<i64, Duration> {
        self.mint(self.now()).map_err(Duration::from_millis)
    }

    /// Mints an id at `now`, or returns the milliseconds until a fresh
    /// sequence is available.
    fn mint(&self, now: u64) -> Result<i64, u64> {
        let mut state = self.state.lock();
        // A clock that steps backwards keeps minting on the last timestamp.
        let timestamp = now.max(state.last_timestamp);

        if timestamp == state.last_timestamp {
            if state.sequence >= self.layout.max_sequence() {
                return Err((state.last_timestamp + 1).saturating_sub(now));
            }
            state.sequence += 1;
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;
        Ok(self.layout.compose(timestamp, self.worker_id, state.sequence))
    }

    fn now(&self) -> u64 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        since_unix.saturating_sub(self.layout.epoch_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_compose_and_extract() {
        let layout = IdLayout::default();
        let id = layout.compose(123_456, 37, 9);
        assert!(id > 0);
        assert_eq!(layout.worker_id(id), 37);
        assert_eq!(layout.timestamp(id), 123_456);
    }

    #[test]
    fn test_generated_ids_are_unique_and_tagged() {
        let generator = IdGenerator::new(12);
        let mut seen = HashSet::new();
        let mut previous = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > previous, "ids should increase");
            assert_eq!(generator.layout().worker_id(id), 12);
            assert!(seen.insert(id));
            previous = id;
        }
    }

    #[test]
    fn test_worker_id_is_masked() {
        let generator = IdGenerator::new(5000);
        assert_eq!(generator.worker_id(), 5000 & 1023);
    }

    #[test]
    fn test_exhausted_millisecond_reports_wait() {
        let layout = IdLayout {
            sequence_bits: 2,
            ..IdLayout::default()
        };
        let generator = IdGenerator::with_layout(3, layout);

        let ids: Vec<i64> = (0..4).map(|_| generator.mint(1_000).unwrap()).collect();
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
        assert_eq!(generator.mint(1_000), Err(1));

        let next = generator.mint(1_001).unwrap();
        assert_eq!(layout.timestamp(next), 1_001);
        assert!(next > ids[3]);
    }

    #[test]
    fn test_clock_step_back_waits_for_last_timestamp() {
        let layout = IdLayout {
            sequence_bits: 1,
            ..IdLayout::default()
        };
        let generator = IdGenerator::with_layout(1, layout);
        generator.mint(2_000).unwrap();
        generator.mint(2_000).unwrap();

        assert_eq!(generator.mint(1_995), Err(6));
    }

    #[test]
    fn test_try_next_id_mints_without_waiting() {
        let generator = IdGenerator::new(7);
        let id = generator.try_next_id().expect("A fresh generator has sequence left");
        assert_eq!(generator.layout().worker_id(id), 7);
    }
}
