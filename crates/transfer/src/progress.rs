use std::collections::HashMap;
use std::sync::Mutex;

/// Aggregates byte progress of concurrently transferred parts.
///
/// The reported percentage is capped at 99: 100 is reserved for a
/// successfully finalized upload.
pub struct ChunkProgress {
    total_bytes: u64,
    loaded: Mutex<HashMap<u32, u64>>,
}

impl ChunkProgress {
    /// Creates a tracker for a file of `total_bytes`.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Records `bytes` loaded so far for `part` and returns the new percentage.
    ///
    /// Replaces the previous value, so a retried part starts over from 0.
    pub fn update(&self, part: u32, bytes: u64) -> u8 {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.insert(part, bytes);
        Self::percent_of(loaded.values().sum(), self.total_bytes)
    }

    /// Sum of loaded bytes across all parts.
    pub fn loaded_bytes(&self) -> u64 {
        let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.values().sum()
    }

    /// Current percentage (0–99).
    pub fn percent(&self) -> u8 {
        Self::percent_of(self.loaded_bytes(), self.total_bytes)
    }

    fn percent_of(loaded: u64, total: u64) -> u8 {
        if total == 0 {
            return 0;
        }
        ((loaded.min(total) * 100 / total) as u8).min(99)
    }
}
