//! Pooled random draws for spreading out report delivery

use rand::seq::SliceRandom;

/// A pooled random generator returning values from `0..size` without
/// replacement, refilling with a fresh permutation once the pool is empty.
///
/// Counts over the returned values are flat after each multiple of the pool
/// size and differ by at most one in between, so deliveries spread evenly
/// over the configured window instead of clustering.
#[derive(Debug)]
pub struct RandPool {
    size: u64,
    pool: Vec<u64>,
}

impl RandPool {
    /// Create a pool returning values from zero inclusive up to `size` exclusive.
    pub fn new(size: u64) -> Self {
        Self { size, pool: Vec::new() }
    }

    /// Draw one value from the pool of remaining values.
    pub fn get(&mut self) -> u64 {
        if self.pool.is_empty() {
            self.pool = (0..self.size).collect();
            self.pool.shuffle(&mut rand::thread_rng());
        }
        // the refill above guarantees at least one element for any size >= 1
        self.pool.pop().unwrap_or(0)
    }
}
