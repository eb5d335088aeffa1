//! Thread-local, epoch-stamped item sets used to deduplicate query candidates.
//!
//! A forest query reaches the same item through many trees. Instead of
//! sorting the candidate list, each item id is stamped with the current
//! epoch on first sight:
//! - `insert(id)` is one array read and at most one write
//! - starting a new query bumps the epoch instead of zeroing memory

use std::cell::RefCell;

/// Sets kept per thread for reuse.
const POOL_SIZE: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<EpochSet>> = const { RefCell::new(Vec::new()) };
}

struct EpochSet {
    stamps: Vec<u32>,
    epoch: u32,
}

impl EpochSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            stamps: vec![0; capacity.max(1024)],
            epoch: 1,
        }
    }

    fn reset(&mut self, capacity: usize) {
        if self.stamps.len() < capacity {
            self.stamps.resize(capacity, 0);
        }
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // Epoch wrapped: old stamps could collide, so wipe them
            self.stamps.fill(0);
            self.epoch = 1;
        }
    }
}

/// An item set borrowed from the thread's pool, returned on drop.
pub(crate) struct SeenItems {
    set: Option<EpochSet>,
}

impl SeenItems {
    /// Borrow a cleared set able to hold ids below `capacity`.
    pub(crate) fn new(capacity: usize) -> Self {
        let pooled = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.iter().position(|s| s.stamps.len() >= capacity) {
                Some(idx) => Some(pool.swap_remove(idx)),
                None => pool.pop(),
            }
        });
        let mut set = pooled.unwrap_or_else(|| EpochSet::with_capacity(capacity));
        set.reset(capacity);
        Self { set: Some(set) }
    }

    /// Mark `id`; returns `true` the first time it is seen.
    #[inline(always)]
    pub(crate) fn insert(&mut self, id: u32) -> bool {
        let Some(set) = self.set.as_mut() else {
            return false;
        };
        let id = id as usize;
        if id >= set.stamps.len() {
            set.stamps.resize(id + 1, 0);
        }
        if set.stamps[id] == set.epoch {
            false
        } else {
            set.stamps[id] = set.epoch;
            true
        }
    }
}

impl Drop for SeenItems {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_SIZE {
                    pool.push(set);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_first_sight() {
        let mut seen = SeenItems::new(100);
        assert!(seen.insert(0));
        assert!(seen.insert(50));
        assert!(!seen.insert(0));
        assert!(!seen.insert(50));
        assert!(seen.insert(25));
    }

    #[test]
    fn test_reuse_starts_empty() {
        {
            let mut seen = SeenItems::new(100);
            seen.insert(42);
        }
        let mut seen = SeenItems::new(100);
        assert!(seen.insert(42), "pooled set should be cleared");
    }

    #[test]
    fn test_nested_sets_are_independent() {
        let mut outer = SeenItems::new(10);
        let mut inner = SeenItems::new(10);
        assert!(outer.insert(3));
        assert!(inner.insert(3));
    }

    #[test]
    fn test_grows_for_sparse_ids() {
        let mut seen = SeenItems::new(16);
        assert!(seen.insert(5000));
        assert!(!seen.insert(5000));
        assert!(seen.insert(5001));
    }
}
