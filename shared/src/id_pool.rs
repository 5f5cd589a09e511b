//! Allocation and recycling of small integer identifiers.
//!
//! Entities and players are correlated across the wire by id. Ids below the
//! floor are reserved for local, non-networked objects and are never issued.
//! Released ids are reused smallest-first, and releasing the most recently
//! minted id shrinks the counter instead, keeping the id space compact under
//! churn.
//!
//! The pool is not internally synchronized; the server keeps it inside its
//! registry lock.

use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdPoolError {
    #[error("id pool exhausted ({floor}..={ceiling} all live)")]
    Exhausted { floor: u32, ceiling: u32 },
}

#[derive(Debug, Clone)]
pub struct IdPool {
    floor: u32,
    ceiling: u32,
    next: u32,
    free: BTreeSet<u32>,
}

impl IdPool {
    /// Creates a pool issuing ids in `floor..=ceiling`.
    pub fn new(floor: u32, ceiling: u32) -> Self {
        Self {
            floor,
            ceiling,
            next: floor,
            free: BTreeSet::new(),
        }
    }

    /// Pool for 16-bit player ids; 0 means "no player".
    pub fn for_players() -> Self {
        Self::new(1, u16::MAX as u32)
    }

    /// Pool for networked entity ids, above the local-only range.
    pub fn for_entities(floor: u32) -> Self {
        Self::new(floor, u32::MAX)
    }

    /// Issues an id, or `None` when every id in range is live.
    pub fn acquire(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        if self.next >= self.floor && self.next <= self.ceiling && self.next != u32::MAX {
            let id = self.next;
            self.next += 1;
            return Some(id);
        }
        None
    }

    /// Like [`IdPool::acquire`] but reports exhaustion as an error.
    pub fn try_acquire(&mut self) -> Result<u32, IdPoolError> {
        self.acquire().ok_or(IdPoolError::Exhausted {
            floor: self.floor,
            ceiling: self.ceiling,
        })
    }

    /// Returns an id to the pool. Ids outside the issued range are ignored.
    pub fn release(&mut self, id: u32) {
        if id < self.floor || id >= self.next {
            return;
        }
        if id == self.next - 1 {
            self.next -= 1;
            // Free ids now at the top collapse into the counter as well.
            while self.next > self.floor && self.free.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            self.free.insert(id);
        }
    }

    /// Marks a specific id live, e.g. when a reconnecting player reclaims
    /// the id it held before. Returns false if it was already live or is out
    /// of range.
    pub fn claim(&mut self, id: u32) -> bool {
        if id < self.floor || id > self.ceiling || id == u32::MAX {
            return false;
        }
        if id < self.next {
            return self.free.remove(&id);
        }
        for skipped in self.next..id {
            self.free.insert(skipped);
        }
        self.next = id + 1;
        true
    }

    /// Forgets every issued id and restarts at `floor`.
    pub fn reset(&mut self, floor: u32) {
        self.floor = floor;
        self.next = floor;
        self.free.clear();
    }

    pub fn is_live(&self, id: u32) -> bool {
        id >= self.floor && id < self.next && !self.free.contains(&id)
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn floor(&self) -> u32 {
        self.floor
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn live_count(&self) -> usize {
        (self.next - self.floor) as usize - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn check_invariants(pool: &IdPool) {
        for id in &pool.free {
            assert!(*id < pool.next, "free id {} >= next {}", id, pool.next);
            assert!(*id >= pool.floor, "free id {} < floor {}", id, pool.floor);
        }
    }

    #[test]
    fn test_ids_start_at_floor() {
        let mut pool = IdPool::new(1000, 2000);
        assert_eq!(pool.acquire(), Some(1000));
        assert_eq!(pool.acquire(), Some(1001));
    }

    #[test]
    fn test_release_last_shrinks_next() {
        let mut pool = IdPool::new(1, 100);
        let ids: Vec<u32> = (0..5).filter_map(|_| pool.acquire()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        pool.release(5);
        assert_eq!(pool.next(), 5);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.acquire(), Some(5));
    }

    #[test]
    fn test_smallest_free_id_first() {
        let mut pool = IdPool::new(1, 100);
        for _ in 0..6 {
            pool.acquire();
        }
        pool.release(4);
        pool.release(2);
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(4));
        assert_eq!(pool.acquire(), Some(7));
    }

    #[test]
    fn test_top_release_collapses_free_tail() {
        let mut pool = IdPool::new(1, 100);
        for _ in 0..5 {
            pool.acquire();
        }
        pool.release(4);
        pool.release(3);
        pool.release(5);
        assert_eq!(pool.next(), 3);
        assert_eq!(pool.free_len(), 0);
        check_invariants(&pool);
    }

    #[test]
    fn test_release_below_floor_is_noop() {
        let mut pool = IdPool::new(10, 20);
        pool.acquire();
        pool.release(3);
        pool.release(99);
        assert_eq!(pool.next(), 11);
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut pool = IdPool::new(1, 3);
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(3));
        assert_eq!(pool.acquire(), None);
        assert!(matches!(
            pool.try_acquire(),
            Err(IdPoolError::Exhausted { floor: 1, ceiling: 3 })
        ));
        pool.release(2);
        assert_eq!(pool.acquire(), Some(2));
    }

    #[test]
    fn test_reset() {
        let mut pool = IdPool::new(1, 100);
        for _ in 0..10 {
            pool.acquire();
        }
        pool.release(3);
        pool.reset(50);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.acquire(), Some(50));
    }

    #[test]
    fn test_claim_specific_id() {
        let mut pool = IdPool::new(1, 100);
        assert!(pool.claim(4));
        assert!(!pool.claim(4));
        assert!(pool.is_live(4));
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(3));
        assert_eq!(pool.acquire(), Some(5));
        check_invariants(&pool);
    }

    #[test]
    fn test_churn_never_duplicates_live_ids() {
        let mut pool = IdPool::new(100, 10_000);
        let mut live: HashSet<u32> = HashSet::new();
        // Deterministic pseudo-random sequence.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for _ in 0..5_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if seed % 3 != 0 || live.is_empty() {
                let id = pool.acquire().unwrap();
                assert!(live.insert(id), "id {} issued twice", id);
            } else {
                let victim = *live.iter().nth((seed as usize) % live.len()).unwrap();
                live.remove(&victim);
                pool.release(victim);
            }
            check_invariants(&pool);
            assert_eq!(pool.live_count(), live.len());
        }
    }
}
