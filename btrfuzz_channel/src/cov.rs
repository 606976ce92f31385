//! Coverage record: AFL style edge counters over KCOV program counters.

use crate::MAP_SIZE;

const PREV_INIT: u64 = 0xDEAD;
const SLOT_MASK: u64 = (MAP_SIZE as u64) - 1;

/// Folds a PC trace into edge counters.
#[derive(Debug, Clone)]
pub struct EdgeHasher {
    prev: u64,
}

impl Default for EdgeHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeHasher {
    pub const fn new() -> Self {
        Self { prev: PREV_INIT }
    }

    pub fn reset(&mut self) {
        self.prev = PREV_INIT;
    }

    #[inline]
    pub fn add(&mut self, pc: u64, record: &mut [u8]) {
        let cur = pc & SLOT_MASK;
        let slot = (cur ^ self.prev) as usize;
        if let Some(c) = record.get_mut(slot) {
            *c = c.saturating_add(1);
        }
        self.prev = cur >> 1;
    }

    /// Fold a whole trace, starting from a fresh edge state.
    pub fn fold(&mut self, pcs: &[u64], record: &mut [u8]) {
        self.reset();
        for pc in pcs {
            self.add(*pc, record);
        }
    }
}

/// Number of non-zero slots.
pub fn count_edges(record: &[u8]) -> usize {
    record.iter().filter(|c| **c != 0).count()
}

/// Slots hit in `record` but never in `max`, merging them into `max`.
pub fn merge_new_edges(max: &mut [u8], record: &[u8]) -> usize {
    let mut new = 0;
    for (m, r) in max.iter_mut().zip(record.iter()) {
        if *r != 0 && *m == 0 {
            new += 1;
        }
        if *r > *m {
            *m = *r;
        }
    }
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    #[test]
    fn first_edge_uses_initial_prev() {
        let mut record = vec![0_u8; MAP_SIZE];
        let mut h = EdgeHasher::new();
        h.add(0xffff_ffff_8123_4567, &mut record);
        assert_eq!(record[(0x4567 ^ 0xDEAD) as usize], 1);
        h.add(0xffff_ffff_8100_0010, &mut record);
        assert_eq!(record[(0x0010 ^ (0x4567 >> 1)) as usize], 1);
        assert_eq!(count_edges(&record), 2);
    }

    #[test]
    fn saturation() {
        let mut record = vec![0_u8; MAP_SIZE];
        let mut h = EdgeHasher::new();
        for _ in 0..1000 {
            h.fold(&[0x1000], &mut record);
        }
        assert_eq!(record[(0x1000 ^ 0xDEAD) as usize], 255);
    }

    #[test]
    fn deterministic_fold() {
        let mut rng = SmallRng::from_entropy();
        let pcs = (0..4096).map(|_| rng.gen::<u64>()).collect::<Vec<_>>();
        let mut a = vec![0_u8; MAP_SIZE];
        let mut b = vec![0_u8; MAP_SIZE];
        EdgeHasher::new().fold(&pcs, &mut a);
        let mut h = EdgeHasher::new();
        h.add(0x42, &mut b);
        b.iter_mut().for_each(|c| *c = 0);
        h.fold(&pcs, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn new_edges() {
        let mut max = vec![0_u8; 8];
        assert_eq!(merge_new_edges(&mut max, &[0, 1, 0, 3, 0, 0, 0, 0]), 2);
        assert_eq!(merge_new_edges(&mut max, &[0, 2, 0, 3, 1, 0, 0, 0]), 1);
        assert_eq!(max, vec![0, 2, 0, 3, 1, 0, 0, 0]);
    }
}
