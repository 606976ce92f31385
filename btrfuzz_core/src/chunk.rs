//! Logical to physical address translation.
//!
//! btrfs tree blocks are addressed logically. The chunk tree maps logical ranges to
//! device stripes; the superblock's sys_chunk_array carries enough of it to read the
//! chunk tree itself. Only the first stripe of each chunk is used since every stripe
//! holds the same bytes on a single-device image.

use crate::btrfs::{Chunk, FormatError, Key, CHUNK_ITEM_KEY, KEY_SIZE};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    len: u64,
    physical: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ChunkMap {
    inner: BTreeMap<u64, Mapping>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Insert `[logical, logical + len)`. Re-inserting an identical chunk is a no-op,
    /// any other overlap is rejected.
    pub fn insert(&mut self, logical: u64, len: u64, physical: u64) -> Result<(), FormatError> {
        let end = logical
            .checked_add(len)
            .filter(|_| len != 0)
            .ok_or(FormatError::ChunkOverlap(logical))?;
        let new = Mapping { len, physical };

        if let Some((&start, m)) = self.inner.range(..end).next_back() {
            if start == logical && *m == new {
                return Ok(());
            }
            if start + m.len > logical {
                return Err(FormatError::ChunkOverlap(logical));
            }
        }
        self.inner.insert(logical, new);
        Ok(())
    }

    /// Physical offset of `logical`.
    pub fn physical(&self, logical: u64) -> Option<u64> {
        self.physical_range(logical, 1)
    }

    /// Physical offset of `[logical, logical + len)`, which must not cross a chunk boundary.
    pub fn physical_range(&self, logical: u64, len: u64) -> Option<u64> {
        let (&start, m) = self.inner.range(..=logical).next_back()?;
        let delta = logical - start;
        if delta.checked_add(len)? <= m.len {
            m.physical.checked_add(delta)
        } else {
            None
        }
    }

    /// Seed the map from the superblock's sys_chunk_array.
    pub fn bootstrap(sys_array: &[u8]) -> Result<Self, FormatError> {
        let mut map = Self::new();
        let mut off = 0;

        while off < sys_array.len() {
            let key = Key::parse(sys_array, off)
                .ok_or_else(|| FormatError::BadSysArray(format!("short key at {}", off)))?;
            if key.ty != CHUNK_ITEM_KEY {
                return Err(FormatError::BadSysArray(format!(
                    "unexpected item type {} at {}",
                    key.ty, off
                )));
            }
            off += KEY_SIZE;

            let chunk = Chunk::parse(sys_array, off)
                .ok_or_else(|| FormatError::BadSysArray(format!("short chunk at {}", off)))?;
            if chunk.num_stripes == 0 {
                return Err(FormatError::BadSysArray("chunk without stripes".to_string()));
            }
            if off + chunk.item_size() > sys_array.len() {
                return Err(FormatError::BadSysArray(format!(
                    "short stripes at {}",
                    off
                )));
            }
            if map.physical(key.offset).is_none() {
                map.insert(key.offset, chunk.length, chunk.stripe_offset)?;
            }
            off += chunk.item_size();
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkMap;
    use crate::btrfs::FormatError;
    use rand::{prelude::SliceRandom, rngs::SmallRng, SeedableRng};

    #[test]
    fn basic() {
        let mut map = ChunkMap::new();
        map.insert(0, 10, 100).unwrap();
        map.insert(20, 10, 300).unwrap();

        assert_eq!(map.physical(0), Some(100));
        assert_eq!(map.physical(9), Some(109));
        assert_eq!(map.physical(10), None);
        assert_eq!(map.physical(25), Some(305));
        assert_eq!(map.physical(30), None);
        assert_eq!(map.physical_range(5, 5), Some(105));
        assert_eq!(map.physical_range(5, 6), None);
    }

    #[test]
    fn random_order() {
        let mut rng = SmallRng::from_entropy();
        let mut chunks = (0..64_u64).map(|i| (i * 0x1000, i * 0x10)).collect::<Vec<_>>();
        chunks.shuffle(&mut rng);

        let mut map = ChunkMap::new();
        for (logical, physical) in chunks.iter().copied() {
            map.insert(logical, 0x1000, physical).unwrap();
        }
        assert_eq!(map.len(), 64);
        for (logical, physical) in chunks {
            assert_eq!(map.physical(logical + 7), Some(physical + 7));
        }
    }

    #[test]
    fn edge_overlap() {
        let mut map = ChunkMap::new();
        map.insert(100, 50, 0).unwrap();
        assert_eq!(map.insert(149, 10, 0), Err(FormatError::ChunkOverlap(149)));
        assert_eq!(map.insert(90, 11, 0), Err(FormatError::ChunkOverlap(90)));
        map.insert(150, 10, 0).unwrap();
        map.insert(90, 10, 0).unwrap();
    }

    #[test]
    fn inside_overlap() {
        let mut map = ChunkMap::new();
        map.insert(100, 50, 0).unwrap();
        assert!(map.insert(110, 5, 0).is_err());
        assert!(map.insert(50, 200, 0).is_err());
        // identical chunk twice is fine
        map.insert(100, 50, 0).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn empty_and_wrapping_chunks() {
        let mut map = ChunkMap::new();
        assert!(map.insert(10, 0, 0).is_err());
        assert!(map.insert(u64::MAX - 1, 10, 0).is_err());
        assert!(map.is_empty());
    }
}
