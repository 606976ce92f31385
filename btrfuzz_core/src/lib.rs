//! Core algorithms and data structures of btrfuzz: the candidate image container,
//! just enough of the btrfs on-disk layout to find its gate fields, the fixup pass
//! and the structure-aware mutator.

use ahash::{AHashMap, AHashSet};

pub mod btrfs;
pub mod chunk;
pub mod fixup;
pub mod image;
pub mod mutation;
pub mod tree;

/// Synthetic images for tests of this and dependent crates.
#[cfg(any(test, feature = "synth"))]
pub mod synth;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;
