//! Boot, watch and kill the QEMU guests that host the runner.

pub mod qemu;
pub mod ssh;

pub type HashSet<K> = ahash::AHashSet<K>;
