//! The last few submitted images, kept on disk in a rotating set of slots `0..last_n`.
//!
//! An image is written before it runs, so whatever the guest or the harness dies of,
//! the input that did it is left behind and can be fed back with `repro` or `run`.
use anyhow::Context;
use std::{
    fs::{create_dir_all, write},
    path::{Path, PathBuf},
};

pub const DEFAULT_LAST_N: u64 = 15;

pub struct CurrentInputs {
    dir: PathBuf,
    last_n: u64,
    count: u64,
}

impl CurrentInputs {
    pub fn new(dir: PathBuf, last_n: u64) -> anyhow::Result<Self> {
        if last_n == 0 {
            anyhow::bail!("at least one current input must be kept");
        }
        create_dir_all(&dir)
            .with_context(|| format!("failed to create current dir {}", dir.display()))?;
        Ok(Self {
            dir,
            last_n,
            count: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `image` in the next slot, overwriting the oldest one.
    pub fn save(&mut self, image: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.dir.join((self.count % self.last_n).to_string());
        write(&path, image)?;
        self.count += 1;
        Ok(path)
    }

    /// Slot of the most recent image.
    pub fn latest(&self) -> Option<PathBuf> {
        if self.count == 0 {
            return None;
        }
        Some(self.dir.join(((self.count - 1) % self.last_n).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::fs::{read, read_dir, remove_dir_all};

    #[test]
    fn rotates_over_slots() {
        let mut rng = SmallRng::from_entropy();
        let dir = std::env::temp_dir().join(format!("btrfuzz-current-{:x}", rng.gen::<u64>()));
        let mut cur = CurrentInputs::new(dir.clone(), 3).unwrap();
        assert!(cur.latest().is_none());
        for i in 0..7_u8 {
            let p = cur.save(&[i; 8]).unwrap();
            assert_eq!(cur.latest(), Some(p));
        }
        assert_eq!(read_dir(&dir).unwrap().count(), 3);
        // slot = count % 3: images 6, 4 and 5
        assert_eq!(read(dir.join("0")).unwrap(), vec![6; 8]);
        assert_eq!(read(dir.join("1")).unwrap(), vec![4; 8]);
        assert_eq!(read(dir.join("2")).unwrap(), vec![5; 8]);
        assert_eq!(cur.latest(), Some(dir.join("0")));
        remove_dir_all(&dir).unwrap();

        assert!(CurrentInputs::new(dir, 0).is_err());
    }
}
