//! Restore the fields the kernel validates before anything interesting happens.
//!
//! A mutated image almost never mounts as is: a single flipped bit breaks the
//! superblock checksum and the mount dies in the first few hundred instructions.
//! Fixup puts back the superblock magic and recomputes the superblock and tree node
//! checksums, nothing else, so every other perturbation reaches the deeper code.

use crate::{
    btrfs::*,
    tree::Layout,
};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl Patch {
    fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.bytes.len()
    }
}

/// Ordered patches derived from one image. Applying them twice is the same as once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupPlan {
    patches: Vec<Patch>,
}

impl FixupPlan {
    pub fn derive(img: &[u8]) -> Self {
        let mut patches = superblock_patches(img);
        let nodes = if patches.is_empty() {
            node_patches(img)
        } else {
            // nodes may overlap a superblock copy, scan what the kernel will see
            let mut work = img.to_vec();
            apply_patches(&patches, &mut work);
            node_patches(&work)
        };
        patches.extend(nodes);
        Self { patches }
    }

    pub fn apply(&self, img: &mut [u8]) {
        apply_patches(&self.patches, img)
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Fix `img` in place, returns the number of patches applied.
pub fn fixup(img: &mut [u8]) -> usize {
    let sb = superblock_patches(img);
    apply_patches(&sb, img);
    let nodes = node_patches(img);
    apply_patches(&nodes, img);
    sb.len() + nodes.len()
}

fn apply_patches(patches: &[Patch], img: &mut [u8]) {
    for p in patches {
        let r = p.range();
        if let Some(dst) = img.get_mut(r) {
            dst.copy_from_slice(&p.bytes);
        }
    }
}

fn csum_patch(offset: u64, block: &[u8]) -> Option<Patch> {
    let csum = block_csum(block);
    if stored_csum(block) == Some(csum) {
        None
    } else {
        Some(Patch {
            offset,
            bytes: csum.to_le_bytes().to_vec(),
        })
    }
}

fn superblock_patches(img: &[u8]) -> Vec<Patch> {
    let mut patches = Vec::new();

    for off in superblock_copies(img.len()) {
        let mut copy = match block(img, off, SUPERBLOCK_SIZE) {
            Some(b) => b.to_vec(),
            None => continue,
        };
        if copy[sb::MAGIC..sb::MAGIC + MAGIC.len()] != MAGIC {
            copy[sb::MAGIC..sb::MAGIC + MAGIC.len()].copy_from_slice(&MAGIC);
            patches.push(Patch {
                offset: off + sb::MAGIC as u64,
                bytes: MAGIC.to_vec(),
            });
        }
        if le_u16(&copy, sb::CSUM_TYPE) == Some(CSUM_TYPE_CRC32) {
            patches.extend(csum_patch(off, &copy));
        }
    }

    patches
}

fn node_patches(img: &[u8]) -> Vec<Patch> {
    let layout = match Layout::scan(img) {
        Ok(layout) => layout,
        Err(e) => {
            log::debug!("no node fixup: {}", e);
            return Vec::new();
        }
    };
    if layout.superblock.csum_type != CSUM_TYPE_CRC32 {
        return Vec::new();
    }

    let node_size = layout.node_size as u64;
    let supers = superblock_copies(img.len())
        .map(|off| off..off + SUPERBLOCK_SIZE as u64)
        .collect::<Vec<_>>();
    let mut nodes = layout
        .nodes
        .iter()
        .map(|n| n.physical..n.physical + node_size)
        .collect::<Vec<_>>();
    nodes.sort_unstable_by_key(|r| r.start);

    let overlaps = |a: &Range<u64>, b: &Range<u64>| a.start < b.end && b.start < a.end;
    let mut patches = Vec::new();
    for (i, r) in nodes.iter().enumerate() {
        let prev_overlaps = i > 0 && overlaps(&nodes[i - 1], r);
        let next_overlaps = nodes.get(i + 1).map(|n| overlaps(n, r)).unwrap_or(false);
        if prev_overlaps || next_overlaps || supers.iter().any(|s| overlaps(s, r)) {
            log::debug!("node at {:#x} overlaps another block, leaving it alone", r.start);
            continue;
        }
        if let Some(node) = block(img, r.start, layout.node_size) {
            patches.extend(csum_patch(r.start, node));
        }
    }
    patches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn allowed_offsets(img_len: usize) -> Vec<Range<usize>> {
        let mut allowed = Vec::new();
        for off in superblock_copies(img_len) {
            let off = off as usize;
            allowed.push(off..off + 4);
            allowed.push(off + sb::MAGIC..off + sb::MAGIC + 8);
        }
        for off in synth::node_offsets() {
            allowed.push(off as usize..off as usize + 4);
        }
        allowed
    }

    fn mutate_metadata(rng: &mut SmallRng, img: &mut [u8]) {
        let mut targets = synth::node_offsets();
        targets.push(SUPERBLOCK_OFFSET);
        for _ in 0..8 {
            let base = targets[rng.gen_range(0..targets.len())] as usize;
            // keep away from fields the walk depends on
            let off = base + rng.gen_range(hdr::FSID..hdr::BYTENR);
            img[off] ^= 1 << rng.gen_range(0..8);
        }
    }

    #[test]
    fn clean_image_needs_nothing() {
        let img = synth::image();
        assert!(FixupPlan::derive(&img).is_empty());
    }

    #[test]
    fn corrupted_magic() {
        let mut img = synth::image();
        let magic = SUPERBLOCK_OFFSET as usize + sb::MAGIC;
        img[magic..magic + 8].copy_from_slice(b"_BHRfS_X");
        assert!(!synth::gates_pass(&img));

        let plan = FixupPlan::derive(&img);
        assert_eq!(plan.patches().len(), 2);
        plan.apply(&mut img);
        assert!(synth::gates_pass(&img));
        assert_eq!(img, synth::image());
    }

    #[test]
    fn restores_checksums_only() {
        let mut rng = SmallRng::from_entropy();
        let base = synth::image();
        let allowed = allowed_offsets(base.len());

        for _ in 0..64 {
            let mut img = base.clone();
            mutate_metadata(&mut rng, &mut img);
            let mutated = img.clone();

            fixup(&mut img);
            assert!(synth::gates_pass(&img));
            for (i, (a, b)) in mutated.iter().zip(img.iter()).enumerate() {
                if a != b {
                    assert!(allowed.iter().any(|r| r.contains(&i)), "byte {:#x} changed", i);
                }
            }
        }
    }

    #[test]
    fn idempotent() {
        let mut rng = SmallRng::from_entropy();
        for _ in 0..64 {
            let mut img = synth::image();
            for _ in 0..rng.gen_range(1..32) {
                let i = rng.gen_range(0..img.len());
                img[i] = rng.gen();
            }
            let mut once = img.clone();
            FixupPlan::derive(&once).apply(&mut once);
            let mut twice = once.clone();
            FixupPlan::derive(&twice).apply(&mut twice);
            assert_eq!(once, twice);
            assert!(FixupPlan::derive(&twice).is_empty());

            // in-place variant agrees with the plan
            let mut inplace = img.clone();
            fixup(&mut inplace);
            assert_eq!(inplace, once);
        }
    }

    #[test]
    fn unknown_csum_type() {
        let mut img = synth::image();
        let off = SUPERBLOCK_OFFSET as usize + sb::CSUM_TYPE;
        img[off..off + 2].copy_from_slice(&1_u16.to_le_bytes());
        let leaf = synth::physical(synth::FS_LEAVES_LOGICAL[0]) as usize;
        img[leaf + hdr::FSID] ^= 0xff;

        let plan = FixupPlan::derive(&img);
        assert!(plan.is_empty());
        fixup(&mut img);
        assert!(!synth::gates_pass(&img));
    }

    #[test]
    fn tiny_image() {
        let mut img = vec![0xaa; 100];
        assert_eq!(fixup(&mut img), 0);
        assert!(img.iter().all(|b| *b == 0xaa));
    }
}
