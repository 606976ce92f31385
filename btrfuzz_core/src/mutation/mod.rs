//! Structure-aware image mutation.
//!
//! `mutate` is a pure function of its inputs and seed. Most operations land on the
//! fields that steer the kernel's parsing (superblock fields, tree block headers, item
//! and key pointer arrays), the rest are spread uniformly over the payload. Lengths
//! never change: for containers only the payload bytes are touched, so the extents
//! and the decompressed size stay valid.
use crate::{
    btrfs::*,
    image::{is_container, CompressedImage},
    tree::Layout,
    RngType,
};
use rand::prelude::*;
use std::{cmp::min, ops::Range};

pub mod ops;

use ops::OPERATIONS;

/// Item or key pointer entries considered per node.
const MAX_TARGET_ENTRIES: usize = 64;
/// Leading bytes of sys_chunk_array worth targeting: one key, one chunk, one stripe.
const SYS_ARRAY_HEAD: usize = KEY_SIZE + CHUNK_SIZE + STRIPE_SIZE;

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// Chance of an operation hitting a structural field, as numerator and denominator.
    pub structural: (u32, u32),
    /// Chance of crossover when a second input is available.
    pub crossover: (u32, u32),
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            structural: (3, 4),
            crossover: (1, 4),
        }
    }
}

/// A metadata block inside the mutable payload.
#[derive(Debug, Clone)]
struct Block {
    /// Offset in the decompressed image.
    image_offset: u64,
    /// Range in the payload.
    range: Range<usize>,
}

/// Mutable view of an input: the bytes that may change plus where the metadata lives.
struct Body {
    container: Option<CompressedImage>,
    data: Vec<u8>,
    blocks: Vec<Block>,
}

impl Body {
    fn parse(bytes: &[u8]) -> Self {
        if is_container(bytes) {
            match CompressedImage::from_bytes(bytes) {
                Ok(mut img) => {
                    let blocks = img
                        .payload_ranges()
                        .map(|(e, range)| Block {
                            image_offset: e.offset,
                            range,
                        })
                        .collect();
                    let data = std::mem::take(&mut img.data);
                    return Self {
                        container: Some(img),
                        data,
                        blocks,
                    };
                }
                Err(_) => return Self::uniform(bytes),
            }
        }

        let blocks = match Layout::scan(bytes) {
            Ok(layout) => {
                let mut blocks = superblock_copies(bytes.len())
                    .map(|off| Block {
                        image_offset: off,
                        range: off as usize..off as usize + SUPERBLOCK_SIZE,
                    })
                    .collect::<Vec<_>>();
                blocks.extend(layout.nodes.iter().map(|n| Block {
                    image_offset: n.physical,
                    range: n.physical as usize..n.physical as usize + layout.node_size,
                }));
                blocks
            }
            Err(_) => Vec::new(),
        };
        Self {
            container: None,
            data: bytes.to_vec(),
            blocks,
        }
    }

    fn uniform(bytes: &[u8]) -> Self {
        Self {
            container: None,
            data: bytes.to_vec(),
            blocks: Vec::new(),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self.container {
            Some(mut img) => {
                img.data = self.data;
                img.to_bytes()
            }
            None => self.data,
        }
    }

    /// Structural field ranges in payload coordinates.
    fn targets(&self) -> Vec<Range<usize>> {
        let mut targets = Vec::new();
        for b in &self.blocks {
            let fields = if SUPERBLOCK_MIRRORS.contains(&b.image_offset) {
                superblock_fields()
            } else {
                node_fields(&self.data[b.range.clone()])
            };
            for f in fields {
                let start = b.range.start + f.start;
                let end = min(b.range.start + f.end, b.range.end);
                if start < end {
                    targets.push(start..end);
                }
            }
        }
        targets
    }
}

fn superblock_fields() -> Vec<Range<usize>> {
    let field = |off: usize, len: usize| off..off + len;
    vec![
        field(sb::CSUM, CSUM_SIZE),
        field(sb::BYTENR, 8),
        field(sb::FLAGS, 8),
        field(sb::MAGIC, 8),
        field(sb::GENERATION, 8),
        field(sb::ROOT, 8),
        field(sb::CHUNK_ROOT, 8),
        field(sb::LOG_ROOT, 8),
        field(sb::TOTAL_BYTES, 8),
        field(sb::BYTES_USED, 8),
        field(sb::NUM_DEVICES, 8),
        field(sb::SECTOR_SIZE, 4),
        field(sb::NODE_SIZE, 4),
        field(sb::STRIPE_SIZE, 4),
        field(sb::SYS_CHUNK_ARRAY_SIZE, 4),
        field(sb::COMPAT_RO_FLAGS, 8),
        field(sb::INCOMPAT_FLAGS, 8),
        field(sb::CSUM_TYPE, 2),
        field(sb::ROOT_LEVEL, 3),
        field(sb::SYS_CHUNK_ARRAY, SYS_ARRAY_HEAD),
    ]
}

fn node_fields(node: &[u8]) -> Vec<Range<usize>> {
    let field = |off: usize, len: usize| off..off + len;
    let mut fields = vec![
        field(hdr::BYTENR, 8),
        field(hdr::FLAGS, 8),
        field(hdr::GENERATION, 8),
        field(hdr::OWNER, 8),
        field(hdr::NRITEMS, 4),
        field(hdr::LEVEL, 1),
    ];
    let header = match Header::parse(node) {
        Some(h) => h,
        None => return fields,
    };
    let n = min(header.clamped_nritems(node.len()), MAX_TARGET_ENTRIES);
    for i in 0..n {
        if header.is_leaf() {
            let off = HEADER_SIZE + i * ITEM_SIZE;
            fields.push(field(off, KEY_SIZE));
            fields.push(field(off + KEY_SIZE, 8));
        } else {
            let off = HEADER_SIZE + i * KEY_PTR_SIZE;
            fields.push(field(off, KEY_SIZE));
            fields.push(field(off + KEY_SIZE, 16));
        }
    }
    fields
}

/// Mutate `image`, optionally mixing in bytes of `other`. The result has the length of
/// `image` and depends only on the inputs and `seed`.
pub fn mutate(image: &[u8], other: Option<&[u8]>, seed: u64, config: &MutatorConfig) -> Vec<u8> {
    let mut rng = RngType::seed_from_u64(seed);
    let mut body = Body::parse(image);
    if body.data.is_empty() {
        return image.to_vec();
    }

    if let Some(other) = other {
        let (n, d) = config.crossover;
        if rng.gen_ratio(n, d) {
            crossover(&mut rng, &mut body, &Body::parse(other));
        }
    }

    let targets = body.targets();
    let (n, d) = config.structural;
    let mut mutated = false;
    let mut tries = 0;
    while tries < 128 && (!mutated || rng.gen_ratio(1, 3)) {
        let window = match targets.choose(&mut rng) {
            Some(t) if rng.gen_ratio(n, d) => t.clone(),
            _ => 0..body.data.len(),
        };
        let op = OPERATIONS.choose(&mut rng).unwrap();
        mutated = op(&mut rng, &mut body.data[window]);
        tries += 1;
    }

    body.into_bytes()
}

/// Copy a block of `other` with the same image offset and length, or failing that a
/// block at the same relative position.
fn crossover(rng: &mut RngType, body: &mut Body, other: &Body) -> bool {
    if other.data.is_empty() {
        return false;
    }
    let pairs = body
        .blocks
        .iter()
        .filter_map(|b| {
            other
                .blocks
                .iter()
                .find(|o| o.image_offset == b.image_offset && o.range.len() == b.range.len())
                .map(|o| (b.range.clone(), o.range.clone()))
        })
        .collect::<Vec<_>>();
    if let Some((dst, src)) = pairs.choose(rng) {
        body.data[dst.clone()].copy_from_slice(&other.data[src.clone()]);
        return true;
    }

    let max = min(min(body.data.len(), other.data.len()), 4096);
    let len = rng.gen_range(1..=max);
    let dst = rng.gen_range(0..=body.data.len() - len);
    let rel = dst as f64 / body.data.len() as f64;
    let src = min((rel * other.data.len() as f64) as usize, other.data.len() - len);
    body.data[dst..dst + len].copy_from_slice(&other.data[src..src + len]);
    true
}
