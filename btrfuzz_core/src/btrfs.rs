//! btrfs on-disk layout, limited to what the codec, fixup and mutator need.
//!
//! Everything here works on byte offsets rather than packed structs: images are
//! attacker controlled (they come straight out of the mutator), so every read is
//! bounds checked and no parsing helper panics on malformed input.
//!
//! See fs/btrfs/ctree.h and include/uapi/linux/btrfs_tree.h in the kernel tree.

use bytes::Buf;
use std::convert::TryFrom;
use thiserror::Error;

/// Offset of the primary superblock.
pub const SUPERBLOCK_OFFSET: u64 = 0x10000;
/// Primary superblock and its mirrors.
pub const SUPERBLOCK_MIRRORS: [u64; 3] = [0x10000, 0x4000000, 0x4000000000];
pub const SUPERBLOCK_SIZE: usize = 4096;
pub const MAGIC: [u8; 8] = *b"_BHRfS_M";
pub const CSUM_SIZE: usize = 32;
/// Value of `csum_type` for crc32c, the only algorithm fixup knows how to redo.
pub const CSUM_TYPE_CRC32: u16 = 0;
pub const SYS_CHUNK_ARRAY_SIZE: usize = 2048;

pub const HEADER_SIZE: usize = 101;
pub const KEY_SIZE: usize = 17;
pub const ITEM_SIZE: usize = 25;
pub const KEY_PTR_SIZE: usize = 33;
/// Chunk item without its stripes.
pub const CHUNK_SIZE: usize = 48;
pub const STRIPE_SIZE: usize = 32;

pub const ROOT_ITEM_KEY: u8 = 132;
pub const CHUNK_ITEM_KEY: u8 = 228;
/// Offset of `bytenr` inside a root item (after the embedded inode item,
/// generation and root_dirid).
pub const ROOT_ITEM_BYTENR: usize = 176;

pub const MAX_LEVEL: u8 = 8;
pub const MIN_NODE_SIZE: u32 = 4096;
pub const MAX_NODE_SIZE: u32 = 65536;

/// Field offsets inside the superblock.
pub mod sb {
    pub const CSUM: usize = 0x00;
    pub const FSID: usize = 0x20;
    pub const BYTENR: usize = 0x30;
    pub const FLAGS: usize = 0x38;
    pub const MAGIC: usize = 0x40;
    pub const GENERATION: usize = 0x48;
    pub const ROOT: usize = 0x50;
    pub const CHUNK_ROOT: usize = 0x58;
    pub const LOG_ROOT: usize = 0x60;
    pub const LOG_ROOT_TRANSID: usize = 0x68;
    pub const TOTAL_BYTES: usize = 0x70;
    pub const BYTES_USED: usize = 0x78;
    pub const ROOT_DIR_OBJECTID: usize = 0x80;
    pub const NUM_DEVICES: usize = 0x88;
    pub const SECTOR_SIZE: usize = 0x90;
    pub const NODE_SIZE: usize = 0x94;
    pub const LEAF_SIZE: usize = 0x98;
    pub const STRIPE_SIZE: usize = 0x9c;
    pub const SYS_CHUNK_ARRAY_SIZE: usize = 0xa0;
    pub const CHUNK_ROOT_GENERATION: usize = 0xa4;
    pub const COMPAT_FLAGS: usize = 0xac;
    pub const COMPAT_RO_FLAGS: usize = 0xb4;
    pub const INCOMPAT_FLAGS: usize = 0xbc;
    pub const CSUM_TYPE: usize = 0xc4;
    pub const ROOT_LEVEL: usize = 0xc6;
    pub const CHUNK_ROOT_LEVEL: usize = 0xc7;
    pub const LOG_ROOT_LEVEL: usize = 0xc8;
    pub const DEV_ITEM: usize = 0xc9;
    pub const LABEL: usize = 0x12b;
    pub const SYS_CHUNK_ARRAY: usize = 0x32b;
}

/// Field offsets inside a tree block header.
pub mod hdr {
    pub const CSUM: usize = 0;
    pub const FSID: usize = 32;
    pub const BYTENR: usize = 48;
    pub const FLAGS: usize = 56;
    pub const CHUNK_TREE_UUID: usize = 64;
    pub const GENERATION: usize = 80;
    pub const OWNER: usize = 88;
    pub const NRITEMS: usize = 96;
    pub const LEVEL: usize = 100;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("image too small for {what} at {offset:#x}")]
    Truncated { what: &'static str, offset: u64 },
    #[error("bad superblock magic at {0:#x}")]
    BadMagic(u64),
    #[error("logical address {0:#x} not mapped")]
    Unmapped(u64),
    #[error("bad node size: {0}")]
    BadNodeSize(u32),
    #[error("bad sys_chunk_array: {0}")]
    BadSysArray(String),
    #[error("chunk at {0:#x} overlaps a mapped chunk")]
    ChunkOverlap(u64),
    #[error("tree too deep at {0:#x}")]
    TooDeep(u64),
    #[error("too many tree nodes")]
    TooManyNodes,
}

#[inline]
pub fn le_u8(buf: &[u8], off: usize) -> Option<u8> {
    buf.get(off).copied()
}

#[inline]
pub fn le_u16(buf: &[u8], off: usize) -> Option<u16> {
    let mut b = buf.get(off..off.checked_add(2)?)?;
    Some(b.get_u16_le())
}

#[inline]
pub fn le_u32(buf: &[u8], off: usize) -> Option<u32> {
    let mut b = buf.get(off..off.checked_add(4)?)?;
    Some(b.get_u32_le())
}

#[inline]
pub fn le_u64(buf: &[u8], off: usize) -> Option<u64> {
    let mut b = buf.get(off..off.checked_add(8)?)?;
    Some(b.get_u64_le())
}

/// Byte range `[offset, offset + len)` of `img`, if it lies inside.
#[inline]
pub fn block(img: &[u8], offset: u64, len: usize) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    img.get(start..start.checked_add(len)?)
}

/// crc32c of a checksummed block, i.e. everything after the csum field.
pub fn block_csum(block: &[u8]) -> u32 {
    crc32c::crc32c(block.get(CSUM_SIZE..).unwrap_or_default())
}

/// First four bytes of the csum field, which is all crc32c uses.
pub fn stored_csum(block: &[u8]) -> Option<u32> {
    le_u32(block, 0)
}

pub fn csum_matches(block: &[u8]) -> bool {
    block.len() > CSUM_SIZE && stored_csum(block) == Some(block_csum(block))
}

/// Offsets of all superblock copies that lie completely inside an image of `len` bytes.
pub fn superblock_copies(len: usize) -> impl Iterator<Item = u64> {
    SUPERBLOCK_MIRRORS
        .iter()
        .copied()
        .filter(move |off| off + SUPERBLOCK_SIZE as u64 <= len as u64)
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub offset: u64,
    pub has_magic: bool,
    pub bytenr: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub sector_size: u32,
    pub node_size: u32,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse the superblock copy at `offset`. The magic is reported, not enforced.
    pub fn read(img: &[u8], offset: u64) -> Result<Self, FormatError> {
        let buf = block(img, offset, SUPERBLOCK_SIZE).ok_or(FormatError::Truncated {
            what: "superblock",
            offset,
        })?;
        // SUPERBLOCK_SIZE covers every field below, so the reads can't fail.
        let u64_at = |off| le_u64(buf, off).unwrap_or_default();
        let u32_at = |off| le_u32(buf, off).unwrap_or_default();
        let u8_at = |off| le_u8(buf, off).unwrap_or_default();

        let array_size = (u32_at(sb::SYS_CHUNK_ARRAY_SIZE) as usize).min(SYS_CHUNK_ARRAY_SIZE);
        let array_start = sb::SYS_CHUNK_ARRAY;

        Ok(Self {
            offset,
            has_magic: buf[sb::MAGIC..sb::MAGIC + MAGIC.len()] == MAGIC,
            bytenr: u64_at(sb::BYTENR),
            generation: u64_at(sb::GENERATION),
            root: u64_at(sb::ROOT),
            chunk_root: u64_at(sb::CHUNK_ROOT),
            log_root: u64_at(sb::LOG_ROOT),
            total_bytes: u64_at(sb::TOTAL_BYTES),
            sector_size: u32_at(sb::SECTOR_SIZE),
            node_size: u32_at(sb::NODE_SIZE),
            csum_type: le_u16(buf, sb::CSUM_TYPE).unwrap_or_default(),
            root_level: u8_at(sb::ROOT_LEVEL),
            chunk_root_level: u8_at(sb::CHUNK_ROOT_LEVEL),
            log_root_level: u8_at(sb::LOG_ROOT_LEVEL),
            sys_chunk_array: buf[array_start..array_start + array_size].to_vec(),
        })
    }

    pub fn check_node_size(&self) -> Result<usize, FormatError> {
        let ns = self.node_size;
        if ns.is_power_of_two() && (MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&ns) {
            Ok(ns as usize)
        } else {
            Err(FormatError::BadNodeSize(ns))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl Header {
    pub fn parse(node: &[u8]) -> Option<Self> {
        if node.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            bytenr: le_u64(node, hdr::BYTENR)?,
            generation: le_u64(node, hdr::GENERATION)?,
            owner: le_u64(node, hdr::OWNER)?,
            nritems: le_u32(node, hdr::NRITEMS)?,
            level: le_u8(node, hdr::LEVEL)?,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Number of items (or key pointers) that really fit into a node of `node_len` bytes.
    pub fn clamped_nritems(&self, node_len: usize) -> usize {
        let entry = if self.is_leaf() { ITEM_SIZE } else { KEY_PTR_SIZE };
        let cap = node_len.saturating_sub(HEADER_SIZE) / entry;
        (self.nritems as usize).min(cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub objectid: u64,
    pub ty: u8,
    pub offset: u64,
}

impl Key {
    pub fn parse(buf: &[u8], off: usize) -> Option<Self> {
        Some(Self {
            objectid: le_u64(buf, off)?,
            ty: le_u8(buf, off + 8)?,
            offset: le_u64(buf, off + 9)?,
        })
    }
}

/// Leaf item. `offset` is relative to the end of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub key: Key,
    pub offset: u32,
    pub size: u32,
}

impl Item {
    pub fn nth(leaf: &[u8], n: usize) -> Option<Self> {
        let off = HEADER_SIZE + n * ITEM_SIZE;
        Some(Self {
            key: Key::parse(leaf, off)?,
            offset: le_u32(leaf, off + KEY_SIZE)?,
            size: le_u32(leaf, off + KEY_SIZE + 4)?,
        })
    }

    pub fn data<'a>(&self, leaf: &'a [u8]) -> Option<&'a [u8]> {
        let start = HEADER_SIZE.checked_add(self.offset as usize)?;
        leaf.get(start..start.checked_add(self.size as usize)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

impl KeyPtr {
    pub fn nth(node: &[u8], n: usize) -> Option<Self> {
        let off = HEADER_SIZE + n * KEY_PTR_SIZE;
        Some(Self {
            key: Key::parse(node, off)?,
            blockptr: le_u64(node, off + KEY_SIZE)?,
            generation: le_u64(node, off + KEY_SIZE + 8)?,
        })
    }
}

/// A chunk item, reduced to the first stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub length: u64,
    pub num_stripes: u16,
    pub stripe_offset: u64,
}

impl Chunk {
    pub fn parse(buf: &[u8], off: usize) -> Option<Self> {
        Some(Self {
            length: le_u64(buf, off)?,
            num_stripes: le_u16(buf, off + 44)?,
            // devid(8) then offset(8) of stripe 0
            stripe_offset: le_u64(buf, off + CHUNK_SIZE + 8)?,
        })
    }

    /// Size of the whole item, stripes included.
    pub fn item_size(&self) -> usize {
        CHUNK_SIZE + STRIPE_SIZE * self.num_stripes.max(1) as usize
    }
}

pub fn root_item_bytenr(item: &[u8]) -> Option<u64> {
    le_u64(item, ROOT_ITEM_BYTENR)
}
