//! Candidate image container.
//!
//! Corpus entries are usually stored compressed: only the metadata that matters for
//! mounting is kept, the rest of the filesystem is implied zeroes. Layout of the
//! stored form:
//!
//! ```text
//! "BFZI" | version: u32 LE | bincode(CompressedImage)
//! ```
//!
//! Anything not starting with the container magic is taken as a raw image.

use crate::{
    btrfs::{superblock_copies, FormatError, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE},
    tree::{Layout, TreeKind},
};
use bincode::Options;
use serde_derive::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

pub const CONTAINER_MAGIC: [u8; 4] = *b"BFZI";
pub const CONTAINER_VERSION: u32 = 1;
pub const CONTAINER_HEADER_SIZE: usize = 8;
/// Largest decompressed image accepted.
pub const MAX_IMAGE_SIZE: u64 = 1 << 30;
/// Smallest image that still holds the primary superblock.
pub const MIN_IMAGE_SIZE: u64 = SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bad container magic")]
    BadMagic,
    #[error("unsupported container version: {0}")]
    UnsupportedVersion(u32),
    #[error("malformed container: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("image size {0:#x} exceeds the limit")]
    TooLarge(u64),
    #[error("extent {offset:#x}+{len:#x} out of image range")]
    ExtentOutOfRange { offset: u64, len: u32 },
    #[error("payload length {actual}, extents describe {expected}")]
    DataLength { expected: u64, actual: u64 },
    #[error("image too small: {0:#x} bytes")]
    TooSmall(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub len: u32,
}

impl Extent {
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedImage {
    /// Size of the decompressed image.
    pub size: u64,
    pub extents: Vec<Extent>,
    /// Payload of every extent, concatenated in order.
    pub data: Vec<u8>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_IMAGE_SIZE + (1 << 20))
}

/// Whether `bytes` is in the stored container form.
pub fn is_container(bytes: &[u8]) -> bool {
    bytes.starts_with(&CONTAINER_MAGIC)
}

impl CompressedImage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if !is_container(bytes) || bytes.len() < CONTAINER_HEADER_SIZE {
            return Err(DecodeError::BadMagic);
        }
        let mut version = [0; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != CONTAINER_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let img: CompressedImage = codec().deserialize(&bytes[CONTAINER_HEADER_SIZE..])?;
        img.validate()?;
        Ok(img)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONTAINER_HEADER_SIZE + self.data.len() + 64);
        out.extend_from_slice(&CONTAINER_MAGIC);
        out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        // serializing plain integers and vectors into a Vec can't fail
        if let Err(e) = codec().serialize_into(&mut out, self) {
            log::error!("failed to serialize image: {}", e);
        }
        out
    }

    /// Check size limits, extent bounds and payload length.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.size > MAX_IMAGE_SIZE {
            return Err(DecodeError::TooLarge(self.size));
        }
        if self.size < MIN_IMAGE_SIZE {
            return Err(DecodeError::TooSmall(self.size));
        }
        let mut expected = 0_u64;
        for e in &self.extents {
            match e.offset.checked_add(e.len as u64) {
                Some(end) if end <= self.size => (),
                _ => {
                    return Err(DecodeError::ExtentOutOfRange {
                        offset: e.offset,
                        len: e.len,
                    })
                }
            }
            expected += e.len as u64;
        }
        if expected != self.data.len() as u64 {
            return Err(DecodeError::DataLength {
                expected,
                actual: self.data.len() as u64,
            });
        }
        Ok(())
    }

    /// Payload range of each extent inside `data`.
    pub fn payload_ranges(&self) -> impl Iterator<Item = (Extent, Range<usize>)> + '_ {
        let mut start = 0;
        self.extents.iter().map(move |e| {
            let r = start..start + e.len as usize;
            start = r.end;
            (*e, r)
        })
    }

    /// Expand into the raw image. Must be validated first, which `from_bytes` does.
    pub fn decompress(&self) -> Vec<u8> {
        let mut raw = vec![0; self.size as usize];
        for (e, r) in self.payload_ranges() {
            let dst = e.offset as usize;
            raw[dst..dst + r.len()].copy_from_slice(&self.data[r]);
        }
        raw
    }

    /// Keep every superblock copy, chunk and root tree nodes whole, and the header plus
    /// item (or key pointer) array of every other tree node.
    pub fn compress(raw: &[u8]) -> Result<Self, FormatError> {
        let layout = Layout::scan(raw)?;

        let mut ranges = superblock_copies(raw.len())
            .map(|off| (off, SUPERBLOCK_SIZE))
            .collect::<Vec<_>>();
        for n in &layout.nodes {
            let len = match n.kind {
                TreeKind::Chunk | TreeKind::Root => layout.node_size,
                TreeKind::Other => n.structural_len().min(layout.node_size),
            };
            ranges.push((n.physical, len));
        }
        ranges.sort_unstable();

        let mut extents: Vec<Extent> = Vec::with_capacity(ranges.len());
        let mut data = Vec::new();
        for (offset, len) in ranges {
            if let Some(last) = extents.last() {
                if offset < last.range().end {
                    log::debug!("dropping overlapping block at {:#x}", offset);
                    continue;
                }
            }
            // scan only records blocks that are inside the image
            let start = offset as usize;
            data.extend_from_slice(&raw[start..start + len]);
            extents.push(Extent {
                offset,
                len: len as u32,
            });
        }

        Ok(Self {
            size: raw.len() as u64,
            extents,
            data,
        })
    }
}

/// Cheap validation, no allocation of the decompressed image. Returns the decompressed size.
pub fn check(bytes: &[u8]) -> Result<u64, DecodeError> {
    if is_container(bytes) {
        CompressedImage::from_bytes(bytes).map(|img| img.size)
    } else {
        check_raw_size(bytes.len() as u64)
    }
}

fn check_raw_size(len: u64) -> Result<u64, DecodeError> {
    if len < MIN_IMAGE_SIZE {
        Err(DecodeError::TooSmall(len))
    } else if len > MAX_IMAGE_SIZE {
        Err(DecodeError::TooLarge(len))
    } else {
        Ok(len)
    }
}

/// Raw image bytes of a candidate, in either form.
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if is_container(bytes) {
        Ok(CompressedImage::from_bytes(bytes)?.decompress())
    } else {
        check_raw_size(bytes.len() as u64)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{btrfs::HEADER_SIZE, synth};

    #[test]
    fn compress_synthetic() {
        let raw = synth::image();
        let img = CompressedImage::compress(&raw).unwrap();
        assert_eq!(img.size, raw.len() as u64);
        assert_eq!(img.extents[0].offset, SUPERBLOCK_OFFSET);
        assert_eq!(img.extents.len(), 1 + synth::node_offsets().len());
        assert!(img.data.len() < raw.len());

        // chunk and root tree nodes are kept whole
        let chunk = img
            .extents
            .iter()
            .find(|e| e.offset == synth::physical(synth::CHUNK_ROOT_LOGICAL))
            .unwrap();
        assert_eq!(chunk.len as usize, synth::NODE_SIZE);
        let fs_root = img
            .extents
            .iter()
            .find(|e| e.offset == synth::physical(synth::FS_ROOT_LOGICAL))
            .unwrap();
        assert_eq!(fs_root.len as usize, HEADER_SIZE + 2 * 33);

        let bytes = img.to_bytes();
        assert!(is_container(&bytes));
        assert_eq!(check(&bytes).unwrap(), raw.len() as u64);
        let back = decode(&bytes).unwrap();
        assert_eq!(back.len(), raw.len());
        // everything the walk needs survives
        assert_eq!(Layout::scan(&back).unwrap().nodes.len(), synth::node_offsets().len());
    }

    #[test]
    fn raw_passthrough() {
        let raw = synth::image();
        assert_eq!(check(&raw).unwrap(), raw.len() as u64);
        assert_eq!(decode(&raw).unwrap(), raw);
        assert!(matches!(check(&raw[..100]), Err(DecodeError::TooSmall(100))));
        assert!(matches!(check(&[]), Err(DecodeError::TooSmall(0))));
    }

    #[test]
    fn bad_version() {
        let mut bytes = CompressedImage::compress(&synth::image()).unwrap().to_bytes();
        bytes[4] = 9;
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::UnsupportedVersion(9))
        ));
        assert!(matches!(
            CompressedImage::from_bytes(b"nope"),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn truncated_body() {
        let bytes = CompressedImage::compress(&synth::image()).unwrap().to_bytes();
        for len in [4, 8, 20, bytes.len() - 1].iter().copied() {
            assert!(check(&bytes[..len]).is_err(), "{}", len);
        }
    }

    fn container(size: u64, extents: Vec<Extent>, data: Vec<u8>) -> Vec<u8> {
        CompressedImage {
            size,
            extents,
            data,
        }
        .to_bytes()
    }

    #[test]
    fn extent_bounds() {
        let size = MIN_IMAGE_SIZE;
        let bad = container(size, vec![Extent { offset: size - 1, len: 2 }], vec![0; 2]);
        assert!(matches!(check(&bad), Err(DecodeError::ExtentOutOfRange { .. })));

        let wrap = container(size, vec![Extent { offset: u64::MAX, len: 2 }], vec![0; 2]);
        assert!(matches!(check(&wrap), Err(DecodeError::ExtentOutOfRange { .. })));

        let short = container(size, vec![Extent { offset: 0, len: 8 }], vec![0; 7]);
        assert!(matches!(
            check(&short),
            Err(DecodeError::DataLength { expected: 8, actual: 7 })
        ));

        let ok = container(size, vec![Extent { offset: 16, len: 4 }], vec![1, 2, 3, 4]);
        let raw = decode(&ok).unwrap();
        assert_eq!(&raw[14..22], &[0, 0, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn size_limits() {
        let huge = container(MAX_IMAGE_SIZE + 1, Vec::new(), Vec::new());
        assert!(matches!(check(&huge), Err(DecodeError::TooLarge(_))));
        let tiny = container(16, Vec::new(), Vec::new());
        assert!(matches!(check(&tiny), Err(DecodeError::TooSmall(16))));
    }
}
