//! Tree walk over an image, used to locate every metadata block.
//!
//! The walk starts from the primary superblock: sys_chunk_array seeds the chunk map,
//! the chunk tree completes it, then the root tree and every tree referenced by a
//! ROOT_ITEM are visited, followed by the log tree. Mutated images can describe cycles
//! or absurdly deep trees, so the walk keeps a visited set and bounds both depth and
//! the number of nodes.

use crate::{
    btrfs::*,
    chunk::ChunkMap,
    HashSet,
};

/// Upper bound of tree blocks visited in one scan.
pub const MAX_NODES: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Chunk,
    Root,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub logical: u64,
    pub physical: u64,
    pub level: u8,
    pub nritems: usize,
    pub kind: TreeKind,
}

impl Node {
    /// Bytes of the node that carry structure: the header plus the item or key pointer array.
    pub fn structural_len(&self) -> usize {
        let entry = if self.level == 0 { ITEM_SIZE } else { KEY_PTR_SIZE };
        HEADER_SIZE + self.nritems * entry
    }
}

#[derive(Debug)]
pub struct Layout {
    pub superblock: Superblock,
    pub node_size: usize,
    pub chunks: ChunkMap,
    /// Visited nodes, in visiting order.
    pub nodes: Vec<Node>,
}

impl Layout {
    pub fn scan(img: &[u8]) -> Result<Self, FormatError> {
        let superblock = Superblock::read(img, SUPERBLOCK_OFFSET)?;
        let node_size = superblock.check_node_size()?;
        let chunks = ChunkMap::bootstrap(&superblock.sys_chunk_array)?;

        let mut walker = Walker {
            img,
            node_size,
            chunks,
            visited: HashSet::new(),
            nodes: Vec::new(),
        };
        walker.walk(superblock.chunk_root, TreeKind::Chunk, 0)?;
        walker.walk(superblock.root, TreeKind::Root, 0)?;
        if superblock.log_root != 0 {
            // log tree is allowed to be broken, the kernel replays it late
            if let Err(e) = walker.walk(superblock.log_root, TreeKind::Other, 0) {
                log::debug!("skipping log tree: {}", e);
            }
        }

        Ok(Self {
            superblock,
            node_size,
            chunks: walker.chunks,
            nodes: walker.nodes,
        })
    }
}

struct Walker<'a> {
    img: &'a [u8],
    node_size: usize,
    chunks: ChunkMap,
    visited: HashSet<u64>,
    nodes: Vec<Node>,
}

impl<'a> Walker<'a> {
    fn read_node(&self, logical: u64) -> Result<(u64, &'a [u8]), FormatError> {
        let physical = self
            .chunks
            .physical_range(logical, self.node_size as u64)
            .ok_or(FormatError::Unmapped(logical))?;
        let node = block(self.img, physical, self.node_size).ok_or(FormatError::Truncated {
            what: "tree node",
            offset: physical,
        })?;
        Ok((physical, node))
    }

    fn walk(&mut self, logical: u64, kind: TreeKind, depth: u8) -> Result<(), FormatError> {
        if depth > MAX_LEVEL {
            return Err(FormatError::TooDeep(logical));
        }
        if !self.visited.insert(logical) {
            return Ok(());
        }
        if self.nodes.len() >= MAX_NODES {
            return Err(FormatError::TooManyNodes);
        }

        let (physical, node) = self.read_node(logical)?;
        let header = Header::parse(node).ok_or(FormatError::Truncated {
            what: "tree header",
            offset: physical,
        })?;
        let nritems = header.clamped_nritems(node.len());
        self.nodes.push(Node {
            logical,
            physical,
            level: header.level,
            nritems,
            kind,
        });

        if header.is_leaf() {
            self.visit_items(node, nritems, kind)
        } else {
            for i in 0..nritems {
                if let Some(ptr) = KeyPtr::nth(node, i) {
                    self.walk(ptr.blockptr, kind, depth + 1)?;
                }
            }
            Ok(())
        }
    }

    fn visit_items(&mut self, leaf: &[u8], nritems: usize, kind: TreeKind) -> Result<(), FormatError> {
        for i in 0..nritems {
            let item = match Item::nth(leaf, i) {
                Some(item) => item,
                None => break,
            };
            let data = match item.data(leaf) {
                Some(data) => data,
                None => continue,
            };
            match (kind, item.key.ty) {
                (TreeKind::Chunk, CHUNK_ITEM_KEY) => {
                    if let Some(chunk) = Chunk::parse(data, 0) {
                        // sys chunks show up both here and in the superblock
                        if self.chunks.physical(item.key.offset).is_none() {
                            self.chunks
                                .insert(item.key.offset, chunk.length, chunk.stripe_offset)?;
                        }
                    }
                }
                (TreeKind::Root, ROOT_ITEM_KEY) => {
                    if let Some(bytenr) = root_item_bytenr(data) {
                        if let Err(e) = self.walk(bytenr, TreeKind::Other, 0) {
                            log::debug!("tree {} unreachable: {}", item.key.objectid, e);
                        }
                    }
                }
                _ => (),
            }
        }
        Ok(())
    }
}
