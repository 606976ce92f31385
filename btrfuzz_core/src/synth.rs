//! A tiny but well-formed btrfs layout for tests: one system chunk, a chunk tree
//! leaf, a root tree leaf and a two-level fs tree.

use crate::btrfs::*;

pub const NODE_SIZE: usize = 4096;
pub const IMAGE_SIZE: usize = 0x30000;
pub const CHUNK_LOGICAL: u64 = 0x400000;
pub const CHUNK_PHYSICAL: u64 = 0x20000;
pub const CHUNK_LEN: u64 = 0x10000;

pub const CHUNK_ROOT_LOGICAL: u64 = CHUNK_LOGICAL;
pub const ROOT_TREE_LOGICAL: u64 = CHUNK_LOGICAL + 0x1000;
pub const FS_ROOT_LOGICAL: u64 = CHUNK_LOGICAL + 0x2000;
pub const FS_LEAVES_LOGICAL: [u64; 2] = [CHUNK_LOGICAL + 0x3000, CHUNK_LOGICAL + 0x4000];

pub fn physical(logical: u64) -> u64 {
    logical - CHUNK_LOGICAL + CHUNK_PHYSICAL
}

/// Physical offsets of all tree nodes in the image.
pub fn node_offsets() -> Vec<u64> {
    let mut v = vec![
        physical(CHUNK_ROOT_LOGICAL),
        physical(ROOT_TREE_LOGICAL),
        physical(FS_ROOT_LOGICAL),
    ];
    v.extend(FS_LEAVES_LOGICAL.iter().map(|l| physical(*l)));
    v
}

fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn key(objectid: u64, ty: u8, offset: u64) -> Vec<u8> {
    let mut k = objectid.to_le_bytes().to_vec();
    k.push(ty);
    k.extend_from_slice(&offset.to_le_bytes());
    k
}

fn chunk_item(length: u64, stripe_offset: u64) -> Vec<u8> {
    let mut c = Vec::with_capacity(CHUNK_SIZE + STRIPE_SIZE);
    c.extend_from_slice(&length.to_le_bytes());
    c.extend_from_slice(&2_u64.to_le_bytes()); // owner: extent tree
    c.extend_from_slice(&0x10000_u64.to_le_bytes()); // stripe_len
    c.extend_from_slice(&2_u64.to_le_bytes()); // type: SYSTEM
    c.extend_from_slice(&4096_u32.to_le_bytes()); // io_align
    c.extend_from_slice(&4096_u32.to_le_bytes()); // io_width
    c.extend_from_slice(&4096_u32.to_le_bytes()); // sector_size
    c.extend_from_slice(&1_u16.to_le_bytes()); // num_stripes
    c.extend_from_slice(&0_u16.to_le_bytes()); // sub_stripes
    c.extend_from_slice(&1_u64.to_le_bytes()); // devid
    c.extend_from_slice(&stripe_offset.to_le_bytes());
    c.extend_from_slice(&[0xab; 16]); // dev uuid
    c
}

fn header(node: &mut [u8], bytenr: u64, owner: u64, nritems: u32, level: u8) {
    put(node, hdr::FSID, &[0x42; 16]);
    put(node, hdr::BYTENR, &bytenr.to_le_bytes());
    put(node, hdr::GENERATION, &7_u64.to_le_bytes());
    put(node, hdr::OWNER, &owner.to_le_bytes());
    put(node, hdr::NRITEMS, &nritems.to_le_bytes());
    node[hdr::LEVEL] = level;
}

/// Leaf whose items carry `payloads`, packed from the end of the node like btrfs does.
fn leaf(bytenr: u64, owner: u64, items: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut node = vec![0_u8; NODE_SIZE];
    header(&mut node, bytenr, owner, items.len() as u32, 0);
    let mut data_end = NODE_SIZE - HEADER_SIZE;
    for (i, (k, payload)) in items.iter().enumerate() {
        data_end -= payload.len();
        let off = HEADER_SIZE + i * ITEM_SIZE;
        put(&mut node, off, k);
        put(&mut node, off + KEY_SIZE, &(data_end as u32).to_le_bytes());
        put(&mut node, off + KEY_SIZE + 4, &(payload.len() as u32).to_le_bytes());
        put(&mut node, HEADER_SIZE + data_end, payload);
    }
    node
}

fn internal(bytenr: u64, owner: u64, children: &[u64]) -> Vec<u8> {
    let mut node = vec![0_u8; NODE_SIZE];
    header(&mut node, bytenr, owner, children.len() as u32, 1);
    for (i, child) in children.iter().enumerate() {
        let off = HEADER_SIZE + i * KEY_PTR_SIZE;
        put(&mut node, off, &key(256 + i as u64 * 10, 1, 0));
        put(&mut node, off + KEY_SIZE, &child.to_le_bytes());
        put(&mut node, off + KEY_SIZE + 8, &7_u64.to_le_bytes());
    }
    node
}

fn seal(node: &mut [u8]) {
    let csum = block_csum(node);
    put(node, 0, &csum.to_le_bytes());
}

pub fn image() -> Vec<u8> {
    let mut img = vec![0_u8; IMAGE_SIZE];

    let chunk_leaf = leaf(
        CHUNK_ROOT_LOGICAL,
        3,
        &[(
            key(256, CHUNK_ITEM_KEY, CHUNK_LOGICAL),
            chunk_item(CHUNK_LEN, CHUNK_PHYSICAL),
        )],
    );

    let mut root_item = vec![0_u8; 439];
    put(&mut root_item, ROOT_ITEM_BYTENR, &FS_ROOT_LOGICAL.to_le_bytes());
    let root_leaf = leaf(
        ROOT_TREE_LOGICAL,
        1,
        &[
            (key(1, 1, 0), vec![0x11; 160]), // inode item, skipped by the walk
            (key(5, ROOT_ITEM_KEY, 0), root_item),
        ],
    );

    let fs_root = internal(FS_ROOT_LOGICAL, 5, &FS_LEAVES_LOGICAL);
    let fs_leaves = FS_LEAVES_LOGICAL
        .iter()
        .map(|l| leaf(*l, 5, &[(key(256, 1, 0), vec![0x5a; 160]), (key(257, 12, 256), b"file".to_vec())]))
        .collect::<Vec<_>>();

    let mut nodes = vec![
        (CHUNK_ROOT_LOGICAL, chunk_leaf),
        (ROOT_TREE_LOGICAL, root_leaf),
        (FS_ROOT_LOGICAL, fs_root),
    ];
    nodes.extend(FS_LEAVES_LOGICAL.iter().copied().zip(fs_leaves));
    for (logical, mut node) in nodes {
        seal(&mut node);
        put(&mut img, physical(logical) as usize, &node);
    }

    let sys_array = {
        let mut a = key(256, CHUNK_ITEM_KEY, CHUNK_LOGICAL);
        a.extend(chunk_item(CHUNK_LEN, CHUNK_PHYSICAL));
        a
    };
    let sbo = SUPERBLOCK_OFFSET as usize;
    let mut super_block = vec![0_u8; SUPERBLOCK_SIZE];
    {
        let s = &mut super_block[..];
        put(s, sb::FSID, &[0x42; 16]);
        put(s, sb::BYTENR, &SUPERBLOCK_OFFSET.to_le_bytes());
        put(s, sb::MAGIC, &MAGIC);
        put(s, sb::GENERATION, &7_u64.to_le_bytes());
        put(s, sb::ROOT, &ROOT_TREE_LOGICAL.to_le_bytes());
        put(s, sb::CHUNK_ROOT, &CHUNK_ROOT_LOGICAL.to_le_bytes());
        put(s, sb::TOTAL_BYTES, &(IMAGE_SIZE as u64).to_le_bytes());
        put(s, sb::BYTES_USED, &0x5000_u64.to_le_bytes());
        put(s, sb::ROOT_DIR_OBJECTID, &6_u64.to_le_bytes());
        put(s, sb::NUM_DEVICES, &1_u64.to_le_bytes());
        for off in &[sb::SECTOR_SIZE, sb::NODE_SIZE, sb::LEAF_SIZE, sb::STRIPE_SIZE] {
            put(s, *off, &(NODE_SIZE as u32).to_le_bytes());
        }
        put(s, sb::SYS_CHUNK_ARRAY_SIZE, &(sys_array.len() as u32).to_le_bytes());
        put(s, sb::CHUNK_ROOT_GENERATION, &7_u64.to_le_bytes());
        put(s, sb::CSUM_TYPE, &CSUM_TYPE_CRC32.to_le_bytes());
        put(s, sb::SYS_CHUNK_ARRAY, &sys_array);
    }
    seal(&mut super_block);
    put(&mut img, sbo, &super_block);

    img
}

/// Whether every superblock copy and every tree node of the synthetic image
/// would pass the kernel's first validation gate.
pub fn gates_pass(img: &[u8]) -> bool {
    let sb_ok = superblock_copies(img.len()).all(|off| {
        let s = block(img, off, SUPERBLOCK_SIZE).unwrap_or_default();
        s[sb::MAGIC..sb::MAGIC + 8] == MAGIC && csum_matches(s)
    });
    let nodes_ok = node_offsets()
        .into_iter()
        .all(|off| block(img, off, NODE_SIZE).map(csum_matches).unwrap_or(false));
    sb_ok && nodes_ok
}
