//! Length preserving byte and scalar operations.
use crate::RngType;
use rand::prelude::*;
use std::cmp::min;

/// Largest delta of arithmetic perturbations.
pub const ARITH_MAX: u64 = 35;

// An operation mutates the window in place and returns `true` if it could do anything.
pub type MutateOperation = fn(&mut RngType, &mut [u8]) -> bool;

pub const OPERATIONS: [MutateOperation; 11] = [
    flip_bit,
    random_byte,
    perturb8,
    perturb16,
    perturb32,
    perturb64,
    interesting8,
    interesting16,
    interesting32,
    interesting64,
    overwrite_within,
];

#[inline]
fn load(buf: &[u8], pos: usize, n: usize) -> u64 {
    let mut b = [0; 8];
    b[..n].copy_from_slice(&buf[pos..pos + n]);
    u64::from_le_bytes(b)
}

#[inline]
fn store(buf: &mut [u8], pos: usize, n: usize, val: u64) {
    buf[pos..pos + n].copy_from_slice(&val.to_le_bytes()[..n]);
}

#[inline]
fn mask(n: usize) -> u64 {
    if n >= 8 {
        u64::MAX
    } else {
        (1 << (n * 8)) - 1
    }
}

pub fn flip_bit(rng: &mut RngType, buf: &mut [u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let i = rng.gen_range(0..buf.len());
    buf[i] ^= 1 << rng.gen_range(0..8);
    true
}

pub fn random_byte(rng: &mut RngType, buf: &mut [u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let i = rng.gen_range(0..buf.len());
    buf[i] ^= rng.gen_range(1..=0xff);
    true
}

fn perturb(rng: &mut RngType, buf: &mut [u8], n: usize) -> bool {
    if buf.len() < n {
        return false;
    }
    let pos = rng.gen_range(0..=buf.len() - n);
    let old = load(buf, pos, n);
    let delta = rng.gen_range(1..=ARITH_MAX);
    let new = if rng.gen() {
        old.wrapping_add(delta)
    } else {
        old.wrapping_sub(delta)
    };
    store(buf, pos, n, new & mask(n));
    true
}

pub fn perturb8(rng: &mut RngType, buf: &mut [u8]) -> bool {
    perturb(rng, buf, 1)
}

pub fn perturb16(rng: &mut RngType, buf: &mut [u8]) -> bool {
    perturb(rng, buf, 2)
}

pub fn perturb32(rng: &mut RngType, buf: &mut [u8]) -> bool {
    perturb(rng, buf, 4)
}

pub fn perturb64(rng: &mut RngType, buf: &mut [u8]) -> bool {
    perturb(rng, buf, 8)
}

/// 0, 1, -1, signed max, signed min or a power of two, for an `n` byte integer.
pub fn interesting_value(rng: &mut RngType, n: usize) -> u64 {
    let m = mask(n);
    let bits = min(n * 8, 64) as u32;
    match rng.gen_range(0..6) {
        0 => 0,
        1 => 1,
        2 => m,
        3 => m >> 1,
        4 => 1 << (bits - 1),
        _ => 1 << rng.gen_range(0..bits),
    }
}

fn interesting(rng: &mut RngType, buf: &mut [u8], n: usize) -> bool {
    if buf.len() < n {
        return false;
    }
    let pos = rng.gen_range(0..=buf.len() - n);
    let val = interesting_value(rng, n);
    store(buf, pos, n, val);
    true
}

pub fn interesting8(rng: &mut RngType, buf: &mut [u8]) -> bool {
    interesting(rng, buf, 1)
}

pub fn interesting16(rng: &mut RngType, buf: &mut [u8]) -> bool {
    interesting(rng, buf, 2)
}

pub fn interesting32(rng: &mut RngType, buf: &mut [u8]) -> bool {
    interesting(rng, buf, 4)
}

pub fn interesting64(rng: &mut RngType, buf: &mut [u8]) -> bool {
    interesting(rng, buf, 8)
}

/// Overwrites a block with another block of the same window.
pub fn overwrite_within(rng: &mut RngType, buf: &mut [u8]) -> bool {
    let len = buf.len();
    if len < 2 {
        return false;
    }
    let op_len = rng.gen_range(1..=min(len / 2, 32).max(1));
    let src = rng.gen_range(0..=(len - op_len));
    let dst = rng.gen_range(0..=(len - op_len));
    if src == dst {
        return false;
    }
    buf.copy_within(src..src + op_len, dst);
    true
}
