//! AFL++ custom mutator library.
//!
//! Load with `AFL_CUSTOM_MUTATOR_LIBRARY=libbtrfuzz_mutator.so`, together with
//! `AFL_CUSTOM_MUTATOR_ONLY=1` and `AFL_DISABLE_TRIM=1`: trimming is not provided.
use btrfuzz_core::{
    image::is_container,
    mutation::{mutate, MutatorConfig},
};
use libc::{c_uint, c_void, size_t};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{panic, ptr, slice};

pub struct MutatorState {
    rng: SmallRng,
    config: MutatorConfig,
    out: Vec<u8>,
}

impl MutatorState {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            config: MutatorConfig::default(),
            out: Vec::new(),
        }
    }

    /// Mutate `input` into the output buffer, at most `max_size` bytes of it.
    ///
    /// Raw images are cut at `max_size`. A container that does not fit is never cut, the
    /// input is handed back instead, or nothing if the input does not fit either.
    pub fn fuzz(&mut self, input: &[u8], other: Option<&[u8]>, max_size: usize) -> &[u8] {
        let seed = self.rng.gen::<u64>();
        self.out = mutate(input, other, seed, &self.config);
        if self.out.len() > max_size {
            if is_container(&self.out) {
                self.out.clear();
                if input.len() <= max_size {
                    self.out.extend_from_slice(input);
                }
            } else {
                self.out.truncate(max_size);
            }
        }
        &self.out
    }
}

/// Create a mutator instance seeded by AFL++.
#[no_mangle]
pub extern "C" fn afl_custom_init(_afl: *mut c_void, seed: c_uint) -> *mut c_void {
    Box::into_raw(Box::new(MutatorState::new(seed as u64))) as *mut c_void
}

/// Mutate `buf`, optionally crossing over with `add_buf`. The result stays owned by the
/// instance until the next call. Returns 0 on error.
///
/// # Safety
///
/// `data` comes from `afl_custom_init`, the buffers are valid for their sizes.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_fuzz(
    data: *mut c_void,
    buf: *mut u8,
    buf_size: size_t,
    out_buf: *mut *mut u8,
    add_buf: *mut u8,
    add_buf_size: size_t,
    max_size: size_t,
) -> size_t {
    if data.is_null() || out_buf.is_null() || (buf.is_null() && buf_size != 0) {
        return 0;
    }
    let state = &mut *(data as *mut MutatorState);
    let input = if buf_size == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(buf as *const u8, buf_size)
    };
    let other = if add_buf.is_null() || add_buf_size == 0 {
        None
    } else {
        Some(slice::from_raw_parts(add_buf as *const u8, add_buf_size))
    };

    // never unwind into afl-fuzz
    let r = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        state.fuzz(input, other, max_size).len()
    }));
    match r {
        Ok(n) => {
            *out_buf = state.out.as_mut_ptr();
            n
        }
        Err(_) => {
            *out_buf = ptr::null_mut();
            0
        }
    }
}

/// # Safety
///
/// `data` comes from `afl_custom_init` and is not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_deinit(data: *mut c_void) {
    if !data.is_null() {
        drop(Box::from_raw(data as *mut MutatorState));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btrfuzz_core::{
        image::{self, CompressedImage},
        synth,
    };

    #[test]
    fn same_seed_same_sequence() {
        let img = CompressedImage::compress(&synth::image()).unwrap().to_bytes();
        let mut a = MutatorState::new(7);
        let mut b = MutatorState::new(7);
        let first = a.fuzz(&img, None, usize::MAX).to_vec();
        assert_eq!(first, b.fuzz(&img, None, usize::MAX));
        assert_eq!(first.len(), img.len());
        // the seed advances between calls
        let second = a.fuzz(&img, None, usize::MAX).to_vec();
        assert_eq!(second, b.fuzz(&img, None, usize::MAX));
    }

    #[test]
    fn truncated_to_max_size() {
        let raw = synth::image();
        let mut m = MutatorState::new(1);
        assert_eq!(m.fuzz(&raw, Some(&raw), 4096).len(), 4096);
    }

    #[test]
    fn containers_are_not_cut() {
        let img = CompressedImage::compress(&synth::image()).unwrap().to_bytes();
        let mut m = MutatorState::new(5);
        let out = m.fuzz(&img, None, img.len()).to_vec();
        assert_eq!(out.len(), img.len());
        assert!(image::decode(&out).is_ok());

        // neither the mutant nor the input fits
        assert!(m.fuzz(&img, None, img.len() - 1).is_empty());

        for _ in 0..16 {
            let out = m.fuzz(&img, Some(&img), img.len());
            assert!(image::decode(out).is_ok());
        }
    }

    #[test]
    fn c_abi() {
        let mut raw = synth::image();
        let mut other = synth::image();
        unsafe {
            let data = afl_custom_init(ptr::null_mut(), 3);
            let mut out: *mut u8 = ptr::null_mut();
            let n = afl_custom_fuzz(
                data,
                raw.as_mut_ptr(),
                raw.len(),
                &mut out,
                other.as_mut_ptr(),
                other.len(),
                raw.len(),
            );
            assert_eq!(n, raw.len());
            assert!(!out.is_null());
            let mutated = slice::from_raw_parts(out, n).to_vec();
            assert_eq!(mutated, MutatorState::new(3).fuzz(&raw, Some(&other), raw.len()));
            // input untouched
            assert_eq!(raw, synth::image());

            assert_eq!(
                afl_custom_fuzz(ptr::null_mut(), raw.as_mut_ptr(), raw.len(), &mut out, ptr::null_mut(), 0, 16),
                0
            );
            afl_custom_deinit(data);
        }
    }
}
