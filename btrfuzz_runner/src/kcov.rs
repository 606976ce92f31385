//! Per-task KCOV tracing.
use anyhow::{bail, Context};
use nix::{ioctl_read, ioctl_write_int_bad, request_code_none};
use std::{
    fs::{File, OpenOptions},
    mem::size_of,
    os::unix::io::AsRawFd,
    ptr,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

pub const KCOV_PATH: &str = "/sys/kernel/debug/kcov";
/// Trace buffer entries, the first one holds the count.
pub const COVER_SIZE: usize = 256 << 10;

const KCOV_IOCTL_MAGIC: u8 = b'c';
const KCOV_INIT_TRACE_SEQ: u8 = 1;
const KCOV_ENABLE_SEQ: u8 = 100;
const KCOV_DISABLE_SEQ: u8 = 101;
const KCOV_TRACE_PC: i32 = 0;

ioctl_read!(kcov_init_trace, KCOV_IOCTL_MAGIC, KCOV_INIT_TRACE_SEQ, u64);
// enable/disable take an int argument although they are declared without one
ioctl_write_int_bad!(
    kcov_enable,
    request_code_none!(KCOV_IOCTL_MAGIC, KCOV_ENABLE_SEQ)
);
ioctl_write_int_bad!(
    kcov_disable,
    request_code_none!(KCOV_IOCTL_MAGIC, KCOV_DISABLE_SEQ)
);

/// How the PC counter is sampled around one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KcovMode {
    /// Reset the counter before enabling.
    ReadClear,
    /// Keep the counter, diff against the value seen at enable.
    ReadOnly,
}

impl FromStr for KcovMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-clear" => Ok(KcovMode::ReadClear),
            "read-only" => Ok(KcovMode::ReadOnly),
            _ => Err(format!("unknown kcov mode '{}'", s)),
        }
    }
}

pub struct Kcov {
    file: File,
    area: *mut u64,
    mode: KcovMode,
    base: usize,
    enabled: bool,
}

impl Kcov {
    pub fn open(mode: KcovMode) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(KCOV_PATH)
            .with_context(|| format!("failed to open {}", KCOV_PATH))?;
        let fd = file.as_raw_fd();

        // SAFETY: plain ioctl on an fd we own.
        unsafe { kcov_init_trace(fd, COVER_SIZE as *mut u64) }
            .context("failed to KCOV_INIT_TRACE")?;

        // SAFETY: the kernel sized the buffer in the ioctl above.
        let area = unsafe {
            libc::mmap(
                ptr::null_mut(),
                COVER_SIZE * size_of::<u64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if area == libc::MAP_FAILED {
            bail!(
                "failed to mmap kcov buffer: {}",
                std::io::Error::last_os_error()
            );
        }

        Ok(Self {
            file,
            area: area as *mut u64,
            mode,
            base: 0,
            enabled: false,
        })
    }

    fn counter(&self) -> &AtomicU64 {
        // SAFETY: the area holds COVER_SIZE u64s and the kernel updates entry 0 concurrently.
        unsafe { &*(self.area as *const AtomicU64) }
    }

    pub fn enable(&mut self) -> anyhow::Result<()> {
        if self.mode == KcovMode::ReadClear {
            self.counter().store(0, Ordering::Relaxed);
        }
        unsafe { kcov_enable(self.file.as_raw_fd(), KCOV_TRACE_PC) }
            .context("failed to enable kcov")?;
        self.enabled = true;
        match self.mode {
            // drop whatever the ioctl return path traced
            KcovMode::ReadClear => self.counter().store(0, Ordering::Relaxed),
            KcovMode::ReadOnly => {
                self.base = self.counter().load(Ordering::Relaxed) as usize;
            }
        }
        Ok(())
    }

    /// Stop tracing and return the PCs of this iteration.
    pub fn disable(&mut self) -> anyhow::Result<&[u64]> {
        let end = self.counter().load(Ordering::Relaxed) as usize;
        if self.enabled {
            unsafe { kcov_disable(self.file.as_raw_fd(), 0) }.context("failed to disable kcov")?;
            self.enabled = false;
        }
        let end = end.min(COVER_SIZE - 1);
        let start = match self.mode {
            KcovMode::ReadClear => 0,
            KcovMode::ReadOnly => self.base.min(end),
        };
        // SAFETY: entries 1..=end lie in the mapping and tracing is off.
        let pcs = unsafe { std::slice::from_raw_parts(self.area.add(1), COVER_SIZE - 1) };
        Ok(&pcs[start..end])
    }
}

impl Drop for Kcov {
    fn drop(&mut self) {
        if self.enabled {
            let _ = unsafe { kcov_disable(self.file.as_raw_fd(), 0) };
        }
        unsafe {
            libc::munmap(self.area as *mut libc::c_void, COVER_SIZE * size_of::<u64>());
        }
    }
}
