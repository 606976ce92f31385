//! Kernel log watcher for BUG and UBSAN reports that do not panic.
use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Read, Seek, SeekFrom},
    os::unix::fs::OpenOptionsExt,
};

pub const KMSG_PATH: &str = "/dev/kmsg";
const RECORD_MAX: usize = 8192;

pub fn is_bug_line(line: &str) -> bool {
    line.contains("BUG") || line.contains("UBSAN:")
}

/// Reads `/dev/kmsg` one record per read(2), never blocking.
pub struct Kmsg {
    f: File,
    buf: Box<[u8]>,
}

impl Kmsg {
    /// Open and skip everything logged so far.
    pub fn open() -> io::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(KMSG_PATH)?;
        f.seek(SeekFrom::End(0))?;
        Ok(Self::with_file(f))
    }

    fn with_file(f: File) -> Self {
        Self {
            f,
            buf: vec![0; RECORD_MAX].into_boxed_slice(),
        }
    }

    /// Consume every pending record, `true` if one of them reports a bug.
    pub fn drain(&mut self) -> io::Result<bool> {
        let mut found = false;
        loop {
            match self.f.read(&mut self.buf) {
                Ok(0) => break,
                Ok(n) => {
                    let record = String::from_utf8_lossy(&self.buf[..n]);
                    if is_bug_line(&record) {
                        log::debug!("kmsg: {}", record.trim_end());
                        found = true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // records were overwritten before we got to them
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }
}
