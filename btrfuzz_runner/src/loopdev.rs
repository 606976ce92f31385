//! One persistent loop device, reused by every iteration.
use anyhow::Context;
use nix::{errno::Errno, ioctl_none_bad, ioctl_read_bad, ioctl_write_int_bad};
use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_CTL_GET_FREE: u64 = 0x4C82;
const LOOP_SET_FD: u64 = 0x4C00;
const LOOP_CLR_FD: u64 = 0x4C01;
const LOOP_GET_STATUS64: u64 = 0x4C05;
const LOOP_INFO64_SIZE: usize = 232;

ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);
ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
ioctl_read_bad!(loop_get_status64, LOOP_GET_STATUS64, [u8; LOOP_INFO64_SIZE]);

pub struct LoopDevice {
    path: PathBuf,
    dev: File,
    attached: bool,
}

impl LoopDevice {
    /// Grab a free loop device from the loop control device.
    pub fn alloc() -> anyhow::Result<Self> {
        let ctl = File::open(LOOP_CONTROL)
            .with_context(|| format!("failed to open {}", LOOP_CONTROL))?;
        let idx = unsafe { loop_ctl_get_free(ctl.as_raw_fd()) }
            .context("failed to get a free loop device")?;
        let path = PathBuf::from(format!("/dev/loop{}", idx));
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        log::info!("using {}", path.display());
        Ok(Self {
            path,
            dev,
            attached: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn attach(&mut self, backing: &File) -> Result<(), Errno> {
        unsafe { loop_set_fd(self.dev.as_raw_fd(), backing.as_raw_fd()) }?;
        self.attached = true;
        Ok(())
    }

    pub fn detach(&mut self) -> Result<(), Errno> {
        if !self.attached {
            return Ok(());
        }
        match unsafe { loop_clr_fd(self.dev.as_raw_fd()) } {
            Ok(_) | Err(Errno::ENXIO) => {
                self.attached = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a backing file is still bound. ENXIO means unbound.
    pub fn is_bound(&self) -> bool {
        let mut info = [0_u8; LOOP_INFO64_SIZE];
        match unsafe { loop_get_status64(self.dev.as_raw_fd(), &mut info) } {
            Ok(_) => true,
            Err(Errno::ENXIO) => false,
            Err(e) => {
                log::warn!("LOOP_GET_STATUS64 on {}: {}", self.path.display(), e);
                true
            }
        }
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            log::warn!("failed to detach {}: {}", self.path.display(), e);
        }
    }
}
