//! Guest side of the ivshmem devices the harness attaches.
use anyhow::{bail, Context};
use btrfuzz_channel::SharedRegion;
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    ptr,
};

pub const PCI_DEVICES: &str = "/sys/bus/pci/devices";
const IVSHM_VENDOR: &str = "0x1af4";
const IVSHM_DEVICE: &str = "0x1110";
/// BAR holding the shared memory.
const IVSHM_BAR: &str = "resource2";

/// Ivshmem devices under `root`, in PCI address order.
pub fn list_devices(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut devs = Vec::new();
    for entry in fs::read_dir(root)? {
        let dev = entry?.path();
        let vendor = fs::read_to_string(dev.join("vendor")).unwrap_or_default();
        let device = fs::read_to_string(dev.join("device")).unwrap_or_default();
        if vendor.trim() == IVSHM_VENDOR && device.trim() == IVSHM_DEVICE {
            devs.push(dev);
        }
    }
    devs.sort();
    Ok(devs)
}

pub struct IvshmRegion {
    ptr: *mut u8,
    len: usize,
    _bar: File,
}

// The mapping lives as long as the region and is only used by the runner's main thread.
unsafe impl Send for IvshmRegion {}

impl IvshmRegion {
    pub fn map(dev: &Path) -> anyhow::Result<Self> {
        let path = dev.join(IVSHM_BAR);
        let bar = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let len = bar.metadata()?.len() as usize;
        if len == 0 {
            bail!("empty ivshmem bar: {}", path.display());
        }
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                bar.as_raw_fd(),
                0,
            )
        };
        if p == libc::MAP_FAILED {
            bail!(
                "failed to mmap {}: {}",
                path.display(),
                io::Error::last_os_error()
            );
        }
        Ok(Self {
            ptr: p as *mut u8,
            len,
            _bar: bar,
        })
    }
}

impl SharedRegion for IvshmRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for IvshmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Map the image region and the coverage region, in the order the harness added them.
pub fn setup() -> anyhow::Result<(IvshmRegion, IvshmRegion)> {
    let devs = list_devices(Path::new(PCI_DEVICES)).context("failed to scan pci devices")?;
    if devs.len() < 2 {
        bail!("expected 2 ivshmem devices, found {}", devs.len());
    }
    let image = IvshmRegion::map(&devs[0])?;
    let cover = IvshmRegion::map(&devs[1])?;
    log::info!(
        "ivshmem: image {} bytes, cover {} bytes",
        image.len(),
        cover.len()
    );
    Ok((image, cover))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn fake_dev(root: &Path, addr: &str, vendor: &str, device: &str) {
        let d = root.join(addr);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(d.join("device"), format!("{}\n", device)).unwrap();
    }

    #[test]
    fn finds_ivshmem_in_order() {
        let mut rng = SmallRng::from_entropy();
        let root = std::env::temp_dir().join(format!("btrfuzz-pci-{:016x}", rng.gen::<u64>()));
        fake_dev(&root, "0000:00:05.0", "0x1af4", "0x1110");
        fake_dev(&root, "0000:00:03.0", "0x8086", "0x100e");
        fake_dev(&root, "0000:00:04.0", "0x1af4", "0x1110");
        fake_dev(&root, "0000:00:02.0", "0x1af4", "0x1005");
        fs::create_dir_all(root.join("0000:00:01.0")).unwrap();

        let devs = list_devices(&root).unwrap();
        let names = devs
            .iter()
            .map(|d| d.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["0000:00:04.0", "0000:00:05.0"]);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn maps_a_file_backed_bar() {
        let mut rng = SmallRng::from_entropy();
        let dev = std::env::temp_dir().join(format!("btrfuzz-bar-{:016x}", rng.gen::<u64>()));
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join(IVSHM_BAR), vec![0_u8; 8192]).unwrap();
        let mut r = IvshmRegion::map(&dev).unwrap();
        assert_eq!(r.len(), 8192);
        r.as_slice_mut()[100] = 0x5a;
        drop(r);
        assert_eq!(fs::read(dev.join(IVSHM_BAR)).unwrap()[100], 0x5a);
        fs::remove_dir_all(&dev).unwrap();
    }
}
