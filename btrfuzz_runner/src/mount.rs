//! Mount, unmount and the kernel state left behind by both.
use nix::{
    errno::Errno,
    ioctl_write_ptr,
    mount::{mount, umount2, MntFlags, MsFlags},
};
use std::{
    fs::{self, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::Path,
};

const BTRFS_CONTROL: &str = "/dev/btrfs-control";
const BTRFS_IOCTL_MAGIC: u8 = 0x94;
const BTRFS_FORGET_DEV_SEQ: u8 = 5;
const BTRFS_PATH_NAME_MAX: usize = 4087;

#[repr(C, packed)]
pub struct BtrfsVolArgs {
    fd: i64,
    name: [u8; BTRFS_PATH_NAME_MAX + 1],
}

ioctl_write_ptr!(
    btrfs_forget_dev,
    BTRFS_IOCTL_MAGIC,
    BTRFS_FORGET_DEV_SEQ,
    BtrfsVolArgs
);

/// Drop every unmounted device from the btrfs device cache.
pub fn forget_devices() -> anyhow::Result<()> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(BTRFS_CONTROL)?;
    let args = BtrfsVolArgs {
        fd: 0,
        name: [0; BTRFS_PATH_NAME_MAX + 1],
    };
    unsafe { btrfs_forget_dev(f.as_raw_fd(), &args) }?;
    Ok(())
}

pub fn mount_dev(dev: &Path, mnt: &Path, fs_type: &str) -> Result<(), Errno> {
    mount(Some(dev), mnt, Some(fs_type), MsFlags::empty(), None::<&str>)
}

/// Create the mount point once at startup.
pub fn prepare_mount_point(mnt: &Path) -> io::Result<()> {
    fs::create_dir_all(mnt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmount {
    Clean,
    /// The filesystem was busy and only went away with a lazy detach.
    Detached,
    Failed(Errno),
}

pub fn unmount(mnt: &Path) -> Unmount {
    settle_unmount(umount2(mnt, MntFlags::empty()), || {
        umount2(mnt, MntFlags::MNT_DETACH)
    })
}

fn settle_unmount<F>(first: Result<(), Errno>, detach: F) -> Unmount
where
    F: FnOnce() -> Result<(), Errno>,
{
    match first {
        Ok(()) | Err(Errno::EINVAL) => Unmount::Clean,
        // detach anyway so the next iteration gets a free mount point
        Err(Errno::EBUSY) => match detach() {
            Ok(()) => Unmount::Detached,
            Err(e) => Unmount::Failed(e),
        },
        Err(e) => Unmount::Failed(e),
    }
}

/// `mnt` appears as a mount point in `/proc/self/mounts`.
pub fn is_mounted(mnt: &Path) -> io::Result<bool> {
    let mounts = fs::read_to_string("/proc/self/mounts")?;
    Ok(mounts_contain(&mounts, mnt))
}

fn mounts_contain(mounts: &str, mnt: &Path) -> bool {
    let mnt = mnt.to_string_lossy();
    let mnt = mnt.trim_end_matches('/');
    mounts
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .any(|m| m == mnt)
}
