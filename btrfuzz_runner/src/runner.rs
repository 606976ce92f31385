//! One iteration: decode, fixup, attach, mount, exercise, unmount, check.
use crate::{
    exercise::exercise,
    kcov::Kcov,
    kmsg::Kmsg,
    loopdev::LoopDevice,
    mount::{forget_devices, is_mounted, mount_dev, unmount, Unmount},
};
use btrfuzz_channel::{cov::EdgeHasher, RunStatus};
use btrfuzz_core::{fixup::fixup, image};
use nix::errno::Errno;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub image_path: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

pub struct Runner {
    conf: RunnerConfig,
    kcov: Option<Kcov>,
    loopdev: LoopDevice,
    kmsg: Kmsg,
    hasher: EdgeHasher,
    iterations: u64,
}

impl Runner {
    pub fn new(conf: RunnerConfig, kcov: Option<Kcov>, loopdev: LoopDevice, kmsg: Kmsg) -> Self {
        Self {
            conf,
            kcov,
            loopdev,
            kmsg,
            hasher: EdgeHasher::new(),
            iterations: 0,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Run one candidate and fold its coverage into `record`.
    pub fn execute(&mut self, candidate: &[u8], record: &mut [u8]) -> RunStatus {
        self.iterations += 1;
        let mut img = match image::decode(candidate) {
            Ok(img) => img,
            Err(e) => {
                log::debug!("decode: {}", e);
                return RunStatus::DecodeError;
            }
        };
        let patched = fixup(&mut img);
        log::debug!(
            "iteration {}: {} bytes, {} patches",
            self.iterations,
            img.len(),
            patched
        );

        let mut seen = Observed::default();
        match self.stage(&img) {
            Ok(backing) => self.run_attached(&backing, record, &mut seen),
            Err(e) => {
                log::warn!("failed to stage image: {:#}", e);
                seen.staged = false;
            }
        }
        match self.kmsg.drain() {
            Ok(bug) => seen.kernel_bug = bug,
            Err(e) => log::warn!("failed to read kmsg: {}", e),
        }
        seen.status()
    }

    /// Write the image out and drop stale btrfs devices.
    fn stage(&self, img: &[u8]) -> anyhow::Result<File> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.conf.image_path)?;
        f.write_all(img)?;
        f.flush()?;
        forget_devices()?;
        Ok(f)
    }

    fn run_attached(&mut self, backing: &File, record: &mut [u8], seen: &mut Observed) {
        if let Err(e) = self.loopdev.attach(backing) {
            log::warn!("LOOP_SET_FD: {}", e);
            seen.attach = Err(e);
            return;
        }
        self.mount_and_exercise(record, seen);
        if let Err(e) = self.loopdev.detach() {
            log::debug!("LOOP_CLR_FD: {}", e);
            seen.detached = false;
        }
        seen.residue = self.has_residue();
    }

    fn mount_and_exercise(&mut self, record: &mut [u8], seen: &mut Observed) {
        if let Some(kcov) = self.kcov.as_mut() {
            if let Err(e) = kcov.enable() {
                log::warn!("{:#}", e);
                seen.kcov = false;
                return;
            }
        }

        let mnt = &self.conf.mount_point;
        seen.mount = match mount_dev(self.loopdev.path(), mnt, &self.conf.fs_type) {
            Ok(()) => {
                let report = exercise(mnt);
                if !report.is_clean() {
                    log::debug!(
                        "{}/{} operations failed, first: {:?}",
                        report.failed,
                        report.executed,
                        report.first_error
                    );
                }
                let unmounted = unmount(mnt);
                if unmounted != Unmount::Clean {
                    log::debug!("umount: {:?}", unmounted);
                }
                MountStep::Exercised {
                    clean: report.is_clean(),
                    unmount: unmounted,
                }
            }
            Err(e) => {
                log::debug!("mount: {}", e);
                MountStep::Failed
            }
        };

        if let Some(kcov) = self.kcov.as_mut() {
            match kcov.disable() {
                Ok(pcs) => self.hasher.fold(pcs, record),
                Err(e) => {
                    log::warn!("{:#}", e);
                    seen.kcov = false;
                }
            }
        }
    }

    fn has_residue(&self) -> bool {
        let mounted = match is_mounted(&self.conf.mount_point) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("failed to read mount table: {}", e);
                false
            }
        };
        let bound = self.loopdev.is_bound();
        if mounted || bound {
            log::debug!("residual state: mounted {}, loop bound {}", mounted, bound);
        }
        mounted || bound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStep {
    /// An earlier step failed.
    Skipped,
    Failed,
    Exercised { clean: bool, unmount: Unmount },
}

/// What the steps of one iteration ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub staged: bool,
    pub attach: Result<(), Errno>,
    /// KCOV enable and disable both worked.
    pub kcov: bool,
    pub mount: MountStep,
    pub detached: bool,
    pub residue: bool,
    pub kernel_bug: bool,
}

impl Default for Observed {
    fn default() -> Self {
        Self {
            staged: true,
            attach: Ok(()),
            kcov: true,
            mount: MountStep::Skipped,
            detached: true,
            residue: false,
            kernel_bug: false,
        }
    }
}

impl Observed {
    /// Status of the whole iteration: `KernelBug > Internal > ResidualState >
    /// FilesystemError > Normal`.
    pub fn status(&self) -> RunStatus {
        let mut status = RunStatus::Normal;
        match self.mount {
            MountStep::Skipped => (),
            MountStep::Failed => status = RunStatus::FilesystemError,
            MountStep::Exercised { clean, unmount } => {
                if !clean {
                    status = RunStatus::FilesystemError;
                }
                if unmount != Unmount::Clean {
                    status = status.escalate(RunStatus::ResidualState);
                }
            }
        }
        match self.attach {
            Ok(()) => (),
            Err(Errno::EBUSY) => status = status.escalate(RunStatus::ResidualState),
            Err(_) => status = status.escalate(RunStatus::Internal),
        }
        if !self.detached || self.residue {
            status = status.escalate(RunStatus::ResidualState);
        }
        if !self.staged || !self.kcov {
            status = status.escalate(RunStatus::Internal);
        }
        if self.kernel_bug {
            status = status.escalate(RunStatus::KernelBug);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercised(clean: bool, unmount: Unmount) -> Observed {
        Observed {
            mount: MountStep::Exercised { clean, unmount },
            ..Observed::default()
        }
    }

    #[test]
    fn clean_iteration() {
        assert_eq!(exercised(true, Unmount::Clean).status(), RunStatus::Normal);
        assert_eq!(exercised(false, Unmount::Clean).status(), RunStatus::FilesystemError);
        let failed = Observed {
            mount: MountStep::Failed,
            ..Observed::default()
        };
        assert_eq!(failed.status(), RunStatus::FilesystemError);
    }

    #[test]
    fn leftovers_are_residual() {
        assert_eq!(exercised(true, Unmount::Detached).status(), RunStatus::ResidualState);
        assert_eq!(
            exercised(false, Unmount::Failed(Errno::EIO)).status(),
            RunStatus::ResidualState
        );
        let busy = Observed {
            attach: Err(Errno::EBUSY),
            ..Observed::default()
        };
        assert_eq!(busy.status(), RunStatus::ResidualState);
        let stuck = Observed {
            detached: false,
            ..exercised(true, Unmount::Clean)
        };
        assert_eq!(stuck.status(), RunStatus::ResidualState);
        let mounted = Observed {
            residue: true,
            ..exercised(false, Unmount::Clean)
        };
        assert_eq!(mounted.status(), RunStatus::ResidualState);
    }

    #[test]
    fn setup_failures_are_internal() {
        let attach = Observed {
            attach: Err(Errno::ENOMEM),
            ..Observed::default()
        };
        assert_eq!(attach.status(), RunStatus::Internal);
        let staged = Observed {
            staged: false,
            ..Observed::default()
        };
        assert_eq!(staged.status(), RunStatus::Internal);
        let kcov = Observed {
            kcov: false,
            residue: true,
            ..exercised(false, Unmount::Clean)
        };
        assert_eq!(kcov.status(), RunStatus::Internal);
    }

    #[test]
    fn kernel_bug_wins() {
        let everything = Observed {
            staged: true,
            attach: Ok(()),
            kcov: false,
            mount: MountStep::Exercised {
                clean: false,
                unmount: Unmount::Detached,
            },
            detached: false,
            residue: true,
            kernel_bug: true,
        };
        assert_eq!(everything.status(), RunStatus::KernelBug);
        let busy = Observed {
            attach: Err(Errno::EBUSY),
            kernel_bug: true,
            ..Observed::default()
        };
        assert_eq!(busy.status(), RunStatus::KernelBug);
        let unstaged = Observed {
            staged: false,
            kernel_bug: true,
            ..Observed::default()
        };
        assert_eq!(unstaged.status(), RunStatus::KernelBug);
    }
}
