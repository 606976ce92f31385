//! AFL++ forkserver adapter.
//!
//! The harness pretends to be a forkserver: AFL++ writes a control word on fd 198 for
//! every run and expects a pid and then a wait status on fd 199. Nothing is forked,
//! each run is one iteration of the long-lived session and the reported pid is fake.
use crate::{ChannelError, MAP_SIZE};
use std::{
    env,
    fs::File,
    io::{ErrorKind, Read, Write},
    os::unix::io::FromRawFd,
    ptr,
};

pub const FORKSRV_FD: i32 = 198;
pub const FS_OPT_ENABLED: u32 = 0x8000_0001;
pub const FS_OPT_MAPSIZE: u32 = 0x4000_0000;
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
pub const NO_FORKSRV_ENV_VAR: &str = "AFL_NO_FORKSRV";
/// Pid reported for every run.
pub const FAKE_PID: i32 = i32::MAX;

/// Wait status of a clean exit.
pub const STATUS_OK: i32 = 0;
/// Wait status of a SIGSEGV'd child.
pub const STATUS_CRASH: i32 = 139;
/// Wait status of a SIGABRT'd child.
pub const STATUS_ABORT: i32 = 134;
/// Wait status of a SIGKILL'd child.
pub const STATUS_KILLED: i32 = 137;

pub const fn hello_word() -> u32 {
    FS_OPT_ENABLED | FS_OPT_MAPSIZE | (((MAP_SIZE as u32) - 1) << 1)
}

enum Map {
    Shm(*mut u8),
    Local(Box<[u8]>),
}

struct Pipes {
    ctl: File,
    st: File,
}

pub struct AflForkserver {
    pipes: Option<Pipes>,
    map: Map,
    runs: u64,
}

impl AflForkserver {
    /// Attach to AFL++ if we are running under it, otherwise prepare a standalone run.
    pub fn attach() -> Result<Self, ChannelError> {
        let map = match env::var(SHM_ENV_VAR) {
            Ok(id) => {
                let id = id.trim().parse::<i32>().map_err(|_| {
                    ChannelError::Protocol(format!("bad {}: {}", SHM_ENV_VAR, id))
                })?;
                // SAFETY: attaching a SysV segment, the result is checked below.
                let p = unsafe { libc::shmat(id, ptr::null(), 0) };
                if p as isize == -1 {
                    return Err(ChannelError::Io(std::io::Error::last_os_error()));
                }
                Map::Shm(p as *mut u8)
            }
            Err(_) => Map::Local(vec![0; MAP_SIZE].into_boxed_slice()),
        };

        let pipes = if env::var_os(NO_FORKSRV_ENV_VAR).is_some() || !fd_valid(FORKSRV_FD + 1) {
            None
        } else {
            // SAFETY: both descriptors are inherited from AFL++ and owned by us from now on.
            unsafe {
                Some(Pipes {
                    ctl: File::from_raw_fd(FORKSRV_FD),
                    st: File::from_raw_fd(FORKSRV_FD + 1),
                })
            }
        };

        let mut fsrv = Self {
            pipes: None,
            map,
            runs: 0,
        };
        if let Some(p) = pipes {
            fsrv.handshake(p)?;
        }
        Ok(fsrv)
    }

    fn handshake(&mut self, mut pipes: Pipes) -> Result<(), ChannelError> {
        match pipes.st.write_all(&hello_word().to_ne_bytes()) {
            Ok(()) => {
                self.pipes = Some(pipes);
                Ok(())
            }
            // fd 199 is open but nobody listens, run standalone
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                log::warn!("forkserver pipe closed, running standalone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.pipes.is_none()
    }

    /// Wait for AFL++ to request the next run. `false` means stop.
    pub fn next_run(&mut self) -> Result<bool, ChannelError> {
        let pipes = match self.pipes.as_mut() {
            Some(p) => p,
            None => {
                self.runs += 1;
                return Ok(self.runs == 1);
            }
        };

        let mut word = [0_u8; 4];
        match pipes.ctl.read_exact(&mut word) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        pipes.st.write_all(&FAKE_PID.to_ne_bytes())?;
        self.runs += 1;
        Ok(true)
    }

    /// Coverage map of the current run.
    pub fn map_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            // SAFETY: AFL++ sizes the segment to at least the announced map size.
            Map::Shm(p) => unsafe { std::slice::from_raw_parts_mut(*p, MAP_SIZE) },
            Map::Local(buf) => buf,
        }
    }

    /// Copy `record` into the map.
    pub fn publish(&mut self, record: &[u8]) {
        let map = self.map_mut();
        let n = std::cmp::min(map.len(), record.len());
        map[..n].copy_from_slice(&record[..n]);
    }

    /// Report the wait status of the current run.
    pub fn report(&mut self, status: i32) -> Result<(), ChannelError> {
        if let Some(p) = self.pipes.as_mut() {
            p.st.write_all(&status.to_ne_bytes())?;
        }
        Ok(())
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    #[cfg(test)]
    fn with_pipes(ctl: File, st: File) -> Result<Self, ChannelError> {
        let mut fsrv = Self {
            pipes: None,
            map: Map::Local(vec![0; MAP_SIZE].into_boxed_slice()),
            runs: 0,
        };
        fsrv.handshake(Pipes { ctl, st })?;
        Ok(fsrv)
    }
}

impl Drop for AflForkserver {
    fn drop(&mut self) {
        if let Map::Shm(p) = self.map {
            unsafe {
                libc::shmdt(p as *const libc::c_void);
            }
        }
    }
}

fn fd_valid(fd: i32) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}
