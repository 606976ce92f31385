//! Machines hosting the runner.
//!
//! A `Machine` boots a guest, starts one runner inside it and hands back the byte
//! streams and shared regions the controller talks over. `QemuMachine` is the real
//! thing: QEMU with two ivshmem devices, the runner started over ssh.
use crate::config::Config;
use crate::util::create_shm;
use btrfuzz_channel::{shm::ShmRegion, SharedRegion, COVER_SHM_SZ, IN_SHM_SZ};
use btrfuzz_io::{thread::read_background, BackgroundIoHandle};
use btrfuzz_vm::{
    qemu::{BootError, QemuHandle},
    ssh,
};
use shared_memory::{Shmem, ShmemConf};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Stdio},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("boot: {0}")]
    Boot(#[from] BootError),
    #[error("spawn runner: {0}")]
    Spawn(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("machine not booted")]
    NotBooted,
}

/// Everything the controller needs to talk to a started runner.
pub struct RunnerLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub image_region: Option<Box<dyn SharedRegion>>,
    pub cover_region: Option<Box<dyn SharedRegion>>,
}

pub trait Machine: Send {
    /// Boot a fresh guest, replacing any previous one.
    fn boot(&mut self) -> Result<Duration, MachineError>;
    /// Start the runner in the booted guest.
    fn spawn_runner(&mut self) -> Result<RunnerLink, MachineError>;
    /// Console output produced since the last call.
    fn console(&mut self) -> Vec<u8>;
    /// The guest still answers.
    fn is_alive(&mut self) -> bool;
    /// Wait at most `grace` for the rest of the console, then kill the guest.
    fn collect_console(&mut self, grace: Duration) -> Vec<u8>;
    fn kill(&mut self);
}

/// Options the runner is started with.
#[derive(Debug, Clone)]
pub struct RunnerOpts {
    pub runner_bin: PathBuf,
    pub use_ivshm: bool,
    pub no_kcov: bool,
    pub kcov_mode: String,
}

impl RunnerOpts {
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.use_ivshm {
            args.push("--use-ivshm".to_string());
        }
        if self.no_kcov {
            args.push("--no-kcov".to_string());
        } else {
            args.push("--kcov-mode".to_string());
            args.push(self.kcov_mode.clone());
        }
        args
    }
}

pub struct QemuMachine {
    qemu: QemuHandle,
    opts: RunnerOpts,
    /// Owning host mappings of the image and cover regions.
    shms: Option<(Shmem, Shmem)>,
    remote_runner: Option<PathBuf>,
    runner: Option<Child>,
    runner_stderr: Option<BackgroundIoHandle>,
}

// The owning mappings are only touched when the machine is dropped.
unsafe impl Send for QemuMachine {}

impl QemuMachine {
    pub fn new(id: u64, config: &Config) -> anyhow::Result<Self> {
        let mut qemu_config = config.qemu_config.clone();
        let shms = if config.runner.use_ivshm {
            let pid = std::process::id();
            let img_id = format!("btrfuzz-image-{}-{}", id, pid);
            let cov_id = format!("btrfuzz-cover-{}-{}", id, pid);
            let img = create_shm(&img_id, IN_SHM_SZ)?;
            let cov = create_shm(&cov_id, COVER_SHM_SZ)?;
            // image region first, the guest maps the devices in bus order
            qemu_config
                .add_shm(&img_id, IN_SHM_SZ)
                .add_shm(&cov_id, COVER_SHM_SZ);
            Some((img, cov))
        } else {
            None
        };

        Ok(Self {
            qemu: QemuHandle::with_config(qemu_config),
            opts: config.runner.clone(),
            shms,
            remote_runner: None,
            runner: None,
            runner_stderr: None,
        })
    }

    fn kill_runner(&mut self) {
        if let Some(mut r) = self.runner.take() {
            let _ = r.kill();
            let _ = r.wait();
        }
        if let Some(stderr) = self.runner_stderr.take() {
            let msg = stderr.current_data();
            if !msg.is_empty() {
                log::debug!("runner stderr:\n{}", String::from_utf8_lossy(&msg));
            }
        }
    }

    fn copy_runner(&mut self) -> Result<PathBuf, MachineError> {
        if let Some(p) = self.remote_runner.as_ref() {
            return Ok(p.clone());
        }
        let (ip, port) = self.qemu.addr().ok_or(MachineError::NotBooted)?;
        let (key, user) = self.qemu.ssh();
        let name = self
            .opts
            .runner_bin
            .file_name()
            .ok_or_else(|| MachineError::Spawn("bad runner path".to_string()))?;
        let to = Path::new("~").join(name);
        ssh::scp(&ip, port, &key, &user, &self.opts.runner_bin, &to)?;
        self.remote_runner = Some(to.clone());
        Ok(to)
    }

    fn open_regions(
        &self,
    ) -> Result<(Option<Box<dyn SharedRegion>>, Option<Box<dyn SharedRegion>>), MachineError> {
        let (img, cov) = match self.shms.as_ref() {
            Some(shms) => shms,
            None => return Ok((None, None)),
        };
        let open = |shm: &Shmem| -> Result<Box<dyn SharedRegion>, MachineError> {
            let m = ShmemConf::new()
                .os_id(shm.get_os_id())
                .open()
                .map_err(|e| MachineError::Spawn(format!("open shm: {}", e)))?;
            Ok(Box::new(ShmRegion::new(m)))
        };
        Ok((Some(open(img)?), Some(open(cov)?)))
    }
}

impl Machine for QemuMachine {
    fn boot(&mut self) -> Result<Duration, MachineError> {
        self.kill_runner();
        self.remote_runner = None;
        Ok(self.qemu.boot()?)
    }

    fn spawn_runner(&mut self) -> Result<RunnerLink, MachineError> {
        self.kill_runner();
        let remote = self.copy_runner()?;
        let mut cmd = self.qemu.ssh_cmd().ok_or(MachineError::NotBooted)?;
        cmd.arg(&remote)
            .args(self.opts.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let writer = child.stdin.take();
        let reader = child.stdout.take();
        let stderr = child.stderr.take();
        let (writer, reader) = match (writer, reader) {
            (Some(w), Some(r)) => (w, r),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MachineError::Spawn("runner pipes missing".to_string()));
            }
        };
        self.runner_stderr = stderr.map(read_background);
        self.runner = Some(child);

        let (image_region, cover_region) = self.open_regions()?;
        Ok(RunnerLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
            image_region,
            cover_region,
        })
    }

    fn console(&mut self) -> Vec<u8> {
        self.qemu.console_data()
    }

    fn is_alive(&mut self) -> bool {
        self.qemu.is_running() && self.qemu.is_alive()
    }

    fn collect_console(&mut self, grace: Duration) -> Vec<u8> {
        self.kill_runner();
        let data = self.qemu.collect_crash_log(grace).unwrap_or_default();
        self.remote_runner = None;
        data
    }

    fn kill(&mut self) {
        self.kill_runner();
        self.qemu.kill();
        self.remote_runner = None;
    }
}

impl Drop for QemuMachine {
    fn drop(&mut self) {
        self.kill();
    }
}

/// In-process machine for tests: the runner is a thread with a real `RunnerEndpoint`
/// on one end of a socket pair, the console a shared buffer.
#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use btrfuzz_channel::{cov::EdgeHasher, RunStatus, RunnerEndpoint, MAP_SIZE};
    use btrfuzz_core::{fixup::fixup, image, synth};
    use std::{
        net::Shutdown,
        os::unix::net::UnixStream,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex,
        },
        thread::{self, JoinHandle},
    };

    pub enum Action {
        Reply(RunStatus),
        /// Print to the console, then reply.
        Print(&'static str, RunStatus),
        /// Print to the console and drop the channel.
        Die(&'static str),
        /// Swallow the request.
        Stall,
    }

    pub type Behavior = Arc<dyn Fn(&[u8]) -> Action + Send + Sync>;

    /// Decode, fix up and "mount" when every gate passes.
    pub fn mounting(candidate: &[u8]) -> Action {
        match image::decode(candidate) {
            Ok(mut raw) => {
                fixup(&mut raw);
                if synth::gates_pass(&raw) {
                    Action::Reply(RunStatus::Normal)
                } else {
                    Action::Reply(RunStatus::FilesystemError)
                }
            }
            Err(_) => Action::Reply(RunStatus::DecodeError),
        }
    }

    /// Panics the "kernel" on images whose first byte is `0xAA`.
    pub fn panicking(candidate: &[u8]) -> Action {
        if candidate.first() == Some(&0xAA) {
            Action::Die("[  7.1] BUG: kernel NULL pointer dereference, address: 0000000000000008\n[  7.1] RIP: 0010:btrfs_root_node+0x3/0x20\n")
        } else {
            mounting(candidate)
        }
    }

    fn cover(candidate: &[u8], record: &mut [u8]) {
        let mut h = EdgeHasher::new();
        let pcs: Vec<u64> = candidate
            .chunks(4096)
            .enumerate()
            .filter(|(_, c)| c.iter().any(|&b| b != 0))
            .map(|(i, c)| 0xffff_ffff_8100_0000 + (i as u64) * 0x40 + c[0] as u64)
            .collect();
        h.fold(&pcs, record);
    }

    #[derive(Default, Clone)]
    pub struct Counters {
        pub boots: Arc<AtomicU64>,
        pub spawns: Arc<AtomicU64>,
        /// Grace periods passed to `collect_console`, in call order.
        pub graces: Arc<Mutex<Vec<Duration>>>,
    }

    pub struct StubMachine {
        behavior: Behavior,
        console: Arc<Mutex<Vec<u8>>>,
        hangup: Option<UnixStream>,
        runner: Option<JoinHandle<()>>,
        booted: bool,
        fail_boots: u32,
        pub counters: Counters,
    }

    impl StubMachine {
        pub fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                console: Arc::new(Mutex::new(Vec::new())),
                hangup: None,
                runner: None,
                booted: false,
                fail_boots: 0,
                counters: Counters::default(),
            }
        }

        pub fn mounting() -> Self {
            Self::new(Arc::new(mounting))
        }

        pub fn failing_boots(mut self, n: u32) -> Self {
            self.fail_boots = n;
            self
        }

        pub fn print(&self, s: &str) {
            self.console.lock().unwrap().extend_from_slice(s.as_bytes());
        }

        fn stop_runner(&mut self) {
            if let Some(s) = self.hangup.take() {
                let _ = s.shutdown(Shutdown::Both);
            }
            if let Some(h) = self.runner.take() {
                let _ = h.join();
            }
        }
    }

    fn serve(behavior: Behavior, console: Arc<Mutex<Vec<u8>>>, sock: UnixStream) {
        let reader = match sock.try_clone() {
            Ok(r) => r,
            Err(_) => return,
        };
        let mut ep = RunnerEndpoint::new(reader, sock);
        if ep.ready().is_err() {
            return;
        }
        while let Ok(Some(candidate)) = ep.wait_go() {
            let status = match behavior(&candidate) {
                Action::Reply(status) => status,
                Action::Print(msg, status) => {
                    console.lock().unwrap().extend_from_slice(msg.as_bytes());
                    status
                }
                Action::Die(msg) => {
                    console.lock().unwrap().extend_from_slice(msg.as_bytes());
                    return;
                }
                Action::Stall => continue,
            };
            if status == RunStatus::Normal {
                cover(&candidate, &mut ep.cover_mut()[..MAP_SIZE]);
            }
            if ep.done(status).is_err() {
                return;
            }
        }
    }

    impl Machine for StubMachine {
        fn boot(&mut self) -> Result<Duration, MachineError> {
            self.stop_runner();
            self.counters.boots.fetch_add(1, Ordering::SeqCst);
            if self.fail_boots > 0 {
                self.fail_boots -= 1;
                self.booted = false;
                return Err(MachineError::Boot(BootError::Boot("stub".to_string())));
            }
            self.console.lock().unwrap().clear();
            self.print("[  0.0] Linux version 5.15.0-stub\n");
            self.booted = true;
            Ok(Duration::from_millis(1))
        }

        fn spawn_runner(&mut self) -> Result<RunnerLink, MachineError> {
            if !self.booted {
                return Err(MachineError::NotBooted);
            }
            self.stop_runner();
            self.counters.spawns.fetch_add(1, Ordering::SeqCst);
            let (host, guest) = UnixStream::pair()?;
            let behavior = Arc::clone(&self.behavior);
            let console = Arc::clone(&self.console);
            self.runner = Some(thread::spawn(move || serve(behavior, console, guest)));
            self.hangup = Some(host.try_clone()?);
            Ok(RunnerLink {
                reader: Box::new(host.try_clone()?),
                writer: Box::new(host),
                image_region: None,
                cover_region: None,
            })
        }

        fn console(&mut self) -> Vec<u8> {
            let mut c = self.console.lock().unwrap();
            c.split_off(0)
        }

        fn is_alive(&mut self) -> bool {
            self.booted
        }

        fn collect_console(&mut self, grace: Duration) -> Vec<u8> {
            self.counters.graces.lock().unwrap().push(grace);
            self.stop_runner();
            self.booted = false;
            self.console()
        }

        fn kill(&mut self) {
            self.stop_runner();
            self.booted = false;
        }
    }

    impl Drop for StubMachine {
        fn drop(&mut self) {
            self.stop_runner();
        }
    }
}
