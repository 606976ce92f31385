//! Boot up and manage the guest that hosts the runner.
use crate::{ssh, HashSet};
use btrfuzz_io::{thread::read_background, BackgroundIoHandle};
use nix::unistd::setsid;
use std::{
    ops::RangeInclusive,
    os::unix::prelude::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Min major version of qemu
pub const MIN_QEMU_VERSION: u32 = 4;
/// Upper bound of one boot.
pub const MAX_BOOT_WAIT: Duration = Duration::from_secs(60 * 10);
/// Time given to a dying guest to flush its console.
pub const CRASH_LOG_WAIT: Duration = Duration::from_secs(15);

const BOOT_POLL_MAX: Duration = Duration::from_millis(500);
const BOOT_POLL_MIN: Duration = Duration::from_millis(100);
const BOOT_POLL_STEP: Duration = Duration::from_millis(100);

/// Configuration of booting qemu.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// Booting target, linux/amd64 or linux/arm64.
    pub target: String,
    /// Path to the instrumented kernel.
    pub kernel_img: Option<String>,
    /// Root filesystem image holding the runner's userspace.
    pub disk_img: String,
    /// Path to ssh secret key to login to the guest.
    pub ssh_key: String,
    pub ssh_user: String,
    pub qemu_smp: u32,
    /// Mem size in megabyte.
    pub qemu_mem: u32,
    /// Backing files of the ivshmem devices, in PCI order.
    pub shmids: Vec<(String, usize)>,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            target: "linux/amd64".to_string(),
            kernel_img: Some("./bzImage".to_string()),
            disk_img: "./rootfs.img".to_string(),
            ssh_key: "./rootfs.id_rsa".to_string(),
            ssh_user: "root".to_string(),
            qemu_smp: 1,
            qemu_mem: 2048,
            shmids: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QemuConfigError {
    #[error("unsupported target {0}, expected linux/amd64 or linux/arm64")]
    UnsupportedTarget(String),
    #[error("{what} not found: {path}")]
    MissingFile { what: &'static str, path: String },
    #[error("ssh user must not be empty")]
    EmptySshUser,
    #[error("{what} {value} out of range {range:?}")]
    OutOfRange {
        what: &'static str,
        value: u32,
        range: RangeInclusive<u32>,
    },
    #[error("qemu unusable: {0}")]
    QemuCheckFailed(String),
}

const SMP_RANGE: RangeInclusive<u32> = 1..=1024;
/// Megabytes, the guest kernel and the runner need more than the minimum.
const MEM_RANGE: RangeInclusive<u32> = 256..=1 << 20;

fn require_file(what: &'static str, path: &str) -> Result<(), QemuConfigError> {
    if Path::new(path).is_file() {
        Ok(())
    } else {
        Err(QemuConfigError::MissingFile {
            what,
            path: path.to_string(),
        })
    }
}

fn require_range(
    what: &'static str,
    value: u32,
    range: RangeInclusive<u32>,
) -> Result<(), QemuConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(QemuConfigError::OutOfRange { what, value, range })
    }
}

impl QemuConfig {
    /// Validate the fields, then make sure a recent enough qemu is installed.
    pub fn check(&self) -> Result<(), QemuConfigError> {
        self.check_fields()?;
        check_qemu(&self.target)
    }

    fn check_fields(&self) -> Result<(), QemuConfigError> {
        if static_conf(&self.target).is_none() {
            return Err(QemuConfigError::UnsupportedTarget(self.target.clone()));
        }
        require_file("disk image", &self.disk_img)?;
        if let Some(k) = self.kernel_img.as_deref() {
            require_file("kernel image", k)?;
        }
        require_file("ssh key", &self.ssh_key)?;
        if self.ssh_user.is_empty() {
            return Err(QemuConfigError::EmptySshUser);
        }
        require_range("smp", self.qemu_smp, SMP_RANGE)?;
        require_range("memory", self.qemu_mem, MEM_RANGE)
    }

    /// Back one more ivshmem device with `/dev/shm/<shm_id>`.
    pub fn add_shm(&mut self, shm_id: &str, sz: usize) -> &mut Self {
        let shm_path = PathBuf::from("/dev/shm").join(shm_id);
        self.shmids
            .push((shm_path.to_string_lossy().into_owned(), sz));
        self
    }
}

fn check_qemu(target: &str) -> Result<(), QemuConfigError> {
    let qemu = static_conf(target)
        .ok_or_else(|| QemuConfigError::UnsupportedTarget(target.to_string()))?
        .qemu;
    let output = Command::new(qemu)
        .arg("--version")
        .output()
        .map_err(|e| QemuConfigError::QemuCheckFailed(format!("{}: {}", qemu, e)))?;
    if !output.status.success() {
        return Err(QemuConfigError::QemuCheckFailed(format!(
            "{} --version: {}",
            qemu, output.status
        )));
    }
    let version = String::from_utf8_lossy(&output.stdout);
    match parse_major_version(&version) {
        Some(major) if major >= MIN_QEMU_VERSION => Ok(()),
        Some(major) => Err(QemuConfigError::QemuCheckFailed(format!(
            "{} is version {}, at least {} is required",
            qemu, major, MIN_QEMU_VERSION
        ))),
        None => Err(QemuConfigError::QemuCheckFailed(format!(
            "unrecognized version: {}",
            version.trim()
        ))),
    }
}

fn parse_major_version(output: &str) -> Option<u32> {
    let idx = output.find("version")?;
    let rest = output[idx + "version".len()..].trim_start();
    let major = rest.split('.').next()?;
    major.parse().ok()
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot: {0}")]
    Boot(String),
    #[error("spawn: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no port to spawn qemu")]
    NoFreePort,
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
}

pub struct QemuHandle {
    qemu_cfg: QemuConfig,
    qemu: Option<Child>,
    stdout: Option<BackgroundIoHandle>,
    stderr: Option<BackgroundIoHandle>,
    ssh_port: Option<PortGuard>,
}

impl QemuHandle {
    pub fn with_config(config: QemuConfig) -> Self {
        Self {
            qemu_cfg: config,
            qemu: None,
            stdout: None,
            stderr: None,
            ssh_port: None,
        }
    }

    pub fn config(&self) -> &QemuConfig {
        &self.qemu_cfg
    }

    /// Boot a fresh guest, killing the old one first.
    pub fn boot(&mut self) -> Result<Duration, BootError> {
        if self.qemu.is_some() {
            log::debug!("rebooting");
            self.kill_qemu();
        }
        self.boot_inner()
    }

    pub fn addr(&self) -> Option<(String, u16)> {
        self.ssh_port
            .as_ref()
            .map(|port| (QEMU_SSH_IP.to_string(), port.0))
    }

    pub fn ssh(&self) -> (String, String) {
        (self.qemu_cfg.ssh_key.clone(), self.qemu_cfg.ssh_user.clone())
    }

    /// An ssh command to the guest, `None` when nothing is booted.
    pub fn ssh_cmd(&self) -> Option<Command> {
        let (ip, port) = self.addr()?;
        Some(ssh::ssh_basic_cmd(
            &ip,
            port,
            &self.qemu_cfg.ssh_key,
            &self.qemu_cfg.ssh_user,
        ))
    }

    /// The guest answers over ssh.
    pub fn is_alive(&self) -> bool {
        if self.qemu.is_none() {
            return false;
        }
        let mut ssh_cmd = match self.ssh_cmd() {
            Some(cmd) => cmd,
            None => return false,
        };
        ssh_cmd
            .arg("pwd")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// The qemu process has not exited yet.
    pub fn is_running(&mut self) -> bool {
        match self.qemu.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Console bytes produced since the last call.
    pub fn console_data(&self) -> Vec<u8> {
        self.stdout
            .as_ref()
            .map(|s| s.current_data())
            .unwrap_or_default()
    }

    /// Give the guest up to `grace` to die and flush its console, then kill it.
    pub fn collect_crash_log(&mut self, grace: Duration) -> Option<Vec<u8>> {
        let stdout = self.stdout.take()?;
        let qemu = self.qemu.as_mut()?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && matches!(qemu.try_wait(), Ok(None)) {
            sleep(BOOT_POLL_MIN);
        }
        self.kill_qemu();
        Some(stdout.wait_finish(Duration::from_secs(1)))
    }

    pub fn reset(&mut self) {
        if let Some(stdout) = self.stdout.as_ref() {
            stdout.clear_current();
        }
        if let Some(stderr) = self.stderr.as_ref() {
            stderr.clear_current();
        }
    }

    pub fn kill(&mut self) {
        self.kill_qemu();
    }

    fn kill_qemu(&mut self) {
        if let Some(qemu) = self.qemu.as_mut() {
            let _ = qemu.kill();
            let _ = qemu.wait();
        }
        self.qemu = None;
        self.stdout = None;
        self.stderr = None;
        self.ssh_port = None;
    }

    fn boot_inner(&mut self) -> Result<Duration, BootError> {
        let (mut qemu_cmd, ssh_fwd_port) = build_qemu_command(&self.qemu_cfg)?;
        qemu_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            qemu_cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        log::debug!("qemu cmd: {:?}", qemu_cmd);

        let mut child = qemu_cmd.spawn()?;
        self.stdout = child.stdout.take().map(read_background);
        self.stderr = child.stderr.take().map(read_background);
        self.qemu = Some(child);
        self.ssh_port = Some(ssh_fwd_port);

        let start = Instant::now();
        // ssh polls start sparse and tighten as the guest gets closer to up
        let mut pause = BOOT_POLL_MAX;
        let mut polls = 0u32;
        while start.elapsed() < MAX_BOOT_WAIT {
            sleep(pause);
            if self.is_alive() {
                self.reset();
                return Ok(start.elapsed());
            }
            polls += 1;
            if polls % 10 == 0 {
                log::debug!("guest not up after {}s", start.elapsed().as_secs());
            }
            if let Some(report) = self.exit_report(&qemu_cmd)? {
                self.kill_qemu();
                return Err(BootError::Boot(report));
            }
            pause = pause.saturating_sub(BOOT_POLL_STEP).max(BOOT_POLL_MIN);
        }

        self.kill_qemu();
        Err(BootError::Boot(format!(
            "guest unreachable after {}s",
            start.elapsed().as_secs()
        )))
    }

    /// Describe how qemu died, `None` while it still runs.
    fn exit_report(&mut self, cmd: &Command) -> Result<Option<String>, BootError> {
        let status = match self.qemu.as_mut() {
            Some(child) => match child.try_wait()? {
                Some(status) => status,
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        let stderr = self
            .stderr
            .take()
            .map(|s| s.wait_finish(Duration::from_secs(1)))
            .unwrap_or_default();
        Ok(Some(format!(
            "qemu died during boot ({})\ncmdline: {:?}\nstderr:\n{}",
            status,
            cmd,
            String::from_utf8_lossy(&stderr)
        )))
    }
}

impl Drop for QemuHandle {
    fn drop(&mut self) {
        self.kill_qemu();
    }
}

const QEMU_HOST_IP: &str = "10.0.2.10";
const QEMU_SSH_IP: &str = "127.0.0.1";
static QEMU_LINUX_APPEND: [&str; 9] = [
    "earlyprintk=serial",
    "oops=panic",
    "nmi_watchdog=panic",
    "panic_on_warn=1",
    "panic=1",
    "ftrace_dump_on_oops=orig_cpu",
    "vsyscall=native",
    "net.ifnames=0",
    "biosdevname=0",
];

struct QemuStaticConf {
    qemu: &'static str,
    args: &'static str,
    append: &'static [&'static str],
    net_dev: &'static str,
}

fn static_conf(target: &str) -> Option<&'static QemuStaticConf> {
    static AMD64: QemuStaticConf = QemuStaticConf {
        qemu: "qemu-system-x86_64",
        args: "-enable-kvm -cpu host,migratable=off",
        net_dev: "e1000",
        append: &["root=/dev/sda", "console=ttyS0"],
    };
    static ARM64: QemuStaticConf = QemuStaticConf {
        qemu: "qemu-system-aarch64",
        args: "-machine virt,virtualization=on -cpu cortex-a57",
        net_dev: "virtio-net-pci",
        append: &["root=/dev/vda", "console=ttyAMA0"],
    };
    match target {
        "linux/amd64" => Some(&AMD64),
        "linux/arm64" => Some(&ARM64),
        _ => None,
    }
}

fn build_qemu_command(conf: &QemuConfig) -> Result<(Command, PortGuard), BootError> {
    let static_conf = static_conf(&conf.target)
        .ok_or_else(|| BootError::UnsupportedTarget(conf.target.clone()))?;
    let ssh_fwd_port = get_free_port().ok_or(BootError::NoFreePort)?;

    let mut qemu_cmd = Command::new(static_conf.qemu);
    qemu_cmd
        .args(&[
            "-display",
            "none",
            "-serial",
            "stdio",
            "-no-reboot",
            "-snapshot",
            "-device",
            "virtio-rng-pci",
        ])
        .args(static_conf.args.split(' '))
        .arg("-m")
        .arg(conf.qemu_mem.to_string())
        .arg("-smp")
        .arg(conf.qemu_smp.to_string())
        .arg("-device")
        .arg(format!("{},netdev=net0", static_conf.net_dev))
        .arg("-netdev")
        .arg(format!(
            "user,id=net0,host={},hostfwd=tcp::{}-:22",
            QEMU_HOST_IP, ssh_fwd_port.0
        ))
        .arg("-drive")
        .arg(format!("file={},index=0,media=disk", conf.disk_img));

    if let Some(kernel_img) = conf.kernel_img.as_ref() {
        let append = static_conf
            .append
            .iter()
            .chain(QEMU_LINUX_APPEND.iter())
            .copied()
            .collect::<Vec<_>>();
        qemu_cmd
            .arg("-kernel")
            .arg(kernel_img)
            .arg("-append")
            .arg(append.join(" "));
    }

    for (i, (f, sz)) in conf.shmids.iter().enumerate() {
        qemu_cmd
            .arg("-device")
            .arg(format!("ivshmem-plain,memdev=hostmem{}", i))
            .arg("-object")
            .arg(format!(
                "memory-backend-file,size={},share,mem-path={},id=hostmem{}",
                sz, f, i
            ));
    }

    Ok((qemu_cmd, ssh_fwd_port))
}

static PORTS: Mutex<Option<HashSet<u16>>> = Mutex::new(None);

fn get_free_port() -> Option<PortGuard> {
    use std::net::{Ipv4Addr, TcpListener};

    let mut g = PORTS.lock().unwrap();
    let used = g.get_or_insert_with(HashSet::default);
    for p in 1025..65535 {
        if !used.contains(&p) && TcpListener::bind((Ipv4Addr::LOCALHOST, p)).is_ok() {
            used.insert(p);
            return Some(PortGuard(p));
        }
    }
    None
}

/// Forwarded ssh port, reserved for the lifetime of one guest.
struct PortGuard(u16);

impl Drop for PortGuard {
    fn drop(&mut self) {
        if let Some(used) = PORTS.lock().unwrap().as_mut() {
            used.remove(&self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn qemu_command() {
        let mut conf = QemuConfig::default();
        conf.add_shm("btrfuzz-image-0", 16 << 20)
            .add_shm("btrfuzz-cover-0", 1 << 16);
        let (cmd, port) = build_qemu_command(&conf).unwrap();
        let a = args(&cmd);
        assert_eq!(cmd.get_program(), "qemu-system-x86_64");
        for flag in ["-snapshot", "-no-reboot", "-enable-kvm"].iter() {
            assert!(a.iter().any(|x| x == flag), "missing {}", flag);
        }
        let fwd = format!("hostfwd=tcp::{}-:22", port.0);
        assert!(a.iter().any(|x| x.contains(&fwd)));
        let append = a.iter().find(|x| x.contains("panic_on_warn=1")).unwrap();
        assert!(append.starts_with("root=/dev/sda console=ttyS0"));
        assert!(a.contains(&"ivshmem-plain,memdev=hostmem1".to_string()));
        assert!(a.contains(
            &"memory-backend-file,size=65536,share,mem-path=/dev/shm/btrfuzz-cover-0,id=hostmem1"
                .to_string()
        ));
    }

    #[test]
    fn ports_are_unique() {
        let conf = QemuConfig {
            target: "linux/arm64".to_string(),
            ..QemuConfig::default()
        };
        let (c0, p0) = build_qemu_command(&conf).unwrap();
        let (_, p1) = build_qemu_command(&conf).unwrap();
        assert_ne!(p0.0, p1.0);
        assert_eq!(c0.get_program(), "qemu-system-aarch64");
        assert!(args(&c0).iter().any(|x| x.contains("console=ttyAMA0")));
    }

    #[test]
    fn config_errors() {
        let conf = QemuConfig {
            target: "linux/s390x".to_string(),
            ..QemuConfig::default()
        };
        assert!(matches!(
            conf.check(),
            Err(QemuConfigError::UnsupportedTarget(_))
        ));
        let conf = QemuConfig {
            disk_img: "/nonexistent/rootfs.img".to_string(),
            ..QemuConfig::default()
        };
        assert!(matches!(conf.check(), Err(QemuConfigError::MissingFile { what: "disk image", .. })));
    }

    #[test]
    fn version_parse() {
        assert_eq!(
            parse_major_version("QEMU emulator version 6.2.0 (Debian 1:6.2+dfsg-2)"),
            Some(6)
        );
        assert_eq!(parse_major_version("QEMU emulator version 10.0.2"), Some(10));
        assert_eq!(parse_major_version("garbage"), None);
    }

    #[test]
    fn unbooted_handle() {
        let mut h = QemuHandle::with_config(QemuConfig::default());
        assert!(!h.is_alive());
        assert!(!h.is_running());
        assert!(h.addr().is_none());
        assert!(h.collect_crash_log(CRASH_LOG_WAIT).is_none());
        assert!(h.console_data().is_empty());
    }
}
