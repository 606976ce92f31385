use btrfuzz_harness::{
    config::Config, machine::RunnerOpts, session::SessionConfig,
};
use btrfuzz_vm::qemu::QemuConfig;
use env_logger::{Env, TimestampPrecision};
use std::{path::PathBuf, time::Duration};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct VmSettings {
    /// Target to boot, linux/amd64 or linux/arm64.
    #[structopt(long, default_value = "linux/amd64")]
    target: String,
    /// Directory to write crash artifacts and logs.
    #[structopt(long, short = "o", default_value = "output")]
    output: PathBuf,
    /// Path to kernel image.
    #[structopt(long, short = "k", default_value = "bzImage")]
    kernel_img: PathBuf,
    /// Path to disk image.
    #[structopt(long, short = "d", default_value = "rootfs.img")]
    disk_img: PathBuf,
    /// Path to ssh secret key to login to the guest.
    #[structopt(long, short = "s", default_value = "./rootfs.id_rsa")]
    ssh_key: PathBuf,
    /// Username to login the guest.
    #[structopt(long, short = "u", default_value = "root")]
    ssh_user: String,
    /// QEMU smp.
    #[structopt(long, short = "c", default_value = "1")]
    qemu_smp: u32,
    /// QEMU mem size in megabyte.
    #[structopt(long, short = "m", default_value = "2048")]
    qemu_mem: u32,
    /// Runner binary copied into the guest.
    #[structopt(long, short = "r", default_value = "btrfuzz_runner")]
    runner: PathBuf,
    /// Stream images over the ssh pipes instead of ivshmem.
    #[structopt(long)]
    no_ivshm: bool,
    /// Run the runner without KCOV.
    #[structopt(long)]
    no_kcov: bool,
    /// KCOV sampling of the runner: read-clear or read-only.
    #[structopt(long, default_value = "read-clear")]
    kcov_mode: String,
    /// Seconds to wait for one iteration.
    #[structopt(long, short = "t", default_value = "30")]
    timeout: u64,
    /// Seconds to wait for the runner to come up.
    #[structopt(long, default_value = "60")]
    ready_timeout: u64,
    /// Extra console signatures, one per line.
    #[structopt(long)]
    signatures: Option<PathBuf>,
    /// Raw images known to crash, answered without running.
    #[structopt(long)]
    known_crashes: Option<PathBuf>,
    /// Keep the most recent images of each worker here.
    #[structopt(long)]
    current_dir: Option<PathBuf>,
    /// Number of recent images kept in `--current-dir`.
    #[structopt(long, short = "n", default_value = "15")]
    last_n: u64,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "btrfuzz", about = "Coverage guided btrfs image fuzzer")]
enum Settings {
    /// Act as the AFL++ target.
    Fuzz {
        #[structopt(flatten)]
        vm: VmSettings,
        /// Read each input from this file instead of stdin.
        #[structopt(long, short = "f")]
        input: Option<PathBuf>,
    },
    /// Execute every image of a directory once.
    Run {
        #[structopt(flatten)]
        vm: VmSettings,
        /// Directory of input images.
        #[structopt(long, short = "i")]
        input: PathBuf,
        /// Parallel workers, each with its own vm.
        #[structopt(long, short = "j", default_value = "1")]
        job: usize,
    },
    /// Replay a saved artifact.
    Repro {
        #[structopt(flatten)]
        vm: VmSettings,
        /// Artifact directory, crashes/<outcome>-<signature>.
        artifact_dir: PathBuf,
        /// Artifact number inside the directory.
        #[structopt(default_value = "1")]
        id: usize,
    },
    /// Pack a raw image into the container format.
    Compress { input: PathBuf, output: PathBuf },
    /// Expand a container to the raw image.
    Decompress { input: PathBuf, output: PathBuf },
}

fn config(vm: VmSettings, job: usize) -> Config {
    let defaults = Config::default();
    Config {
        output: vm.output,
        known_crash_dir: vm.known_crashes,
        signatures: vm.signatures,
        current_dir: vm.current_dir,
        last_n: vm.last_n,
        job,
        runner: RunnerOpts {
            runner_bin: vm.runner,
            use_ivshm: !vm.no_ivshm,
            no_kcov: vm.no_kcov,
            kcov_mode: vm.kcov_mode,
        },
        session: SessionConfig {
            exec_timeout: Duration::from_secs(vm.timeout),
            ready_timeout: Duration::from_secs(vm.ready_timeout),
            ..SessionConfig::default()
        },
        qemu_config: QemuConfig {
            target: vm.target,
            kernel_img: Some(vm.kernel_img.to_string_lossy().into_owned()),
            disk_img: vm.disk_img.to_string_lossy().into_owned(),
            ssh_key: vm.ssh_key.to_string_lossy().into_owned(),
            ssh_user: vm.ssh_user,
            qemu_smp: vm.qemu_smp,
            qemu_mem: vm.qemu_mem,
            shmids: Vec::new(),
        },
        ..defaults
    }
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("BTRFUZZ_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    match settings {
        Settings::Fuzz { vm, input } => btrfuzz_harness::fuzz(config(vm, 1), input),
        Settings::Run { vm, input, job } => btrfuzz_harness::run(config(vm, job), &input),
        Settings::Repro {
            vm,
            artifact_dir,
            id,
        } => {
            let report = btrfuzz_harness::repro(config(vm, 1), &artifact_dir, id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.reproduced {
                Ok(())
            } else {
                Err(anyhow::anyhow!("not reproduced"))
            }
        }
        Settings::Compress { input, output } => btrfuzz_harness::compress(&input, &output),
        Settings::Decompress { input, output } => btrfuzz_harness::decompress(&input, &output),
    }
}
