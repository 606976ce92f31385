mod exercise;
mod ivshm;
mod kcov;
mod kmsg;
mod loopdev;
mod mount;
mod runner;

use anyhow::Context;
use btrfuzz_channel::{RunnerEndpoint, SharedRegion};
use env_logger::{Env, TimestampPrecision};
use kcov::{Kcov, KcovMode};
use kmsg::Kmsg;
use loopdev::LoopDevice;
use runner::{Runner, RunnerConfig};
use std::{io, path::PathBuf};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "btrfuzz_runner", about = "Mount and exercise btrfs images sent by the harness")]
struct Settings {
    /// Exchange images and coverage through the ivshmem devices.
    #[structopt(long)]
    use_ivshm: bool,
    /// Run without KCOV, coverage stays empty.
    #[structopt(long)]
    no_kcov: bool,
    /// KCOV sampling: read-clear or read-only.
    #[structopt(long, default_value = "read-clear")]
    kcov_mode: KcovMode,
    /// Where each image is written before it is attached.
    #[structopt(long, default_value = "/tmp/btrfsimage")]
    image_path: PathBuf,
    #[structopt(long, default_value = "/mnt/btrfs")]
    mount_point: PathBuf,
    #[structopt(long, default_value = "btrfs")]
    fs_type: String,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("BTRFUZZ_RUNNER_LOG", "info")
        .default_write_style_or("never");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let kcov = if settings.no_kcov {
        log::warn!("kcov disabled, coverage will be empty");
        None
    } else {
        Some(Kcov::open(settings.kcov_mode).context("failed to setup kcov")?)
    };
    let loopdev = LoopDevice::alloc().context("failed to setup loop device")?;
    let kmsg = Kmsg::open().context("failed to open kmsg")?;
    mount::forget_devices().context("failed to reset btrfs devices")?;
    mount::prepare_mount_point(&settings.mount_point).with_context(|| {
        format!(
            "failed to create mount point {}",
            settings.mount_point.display()
        )
    })?;

    let (image, cover): (Option<Box<dyn SharedRegion>>, Option<Box<dyn SharedRegion>>) =
        if settings.use_ivshm {
            let (image, cover) = ivshm::setup().context("failed to setup ivshmem")?;
            (
                Some(Box::new(image) as Box<dyn SharedRegion>),
                Some(Box::new(cover) as Box<dyn SharedRegion>),
            )
        } else {
            (None, None)
        };

    let conf = RunnerConfig {
        image_path: settings.image_path,
        mount_point: settings.mount_point,
        fs_type: settings.fs_type,
    };
    let mut runner = Runner::new(conf, kcov, loopdev, kmsg);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut endpoint = RunnerEndpoint::new(stdin.lock(), stdout.lock())
        .with_regions(image, cover)
        .context("failed to setup channel")?;
    endpoint.ready().context("failed to send ready")?;
    log::info!("runner ready");

    while let Some(candidate) = endpoint.wait_go().context("failed to receive image")? {
        let status = runner.execute(&candidate, endpoint.cover_mut());
        log::debug!("status: {:?}", status);
        endpoint.done(status).context("failed to send done")?;
    }
    log::info!("harness gone after {} iterations", runner.iterations());
    Ok(())
}
