//! btrfuzz harness: long-lived QEMU sessions running btrfs images through the in-VM
//! runner, with crash classification, artifacts and the AFL++ bridge on top.

#[macro_use]
pub mod worker_log;
pub mod classify;
pub mod config;
pub mod crash;
pub mod current;
pub mod feedback;
pub mod machine;
pub mod repro;
pub mod session;
pub mod stats;
pub mod util;
pub mod worker;

use crate::{
    classify::Signatures,
    config::Config,
    crash::CrashManager,
    current::CurrentInputs,
    machine::QemuMachine,
    session::Outcome,
    stats::Stats,
    util::{setup_signal_handler, stop_soon},
    worker::{Worker, WorkerConfig},
    worker_log::set_worker_id,
};
use ahash::AHashMap;
use anyhow::Context;
use btrfuzz_channel::afl::AflForkserver;
use btrfuzz_core::image::{self, CompressedImage};
use std::{
    fs::{read, read_dir, write, File},
    io::{Read, Seek, SeekFrom},
    mem::ManuallyDrop,
    os::unix::io::FromRawFd,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, sleep},
    time::Duration,
};

pub type HashMap<K, V> = AHashMap<K, V>;

/// State the workers of one harness process share.
#[derive(Clone)]
struct Shared {
    sigs: Arc<Signatures>,
    crash: Arc<CrashManager>,
    stats: Arc<Stats>,
}

fn prepare(config: &mut Config) -> anyhow::Result<Shared> {
    config.check().context("config error")?;
    config.fixup().context("config error")?;

    let sigs = match config.signatures.as_ref() {
        Some(f) => Signatures::load(f).context("failed to load signatures")?,
        None => Signatures::default(),
    };
    log::info!("console signatures: {}", sigs.len());

    let crash = CrashManager::new(config.output.clone());
    let n = crash
        .load_previous()
        .context("failed to load previous crashes")?;
    if n != 0 {
        log::info!("previous crashes: {}", n);
    }
    if let Some(d) = config.known_crash_dir.as_ref() {
        let n = crash
            .load_known_images(d)
            .context("failed to load known crashes")?;
        log::info!("known crash images: {}", n);
    }
    let stats = Arc::new(Stats::new());
    stats.set_unique_crash(crash.unique_crashes());

    Ok(Shared {
        sigs: Arc::new(sigs),
        crash: Arc::new(crash),
        stats,
    })
}

fn worker_config(config: &Config) -> WorkerConfig {
    WorkerConfig {
        boot_retries: config.boot_retries,
        retry_wait: config.retry_wait,
        session: config.session.clone(),
    }
}

fn new_worker(id: u64, config: &Config, shared: &Shared) -> anyhow::Result<Worker<QemuMachine>> {
    let machine = QemuMachine::new(id, config).context("failed to setup vm")?;
    let mut worker = Worker::new(
        id,
        machine,
        Arc::clone(&shared.sigs),
        worker_config(config),
        Arc::clone(&shared.crash),
        Arc::clone(&shared.stats),
    );
    if let Some(dir) = config.current_dir.as_ref() {
        let current = CurrentInputs::new(dir.join(format!("worker-{}", id)), config.last_n)?;
        worker = worker.with_current(current);
    }
    Ok(worker)
}

/// Read the current AFL++ input: `input` if given, otherwise stdin from its start.
fn read_input(input: Option<&Path>, buf: &mut Vec<u8>) -> anyhow::Result<()> {
    buf.clear();
    match input {
        Some(p) => {
            let mut f = File::open(p).with_context(|| format!("failed to open {}", p.display()))?;
            f.read_to_end(buf)?;
        }
        None => {
            // SAFETY: fd 0 stays owned by the process, the wrapper is never dropped.
            let mut stdin = ManuallyDrop::new(unsafe { File::from_raw_fd(0) });
            // AFL++ rewrites the same file for each run, pipes cannot seek
            let _ = stdin.seek(SeekFrom::Start(0));
            stdin.read_to_end(buf).context("failed to read stdin")?;
        }
    }
    Ok(())
}

/// Serve AFL++ as its forkserver target: one worker, one long-lived session.
pub fn fuzz(mut config: Config, input: Option<PathBuf>) -> anyhow::Result<()> {
    let shared = prepare(&mut config)?;
    setup_signal_handler();
    let stats = Arc::clone(&shared.stats);
    thread::spawn(move || stats.report(Duration::from_secs(10)));

    let mut worker = new_worker(0, &config, &shared)?;
    let mut fsrv = AflForkserver::attach().context("failed to attach to afl")?;
    if fsrv.is_standalone() {
        log::info!("no forkserver pipes, running once");
    }

    let mut buf = Vec::new();
    while !stop_soon() && fsrv.next_run()? {
        read_input(input.as_deref(), &mut buf)?;
        let s = worker.submit(&buf)?;
        fsrv.publish(worker.coverage());
        fsrv.report(s.outcome.afl_status())?;
        if fsrv.is_standalone() {
            log::info!(
                "outcome: {}, signature: {}, new edges: {}",
                s.outcome,
                s.signature.as_deref().unwrap_or("-"),
                s.new_edges
            );
        }
    }
    worker.shutdown();
    log::info!("runs: {}, {}", fsrv.runs(), shared.stats.summary());
    Ok(())
}

fn split_inputs(inputs: Vec<PathBuf>, job: usize) -> Vec<Vec<PathBuf>> {
    if inputs.is_empty() {
        return Vec::new();
    }
    let n = inputs.len() + job - 1;
    let m = n / job;
    inputs.chunks(m).map(|c| c.to_vec()).collect()
}

/// Execute every image in `input_dir` once, spread over `config.job` workers.
pub fn run(mut config: Config, input_dir: &Path) -> anyhow::Result<()> {
    let shared = prepare(&mut config)?;
    let mut inputs = Vec::new();
    for f in read_dir(input_dir).context("failed to read input dir")? {
        let f = f?.path();
        if f.is_file() {
            inputs.push(f);
        }
    }
    inputs.sort();
    log::info!("images: {}, jobs: {}", inputs.len(), config.job);
    let mut batches = split_inputs(inputs, config.job);

    setup_signal_handler();
    let stats = Arc::clone(&shared.stats);
    thread::spawn(move || stats.report(Duration::from_secs(10)));

    let mut workers = Vec::with_capacity(config.job);
    let mut id = 0;
    while let Some(batch) = batches.pop() {
        let config = config.clone();
        let shared = shared.clone();
        let handle = thread::spawn(move || -> anyhow::Result<()> {
            set_worker_id(id);
            let mut worker = new_worker(id, &config, &shared)?;
            let r = run_batch(&mut worker, &batch);
            worker.shutdown();
            r
        });
        workers.push(handle);
        id += 1;
        if stop_soon() {
            break;
        }
        if !batches.is_empty() {
            sleep(Duration::from_secs(1));
        }
    }

    let mut err = None;
    for (i, w) in workers.into_iter().enumerate() {
        let e = match w.join() {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("worker panicked"),
        };
        let err = err.get_or_insert_with(|| "worker exits with errors:".to_string());
        err.push_str(&format!("\n\tworker-{}: {}", i, e));
        for (i, cause) in e.chain().enumerate() {
            err.push_str(&format!("\n\t\t{}. {}", i, cause));
        }
    }
    log::info!("{}", shared.stats.summary());
    match err {
        None => {
            log::info!("All done");
            Ok(())
        }
        Some(e) => Err(anyhow::anyhow!(e)),
    }
}

fn run_batch(worker: &mut Worker<QemuMachine>, batch: &[PathBuf]) -> anyhow::Result<()> {
    for f in batch {
        if stop_soon() {
            break;
        }
        let image = read(f).with_context(|| format!("failed to read {}", f.display()))?;
        let s = worker.submit(&image)?;
        match s.outcome {
            Outcome::Normal | Outcome::FilesystemError => {
                worker_debug!("{}: {}", f.display(), s.outcome)
            }
            _ => worker_info!(
                "{}: {} ({})",
                f.display(),
                s.outcome,
                s.signature.as_deref().unwrap_or("-")
            ),
        }
    }
    Ok(())
}

pub fn repro(mut config: Config, artifact_dir: &Path, id: usize) -> anyhow::Result<repro::ReproReport> {
    config.check().context("config error")?;
    config.fixup().context("config error")?;
    repro::reproduce(&config, artifact_dir, id)
}

/// Pack a raw image into the container format.
pub fn compress(input: &Path, output: &Path) -> anyhow::Result<()> {
    let raw = read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let img = CompressedImage::compress(&raw).context("failed to compress image")?;
    let bytes = img.to_bytes();
    log::info!(
        "{} -> {} bytes, {} extents",
        raw.len(),
        bytes.len(),
        img.extents.len()
    );
    write(output, bytes).with_context(|| format!("failed to write {}", output.display()))
}

/// Expand a candidate, container or raw, to the raw image.
pub fn decompress(input: &Path, output: &Path) -> anyhow::Result<()> {
    let bytes = read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let raw = image::decode(&bytes).context("failed to decode image")?;
    write(output, raw).with_context(|| format!("failed to write {}", output.display()))
}
