use sha1::{Digest, Sha1};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{
    os::raw::c_int,
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::Duration,
};

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

/// Retry `f` up to `max` more times, sleeping `wait` in between, unless a stop was requested.
pub fn retry_with<T, E>(
    max: u32,
    wait: Duration,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut tried = 0;
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) => {
                if tried < max && !stop_soon() {
                    sleep(wait);
                    tried += 1;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

pub fn retry_exec<T, E>(f: impl FnMut() -> Result<T, E>) -> Result<T, E> {
    retry_with(3, Duration::from_secs(10), f)
}

/// Create, or take over a stale, shm segment named `id`.
pub fn create_shm(id: &str, sz: usize) -> anyhow::Result<Shmem> {
    match ShmemConf::new().os_id(id).size(sz).create() {
        Ok(mut shm) => {
            shm.set_owner(true);
            Ok(shm)
        }
        Err(ShmemError::MappingIdExists) => {
            let mut shm = ShmemConf::new().os_id(id).size(sz).open()?;
            shm.set_owner(true);
            Ok(shm)
        }
        Err(e) => Err(e.into()),
    }
}

/// Hex sha1 of an image, the key of known crashes.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn setup_signal_handler() {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = match SignalsInfo::<WithOrigin>::new(TERM_SIGNALS) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to install signal handler: {}", e);
            return;
        }
    };
    std::thread::spawn(move || {
        if let Some(info) = signals.into_iter().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            log::info!("waiting for workers to exit...");
            stop_req();
        }
    });
}
