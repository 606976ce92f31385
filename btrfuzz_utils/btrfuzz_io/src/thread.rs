use crate::BackgroundIoHandle;
use std::{
    fs::File,
    io::{ErrorKind, Read},
    os::unix::prelude::{FromRawFd, IntoRawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

const READ_CHUNK: usize = 128 * 1024;

/// Drain `f` on a dedicated thread until EOF.
pub fn read_background<T: IntoRawFd>(f: T) -> BackgroundIoHandle {
    let fd = f.into_raw_fd();
    // SAFETY: `into_raw_fd` hands the descriptor over to us.
    let mut f = unsafe { File::from_raw_fd(fd) };
    let buf = Arc::new(Mutex::new(Vec::with_capacity(4096)));
    let finished = Arc::new(AtomicBool::new(false));
    let buf1 = Arc::clone(&buf);
    let finished1 = Arc::clone(&finished);

    let spawned = std::thread::Builder::new()
        .name("btrfuzz-bg-reader".into())
        .spawn(move || {
            let mut chunk = vec![0_u8; READ_CHUNK].into_boxed_slice();
            loop {
                match f.read(&mut chunk[..]) {
                    Ok(0) => break,
                    Ok(sz) => {
                        let mut shared_buf = buf1.lock().unwrap();
                        shared_buf.extend_from_slice(&chunk[..sz]);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("background read stopped: {}", e);
                        break;
                    }
                }
            }
            finished1.store(true, Ordering::Release);
        });
    if let Err(e) = spawned {
        log::warn!("failed to spawn background reader: {}", e);
        finished.store(true, Ordering::Release);
    }

    BackgroundIoHandle::new(buf, finished)
}
