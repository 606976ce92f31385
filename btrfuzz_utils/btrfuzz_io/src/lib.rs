use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

pub mod thread;

/// Output collected by a background reader thread.
#[derive(Debug, Clone)]
pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

impl BackgroundIoHandle {
    fn new(buf: Arc<Mutex<Vec<u8>>>, finished: Arc<AtomicBool>) -> Self {
        Self { buf, finished }
    }

    /// Take everything read since the last call.
    pub fn current_data(&self) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        buf.split_off(0)
    }

    pub fn clear_current(&self) {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
    }

    /// Reader hit EOF or an error.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait at most `timeout` for EOF and return the rest of the data.
    pub fn wait_finish(self, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() && Instant::now() < deadline {
            sleep(Duration::from_millis(20));
        }
        if !self.is_finished() {
            log::debug!("background reader still running after {:?}", timeout);
        }
        self.current_data()
    }
}
