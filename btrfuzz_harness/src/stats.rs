use crate::{session::Outcome, util::stop_soon};
use std::thread::sleep;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

#[derive(Debug, Default)]
pub struct Stats {
    exec_total: AtomicU64,
    normal: AtomicU64,
    fs_error: AtomicU64,
    decode_error: AtomicU64,
    panic: AtomicU64,
    hang: AtomicU64,
    runner_crash: AtomicU64,
    known_hits: AtomicU64,
    unique_crash: AtomicU64,
    vm_restarts: AtomicU64,
    max_cov: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        self.exec_total.fetch_add(1, Ordering::Relaxed);
        let c = match outcome {
            Outcome::Normal => &self.normal,
            Outcome::FilesystemError => &self.fs_error,
            Outcome::Panic => &self.panic,
            Outcome::Hang => &self.hang,
            Outcome::RunnerCrash => &self.runner_crash,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    /// Rejected before reaching a VM, counted as a filesystem error.
    pub fn inc_decode_error(&self) {
        self.decode_error.fetch_add(1, Ordering::Relaxed);
        self.record(Outcome::FilesystemError);
    }

    pub fn inc_known_hits(&self) {
        self.known_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vm_restarts(&self) {
        self.vm_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_unique_crash(&self, n: u64) {
        self.unique_crash.store(n, Ordering::Relaxed);
    }

    /// Coverage is tracked per worker, the largest one is reported.
    pub fn update_max_cov(&self, n: u64) {
        self.max_cov.fetch_max(n, Ordering::Relaxed);
    }

    pub fn exec_total(&self) -> u64 {
        self.exec_total.load(Ordering::Relaxed)
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        let c = match outcome {
            Outcome::Normal => &self.normal,
            Outcome::FilesystemError => &self.fs_error,
            Outcome::Panic => &self.panic,
            Outcome::Hang => &self.hang,
            Outcome::RunnerCrash => &self.runner_crash,
        };
        c.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "exec: {}, ok/fs-err/decode {}/{}/{}, panic/hang/runner {}/{}/{}, known: {}, uniq crashes: {}, vm restarts: {}, max cover: {}",
            self.exec_total(),
            self.normal.load(Ordering::Relaxed),
            self.fs_error.load(Ordering::Relaxed),
            self.decode_error.load(Ordering::Relaxed),
            self.panic.load(Ordering::Relaxed),
            self.hang.load(Ordering::Relaxed),
            self.runner_crash.load(Ordering::Relaxed),
            self.known_hits.load(Ordering::Relaxed),
            self.unique_crash.load(Ordering::Relaxed),
            self.vm_restarts.load(Ordering::Relaxed),
            self.max_cov.load(Ordering::Relaxed),
        )
    }

    pub fn report(&self, duration: Duration) {
        while !stop_soon() {
            sleep(duration);
            log::info!("{}", self.summary());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters() {
        let s = Stats::new();
        s.record(Outcome::Normal);
        s.record(Outcome::Hang);
        s.inc_decode_error();
        s.update_max_cov(10);
        s.update_max_cov(4);
        assert_eq!(s.exec_total(), 3);
        assert_eq!(s.count(Outcome::FilesystemError), 1);
        assert_eq!(s.count(Outcome::Panic), 0);
        assert!(s.summary().contains("max cover: 10"));
    }
}
