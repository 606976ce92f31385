//! The `submit(image) -> (coverage, outcome)` front of one session.
use crate::{
    classify::Signatures,
    crash::{CrashManager, CrashMeta},
    current::CurrentInputs,
    feedback::Feedback,
    machine::Machine,
    session::{Outcome, Session, SessionConfig, SessionState},
    stats::Stats,
    util::{digest, retry_with},
};
use anyhow::Context;
use btrfuzz_channel::MAP_SIZE;
use btrfuzz_core::image;
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// Digests of recent images kept for crash metadata.
pub const HISTORY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub outcome: Outcome,
    pub signature: Option<String>,
    /// Edges this worker had never seen before.
    pub new_edges: usize,
    /// Answered from the known crash table without running.
    pub known: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub boot_retries: u32,
    pub retry_wait: Duration,
    pub session: SessionConfig,
}

pub struct Worker<M> {
    id: u64,
    session: Session<M>,
    conf: WorkerConfig,
    crash: Arc<CrashManager>,
    stats: Arc<Stats>,
    feedback: Feedback,
    history: VecDeque<String>,
    current: Option<CurrentInputs>,
    cover: Box<[u8]>,
}

impl<M: Machine> Worker<M> {
    pub fn new(
        id: u64,
        machine: M,
        sigs: Arc<Signatures>,
        conf: WorkerConfig,
        crash: Arc<CrashManager>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            id,
            session: Session::new(machine, sigs, conf.session.clone()),
            conf,
            crash,
            stats,
            feedback: Feedback::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            current: None,
            cover: vec![0; MAP_SIZE].into_boxed_slice(),
        }
    }

    /// Write each image to a rotating slot of `current` before it runs.
    pub fn with_current(mut self, current: CurrentInputs) -> Self {
        self.current = Some(current);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Coverage of the last submission, zero unless it ran to completion.
    pub fn coverage(&self) -> &[u8] {
        &self.cover
    }

    pub fn session(&self) -> &Session<M> {
        &self.session
    }

    pub fn submit(&mut self, image: &[u8]) -> anyhow::Result<Submission> {
        self.cover.iter_mut().for_each(|c| *c = 0);

        if let Err(e) = image::check(image) {
            worker_debug!("rejected: {}", e);
            self.stats.inc_decode_error();
            return Ok(Submission {
                outcome: Outcome::FilesystemError,
                signature: None,
                new_edges: 0,
                known: false,
            });
        }

        let sha1 = digest(image);
        if let Some(known) = self.crash.known(&sha1) {
            worker_debug!("known crash {}: {}", sha1, known.outcome);
            self.stats.inc_known_hits();
            return Ok(Submission {
                outcome: known.outcome,
                signature: known.signature,
                new_edges: 0,
                known: true,
            });
        }

        self.ensure_ready()?;

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        let history: Vec<String> = self.history.iter().cloned().collect();
        self.history.push_back(sha1.clone());
        if let Some(current) = self.current.as_mut() {
            if let Err(e) = current.save(image) {
                worker_warn!("failed to keep current input: {}", e);
            }
        }

        let exec = self
            .session
            .execute(image)
            .context("session refused to execute")?;

        if let Some(cover) = self.session.coverage() {
            if matches!(exec.outcome, Outcome::Normal | Outcome::FilesystemError) {
                self.cover.copy_from_slice(cover);
            }
        }
        let new_edges = self.feedback.check_max_cov(&self.cover);
        self.stats.record(exec.outcome);
        self.stats.update_max_cov(self.feedback.max_cov_len() as u64);

        if exec.outcome.is_fault() {
            worker_warn!(
                "{} ({}), signature: {}",
                exec.outcome,
                sha1,
                exec.signature.as_deref().unwrap_or("-")
            );
            self.session.teardown();
            self.history.clear();
            let meta = CrashMeta::new(
                exec.outcome,
                exec.signature.clone(),
                exec.excerpt.clone(),
                sha1,
                history,
            );
            match self.crash.save(image, &meta, self.session.transcript()) {
                Ok(Some((dir, id))) => worker_info!("artifact {} saved to {}", id, dir.display()),
                Ok(None) => worker_debug!("artifact dropped, signature is full"),
                Err(e) => worker_warn!("failed to save artifact: {:?}", e),
            }
            self.stats.set_unique_crash(self.crash.unique_crashes());
        }

        Ok(Submission {
            outcome: exec.outcome,
            signature: exec.signature,
            new_edges,
            known: false,
        })
    }

    fn ensure_ready(&mut self) -> anyhow::Result<()> {
        match self.session.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Destroyed => (),
            _ => {
                self.session.teardown();
            }
        }
        let first = self.session.boots() == 0;
        let session = &mut self.session;
        let boot_time = retry_with(self.conf.boot_retries, self.conf.retry_wait, || {
            session.boot().map_err(|e| {
                worker_warn!("failed to boot: {}", e);
                e
            })
        })
        .context("failed to boot vm")?;
        if !first {
            self.stats.inc_vm_restarts();
        }
        worker_info!("vm booted ({:?})", boot_time);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.session.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::stub::{self, Action, StubMachine};
    use btrfuzz_channel::RunStatus;
    use btrfuzz_core::synth;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::{fs::read_dir, path::PathBuf, sync::atomic::Ordering};

    fn out_dir() -> PathBuf {
        let mut rng = SmallRng::from_entropy();
        std::env::temp_dir().join(format!("btrfuzz-worker-{:x}", rng.gen::<u64>()))
    }

    fn conf(retries: u32) -> WorkerConfig {
        WorkerConfig {
            boot_retries: retries,
            retry_wait: Duration::from_millis(1),
            session: SessionConfig {
                ready_timeout: Duration::from_secs(5),
                exec_timeout: Duration::from_millis(300),
                poll_slice: Duration::from_millis(20),
                crash_log_wait: Duration::from_millis(50),
            },
        }
    }

    fn worker(m: StubMachine, out: &PathBuf) -> Worker<StubMachine> {
        Worker::new(
            0,
            m,
            Arc::new(Signatures::default()),
            conf(2),
            Arc::new(CrashManager::new(out.clone())),
            Arc::new(Stats::new()),
        )
    }

    #[test]
    fn undecodable_never_boots() {
        let out = out_dir();
        let m = StubMachine::mounting();
        let boots = m.counters.boots.clone();
        let mut w = worker(m, &out);
        let s = w.submit(b"BFZI\x07\x00\x00\x00garbage").unwrap();
        assert_eq!(s.outcome, Outcome::FilesystemError);
        let s = w.submit(&[0; 16]).unwrap();
        assert_eq!(s.outcome, Outcome::FilesystemError);
        assert!(w.coverage().iter().all(|&c| c == 0));
        assert_eq!(boots.load(Ordering::SeqCst), 0);
        assert!(!out.exists());
    }

    #[test]
    fn deterministic_coverage() {
        let out = out_dir();
        let mut w = worker(StubMachine::mounting(), &out);
        let img = synth::image();
        let first = w.submit(&img).unwrap();
        assert_eq!(first.outcome, Outcome::Normal);
        assert!(first.new_edges > 0);
        let cover = w.coverage().to_vec();
        let again = w.submit(&img).unwrap();
        assert_eq!(again.outcome, Outcome::Normal);
        assert_eq!(again.new_edges, 0);
        assert_eq!(w.coverage(), &cover[..]);
        assert_eq!(w.session().boots(), 1);
    }

    #[test]
    fn panic_artifact_and_known_crash() {
        let out = out_dir();
        let m = StubMachine::new(Arc::new(stub::panicking));
        let boots = m.counters.boots.clone();
        let mut w = worker(m, &out);
        w.submit(&synth::image()).unwrap();
        let mut img = synth::image();
        img[0] = 0xAA;
        let s = w.submit(&img).unwrap();
        assert_eq!(s.outcome, Outcome::Panic);
        assert_eq!(s.signature.as_deref(), Some("BUG:"));
        assert_eq!(w.session().state(), SessionState::Destroyed);

        let dir = out.join("crashes").join("panic-BUG:");
        let meta: CrashMeta =
            serde_json::from_slice(&std::fs::read(dir.join("meta1")).unwrap()).unwrap();
        assert_eq!(meta.sha1, digest(&img));
        assert_eq!(meta.history, vec![digest(&synth::image())]);
        assert!(meta.excerpt.unwrap().contains("NULL pointer"));
        assert_eq!(std::fs::read(dir.join("image1")).unwrap(), img);
        let console = std::fs::read(dir.join("console1")).unwrap();
        assert!(String::from_utf8_lossy(&console).contains("btrfs_root_node"));

        // second time it is answered from the table
        let s = w.submit(&img).unwrap();
        assert!(s.known);
        assert_eq!(s.outcome, Outcome::Panic);
        assert_eq!(boots.load(Ordering::SeqCst), 1);

        // the next real run boots a fresh vm
        assert_eq!(w.submit(&synth::image()).unwrap().outcome, Outcome::Normal);
        assert_eq!(boots.load(Ordering::SeqCst), 2);
        std::fs::remove_dir_all(&out).unwrap();
    }

    #[test]
    fn signatures_never_normal() {
        let out = out_dir();
        let m = StubMachine::new(Arc::new(|_: &[u8]| {
            Action::Print(
                "[ 12.0] BTRFS critical (device loop0): corrupt leaf: root=5 block=4194304\n",
                RunStatus::Normal,
            )
        }));
        let mut w = worker(m, &out);
        let s = w.submit(&synth::image()).unwrap();
        assert_eq!(s.outcome, Outcome::Panic);
        assert!(w.coverage().iter().all(|&c| c == 0));
        let dirs: Vec<_> = read_dir(out.join("crashes")).unwrap().collect();
        assert_eq!(dirs.len(), 1);
        std::fs::remove_dir_all(&out).unwrap();
    }

    #[test]
    fn hang_is_recorded() {
        let out = out_dir();
        let m = StubMachine::new(Arc::new(|_: &[u8]| Action::Stall));
        let mut w = worker(m, &out);
        let s = w.submit(&synth::image()).unwrap();
        assert_eq!(s.outcome, Outcome::Hang);
        assert!(out
            .join("crashes")
            .join("hang-unknown")
            .join("image1")
            .is_file());
        std::fs::remove_dir_all(&out).unwrap();
    }

    #[test]
    fn hangs_run_again() {
        let out = out_dir();
        let m = StubMachine::new(Arc::new(|_: &[u8]| Action::Stall));
        let boots = m.counters.boots.clone();
        let mut w = worker(m, &out);
        let img = synth::image();
        assert_eq!(w.submit(&img).unwrap().outcome, Outcome::Hang);
        let again = w.submit(&img).unwrap();
        assert!(!again.known);
        assert_eq!(again.outcome, Outcome::Hang);
        assert_eq!(boots.load(Ordering::SeqCst), 2);
        assert!(out
            .join("crashes")
            .join("hang-unknown")
            .join("image2")
            .is_file());
        std::fs::remove_dir_all(&out).unwrap();
    }

    #[test]
    fn recent_inputs_on_disk() {
        let out = out_dir();
        let current = CurrentInputs::new(out.join("current"), 2).unwrap();
        let mut w = worker(StubMachine::mounting(), &out).with_current(current);
        let mut imgs = Vec::new();
        for i in 1..4_u8 {
            let mut img = synth::image();
            img[0] = i;
            w.submit(&img).unwrap();
            imgs.push(img);
        }
        // undecodable images never reach a slot
        w.submit(&[0; 16]).unwrap();
        let slot = |n: &str| std::fs::read(out.join("current").join(n)).unwrap();
        assert_eq!(slot("0"), imgs[2]);
        assert_eq!(slot("1"), imgs[1]);
        std::fs::remove_dir_all(&out).unwrap();
    }

    #[test]
    fn fs_errors_leave_no_artifact() {
        let out = out_dir();
        let mut w = worker(StubMachine::mounting(), &out);
        let s = w.submit(&vec![0; synth::IMAGE_SIZE]).unwrap();
        assert_eq!(s.outcome, Outcome::FilesystemError);
        assert_eq!(w.session().state(), SessionState::Ready);
        assert!(!out.exists());
    }

    #[test]
    fn boot_retries() {
        let out = out_dir();
        let m = StubMachine::mounting().failing_boots(2);
        let mut w = worker(m, &out);
        assert_eq!(w.submit(&synth::image()).unwrap().outcome, Outcome::Normal);

        let m = StubMachine::mounting().failing_boots(3);
        let mut w = worker(m, &out);
        assert!(w.submit(&synth::image()).is_err());
    }
}
