//! One long-lived VM plus runner, executing images one at a time.
//!
//! Lifecycle: `Destroyed -> Booting -> Ready <-> Executing`, any failure during an
//! iteration leaves the session `Faulted` until `teardown` brings it back to
//! `Destroyed`. Every wait is bounded, a runner or kernel that stops answering turns
//! into an outcome, never into a stuck harness.
use crate::{
    classify::{ConsoleMonitor, Signatures},
    machine::{Machine, MachineError},
};
use btrfuzz_channel::{afl, ChannelError, Controller, RunStatus};
use btrfuzz_vm::qemu::CRASH_LOG_WAIT;
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Normal,
    FilesystemError,
    Panic,
    Hang,
    RunnerCrash,
}

impl Outcome {
    pub fn name(self) -> &'static str {
        match self {
            Outcome::Normal => "normal",
            Outcome::FilesystemError => "fs_error",
            Outcome::Panic => "panic",
            Outcome::Hang => "hang",
            Outcome::RunnerCrash => "runner_crash",
        }
    }

    /// The session cannot be reused after this outcome.
    pub fn is_fault(self) -> bool {
        !matches!(self, Outcome::Normal | Outcome::FilesystemError)
    }

    /// Wait status reported to AFL++.
    pub fn afl_status(self) -> i32 {
        match self {
            Outcome::Normal | Outcome::FilesystemError => afl::STATUS_OK,
            Outcome::Panic => afl::STATUS_CRASH,
            Outcome::RunnerCrash => afl::STATUS_ABORT,
            Outcome::Hang => afl::STATUS_KILLED,
        }
    }

    fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Normal => Outcome::Normal,
            RunStatus::FilesystemError | RunStatus::DecodeError => Outcome::FilesystemError,
            RunStatus::KernelBug => Outcome::Panic,
            RunStatus::ResidualState | RunStatus::Internal => Outcome::RunnerCrash,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Booting,
    Ready,
    Executing,
    Faulted,
    TearingDown,
    Destroyed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("machine: {0}")]
    Machine(#[from] MachineError),
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait for the runner's ready message after it is started.
    pub ready_timeout: Duration,
    /// Wait for one iteration.
    pub exec_timeout: Duration,
    /// Granularity of console polling while an iteration runs.
    pub poll_slice: Duration,
    /// Time a panicking guest gets to finish its report.
    pub crash_log_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(30),
            poll_slice: Duration::from_millis(100),
            crash_log_wait: CRASH_LOG_WAIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: Outcome,
    /// Reply of the runner, if it sent one.
    pub status: Option<RunStatus>,
    pub signature: Option<String>,
    pub excerpt: Option<String>,
}

/// Signature recorded for kernel bugs only seen in the guest's log buffer.
pub const KMSG_SIGNATURE: &str = "kmsg: BUG";

pub struct Session<M> {
    machine: M,
    state: SessionState,
    controller: Option<Controller>,
    monitor: ConsoleMonitor,
    conf: SessionConfig,
    boots: u64,
    execs: u64,
    last_outcome: Option<Outcome>,
}

impl<M: Machine> Session<M> {
    pub fn new(machine: M, sigs: Arc<Signatures>, conf: SessionConfig) -> Self {
        Self {
            machine,
            state: SessionState::Destroyed,
            controller: None,
            monitor: ConsoleMonitor::new(sigs),
            conf,
            boots: 0,
            execs: 0,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn boots(&self) -> u64 {
        self.boots
    }

    /// Iterations run by the current boot.
    pub fn execs(&self) -> u64 {
        self.execs
    }

    /// Console output of the current or last boot.
    pub fn transcript(&self) -> &[u8] {
        self.monitor.transcript()
    }

    /// Coverage of the last finished iteration, zero when there is none.
    pub fn coverage(&self) -> Option<&[u8]> {
        self.controller.as_ref().map(|c| c.coverage())
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Boot the guest and start the runner. On failure nothing is left running.
    pub fn boot(&mut self) -> Result<Duration, SessionError> {
        self.expect_state(SessionState::Destroyed)?;
        self.state = SessionState::Booting;
        self.monitor.clear();
        self.execs = 0;
        self.last_outcome = None;

        let now = Instant::now();
        match self.boot_inner() {
            Ok(()) => {
                self.boots += 1;
                self.state = SessionState::Ready;
                Ok(now.elapsed())
            }
            Err(e) => {
                let console = self.machine.collect_console(Duration::from_secs(0));
                self.monitor.feed(&console);
                self.controller = None;
                self.machine.kill();
                self.state = SessionState::Destroyed;
                Err(e)
            }
        }
    }

    fn boot_inner(&mut self) -> Result<(), SessionError> {
        self.machine.boot()?;
        let boot_log = self.machine.console();
        self.monitor.feed(&boot_log);
        let link = self.machine.spawn_runner()?;
        let mut controller = Controller::new(
            link.reader,
            link.writer,
            link.image_region,
            link.cover_region,
        )?;
        controller.wait_ready(self.conf.ready_timeout)?;
        self.controller = Some(controller);
        Ok(())
    }

    fn feed_console(&mut self) -> bool {
        let data = self.machine.console();
        self.monitor.feed(&data).is_some()
    }

    /// Run one image. Only a session in `Ready` executes, the outcome decides whether it
    /// stays there or becomes `Faulted`.
    pub fn execute(&mut self, image: &[u8]) -> Result<Execution, SessionError> {
        self.expect_state(SessionState::Ready)?;
        if self.controller.is_none() {
            return Err(SessionError::InvalidState {
                expected: SessionState::Ready,
                actual: SessionState::Destroyed,
            });
        }
        // output of earlier iterations must not be blamed on this one
        self.feed_console();
        self.monitor.mark();
        self.state = SessionState::Executing;
        self.execs += 1;

        let started = match self.controller.as_mut() {
            Some(c) => c.go(image),
            None => Err(ChannelError::Disconnected),
        };
        let (outcome, status) = match started {
            Ok(()) => self.wait_done(),
            Err(e) => self.channel_failure(e),
        };

        let matched = self.monitor.found().cloned();
        let outcome = if matched.is_some() {
            Outcome::Panic
        } else {
            outcome
        };
        let signature = match (&matched, outcome) {
            (Some(m), _) => Some(m.signature.clone()),
            (None, Outcome::Panic) => Some(KMSG_SIGNATURE.to_string()),
            _ => None,
        };
        self.last_outcome = Some(outcome);
        self.state = if outcome.is_fault() {
            SessionState::Faulted
        } else {
            SessionState::Ready
        };
        Ok(Execution {
            outcome,
            status,
            signature,
            excerpt: matched.map(|m| m.excerpt),
        })
    }

    fn wait_done(&mut self) -> (Outcome, Option<RunStatus>) {
        let deadline = Instant::now() + self.conf.exec_timeout;
        loop {
            let polled = match self.controller.as_mut() {
                Some(c) => c.poll_done(self.conf.poll_slice),
                None => Err(ChannelError::Disconnected),
            };
            let matched = self.feed_console();
            match polled {
                Ok(Some(status)) => return (Outcome::from_status(status), Some(status)),
                Ok(None) if matched => return (Outcome::Panic, None),
                Ok(None) if Instant::now() >= deadline => {
                    log::debug!("no reply within {:?}", self.conf.exec_timeout);
                    return (Outcome::Hang, None);
                }
                Ok(None) => continue,
                Err(e) => return self.channel_failure(e),
            }
        }
    }

    fn channel_failure(&mut self, e: ChannelError) -> (Outcome, Option<RunStatus>) {
        match e {
            ChannelError::Protocol(msg) => {
                log::warn!("runner broke protocol: {}", msg);
                self.feed_console();
                (Outcome::RunnerCrash, None)
            }
            e => {
                log::debug!("runner gone: {}", e);
                let data = if self.machine.is_alive() {
                    self.machine.console()
                } else {
                    // the guest is dying, let it finish its report
                    self.machine.collect_console(self.conf.crash_log_wait)
                };
                if self.monitor.feed(&data).is_some() {
                    (Outcome::Panic, None)
                } else {
                    (Outcome::RunnerCrash, None)
                }
            }
        }
    }

    /// Stop runner and guest, returning the console output gathered on the way down.
    pub fn teardown(&mut self) -> Vec<u8> {
        if self.state == SessionState::Destroyed {
            return Vec::new();
        }
        self.state = SessionState::TearingDown;
        self.controller = None;
        // only a panicking guest is still writing something worth waiting for
        let grace = if self.last_outcome == Some(Outcome::Panic) {
            self.conf.crash_log_wait
        } else {
            Duration::from_secs(0)
        };
        let mut data = self.machine.console();
        data.extend(self.machine.collect_console(grace));
        self.monitor.feed(&data);
        self.machine.kill();
        self.state = SessionState::Destroyed;
        data
    }
}
