use crate::{current::DEFAULT_LAST_N, machine::RunnerOpts, session::SessionConfig};
use anyhow::Context;
use btrfuzz_vm::qemu::QemuConfig;
use std::{
    fs::canonicalize,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Debug)]
pub struct Config {
    /// Crash artifacts go to `<output>/crashes`.
    pub output: PathBuf,
    /// Directory of raw images known to crash, never run again.
    pub known_crash_dir: Option<PathBuf>,
    /// Extra console signatures, one per line.
    pub signatures: Option<PathBuf>,
    /// Keep the last `last_n` submitted images of each worker under this directory.
    pub current_dir: Option<PathBuf>,
    pub last_n: u64,
    pub job: usize,
    pub boot_retries: u32,
    pub retry_wait: Duration,

    pub runner: RunnerOpts,
    pub session: SessionConfig,
    pub qemu_config: QemuConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: PathBuf::from("./output"),
            known_crash_dir: None,
            signatures: None,
            current_dir: None,
            last_n: DEFAULT_LAST_N,
            job: 1,
            boot_retries: 3,
            retry_wait: Duration::from_secs(10),
            runner: RunnerOpts {
                runner_bin: PathBuf::from("./btrfuzz_runner"),
                use_ivshm: true,
                no_kcov: false,
                kcov_mode: "read-clear".to_string(),
            },
            session: SessionConfig::default(),
            qemu_config: QemuConfig::default(),
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if !self.runner.runner_bin.is_file() {
            anyhow::bail!("bad runner binary: {}", self.runner.runner_bin.display());
        }
        if !matches!(self.runner.kcov_mode.as_str(), "read-clear" | "read-only") {
            anyhow::bail!("bad kcov mode: {}", self.runner.kcov_mode);
        }
        if let Some(d) = self.known_crash_dir.as_ref() {
            if !d.is_dir() {
                anyhow::bail!("bad known crash dir: {}", d.display());
            }
        }
        if let Some(s) = self.signatures.as_ref() {
            if !s.is_file() {
                anyhow::bail!("bad signatures file: {}", s.display());
            }
        }
        if self.current_dir.is_some() && self.last_n == 0 {
            anyhow::bail!("last_n must be non-zero");
        }
        if self.job == 0 {
            anyhow::bail!("at least one job is required");
        }
        if self.session.exec_timeout.as_millis() == 0 || self.session.ready_timeout.as_millis() == 0
        {
            anyhow::bail!("timeouts must be non-zero");
        }
        if self.output.exists() && !self.output.is_dir() {
            anyhow::bail!("output is not a directory: {}", self.output.display());
        }
        self.qemu_config.check().context("qemu config error")?;
        Ok(())
    }

    /// Make every path absolute, the guest side commands run elsewhere.
    pub fn fixup(&mut self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.output).context("failed to create output dir")?;
        self.output = absolute(&self.output)?;
        self.runner.runner_bin = absolute(&self.runner.runner_bin)?;
        if let Some(d) = self.known_crash_dir.as_mut() {
            *d = absolute(d)?;
        }
        if let Some(d) = self.current_dir.as_mut() {
            std::fs::create_dir_all(&*d).context("failed to create current dir")?;
            *d = absolute(d)?;
        }
        if let Some(kernel_img) = self.qemu_config.kernel_img.as_mut() {
            *kernel_img = absolute_str(kernel_img)?;
        }
        self.qemu_config.disk_img = absolute_str(&self.qemu_config.disk_img)?;
        self.qemu_config.ssh_key = absolute_str(&self.qemu_config.ssh_key)?;
        Ok(())
    }
}

fn absolute(p: &Path) -> anyhow::Result<PathBuf> {
    canonicalize(p).with_context(|| format!("failed to resolve {}", p.display()))
}

fn absolute_str(p: &str) -> anyhow::Result<String> {
    let path = absolute(Path::new(p))?;
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("non utf-8 path: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_runner() {
        let mut c = Config::default();
        c.runner.runner_bin = PathBuf::from("/nonexistent/btrfuzz_runner");
        let e = c.check().unwrap_err();
        assert!(e.to_string().contains("bad runner binary"));
    }

    #[test]
    fn rejects_bad_kcov_mode() {
        let mut c = Config::default();
        c.runner.runner_bin = std::env::current_exe().unwrap();
        c.runner.kcov_mode = "trace-cmp".to_string();
        assert!(c.check().unwrap_err().to_string().contains("kcov mode"));
        c.runner.kcov_mode = "read-only".to_string();
        c.job = 0;
        assert!(c.check().unwrap_err().to_string().contains("job"));
        c.job = 1;
        c.current_dir = Some(PathBuf::from("current"));
        c.last_n = 0;
        assert!(c.check().unwrap_err().to_string().contains("last_n"));
    }
}
