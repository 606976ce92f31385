//! Replaying a saved artifact against a fresh session.
use crate::{
    classify::Signatures,
    config::Config,
    crash::CrashMeta,
    machine::{Machine, QemuMachine},
    session::{Outcome, Session},
    util::retry_with,
};
use anyhow::Context;
use serde_derive::Serialize;
use std::{fs::read, path::Path, sync::Arc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReproReport {
    pub expected: Outcome,
    pub observed: Outcome,
    pub expected_signature: Option<String>,
    pub observed_signature: Option<String>,
    pub signature_matched: bool,
    pub reproduced: bool,
}

pub fn load_artifact(artifact_dir: &Path, id: usize) -> anyhow::Result<(Vec<u8>, CrashMeta)> {
    let image_path = artifact_dir.join(format!("image{}", id));
    let image =
        read(&image_path).with_context(|| format!("failed to read {}", image_path.display()))?;
    let meta_path = artifact_dir.join(format!("meta{}", id));
    let meta = read(&meta_path).with_context(|| format!("failed to read {}", meta_path.display()))?;
    let meta: CrashMeta = serde_json::from_slice(&meta)
        .with_context(|| format!("bad meta: {}", meta_path.display()))?;
    Ok((image, meta))
}

pub fn reproduce(config: &Config, artifact_dir: &Path, id: usize) -> anyhow::Result<ReproReport> {
    let sigs = match config.signatures.as_ref() {
        Some(f) => Signatures::load(f)?,
        None => Signatures::default(),
    };
    let machine = QemuMachine::new(u64::MAX, config)?;
    reproduce_with(machine, Arc::new(sigs), config, artifact_dir, id)
}

pub fn reproduce_with<M: Machine>(
    machine: M,
    sigs: Arc<Signatures>,
    config: &Config,
    artifact_dir: &Path,
    id: usize,
) -> anyhow::Result<ReproReport> {
    let (image, meta) = load_artifact(artifact_dir, id)?;
    let mut session = Session::new(machine, sigs, config.session.clone());
    retry_with(config.boot_retries, config.retry_wait, || session.boot())
        .context("failed to boot vm")?;
    let exec = session.execute(&image)?;
    session.teardown();

    let signature_matched = match meta.signature.as_deref() {
        None => true,
        Some(expected) => {
            exec.signature
                .as_deref()
                .map(|s| s.contains(expected))
                .unwrap_or(false)
                || String::from_utf8_lossy(session.transcript()).contains(expected)
        }
    };
    let reproduced = exec.outcome == meta.outcome && signature_matched;
    log::info!(
        "repro {}/{}: expected {}, observed {}{}",
        artifact_dir.display(),
        id,
        meta.outcome,
        exec.outcome,
        if reproduced { ", reproduced" } else { "" }
    );
    Ok(ReproReport {
        expected: meta.outcome,
        observed: exec.outcome,
        expected_signature: meta.signature,
        observed_signature: exec.signature,
        signature_matched,
        reproduced,
    })
}
