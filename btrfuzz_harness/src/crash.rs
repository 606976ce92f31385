use crate::{session::Outcome, util::digest, HashMap};
use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use std::{
    fs::{create_dir_all, read, read_dir, write},
    hash::{Hash, Hasher},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

/// Artifacts kept per outcome and signature.
pub const MAX_PER_SIGNATURE: usize = 32;
/// Signature directory of artifacts without a console match.
pub const UNKNOWN_SIGNATURE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashMeta {
    pub outcome: Outcome,
    pub signature: Option<String>,
    pub excerpt: Option<String>,
    pub sha1: String,
    /// Seconds since the epoch.
    pub timestamp: u64,
    /// Digests of the images run before this one in the same boot, oldest first.
    pub history: Vec<String>,
}

impl CrashMeta {
    pub fn new(
        outcome: Outcome,
        signature: Option<String>,
        excerpt: Option<String>,
        sha1: String,
        history: Vec<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            outcome,
            signature,
            excerpt,
            sha1,
            timestamp,
            history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownCrash {
    pub outcome: Outcome,
    pub signature: Option<String>,
}

#[derive(Default)]
pub struct CrashManager {
    out_dir: PathBuf,
    counts: Mutex<HashMap<String, usize>>,
    known: RwLock<HashMap<String, KnownCrash>>,
}

impl CrashManager {
    pub fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            ..Self::default()
        }
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.out_dir.join("crashes")
    }

    pub fn known(&self, sha1: &str) -> Option<KnownCrash> {
        let known = self.known.read().unwrap();
        known.get(sha1).cloned()
    }

    pub fn known_count(&self) -> usize {
        self.known.read().unwrap().len()
    }

    /// Signatures with at least one artifact.
    pub fn unique_crashes(&self) -> u64 {
        self.counts.lock().unwrap().len() as u64
    }

    /// Only kernel panics are answered from the table, hangs and runner crashes run again.
    fn remember(&self, sha1: String, crash: KnownCrash) {
        if crash.outcome != Outcome::Panic {
            return;
        }
        let mut known = self.known.write().unwrap();
        known.entry(sha1).or_insert(crash);
    }

    /// Pick up the artifacts of an earlier run in our output directory.
    pub fn load_previous(&self) -> anyhow::Result<usize> {
        let crashes = self.crashes_dir();
        let dirs = match read_dir(&crashes) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("failed to read crashes dir"),
        };
        let mut n = 0;
        for dir in dirs {
            let dir = dir?.path();
            if !dir.is_dir() {
                continue;
            }
            let mut metas = 0;
            for f in read_dir(&dir)? {
                let f = f?.path();
                let is_meta = f
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("meta"))
                    .unwrap_or(false);
                if !is_meta {
                    continue;
                }
                let meta = read(&f).with_context(|| format!("failed to read {}", f.display()))?;
                match serde_json::from_slice::<CrashMeta>(&meta) {
                    Ok(meta) => {
                        self.remember(
                            meta.sha1,
                            KnownCrash {
                                outcome: meta.outcome,
                                signature: meta.signature,
                            },
                        );
                        metas += 1;
                        n += 1;
                    }
                    Err(e) => log::warn!("skipping bad meta {}: {}", f.display(), e),
                }
            }
            if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
                let mut counts = self.counts.lock().unwrap();
                counts.insert(name.to_string(), metas);
            }
        }
        Ok(n)
    }

    /// Treat every file of `dir` as an image known to panic the kernel.
    pub fn load_known_images(&self, dir: &Path) -> anyhow::Result<usize> {
        let mut n = 0;
        for f in read_dir(dir).context("failed to read known crash dir")? {
            let f = f?.path();
            if !f.is_file() {
                continue;
            }
            let image = read(&f).with_context(|| format!("failed to read {}", f.display()))?;
            self.remember(
                digest(&image),
                KnownCrash {
                    outcome: Outcome::Panic,
                    signature: None,
                },
            );
            n += 1;
        }
        Ok(n)
    }

    /// Write `image<N>`, `meta<N>` and `console<N>`. Returns the artifact directory and
    /// `N`, or `None` once the signature has its share of artifacts.
    pub fn save(
        &self,
        image: &[u8],
        meta: &CrashMeta,
        console: &[u8],
    ) -> anyhow::Result<Option<(PathBuf, usize)>> {
        self.remember(
            meta.sha1.clone(),
            KnownCrash {
                outcome: meta.outcome,
                signature: meta.signature.clone(),
            },
        );

        let sig = meta.signature.as_deref().unwrap_or(UNKNOWN_SIGNATURE);
        let name = format!("{}-{}", meta.outcome.name(), Self::dir_name(sig));
        let id = {
            let mut counts = self.counts.lock().unwrap();
            let entry = counts.entry(name.clone()).or_insert(0);
            if *entry >= MAX_PER_SIGNATURE {
                return Ok(None);
            }
            *entry += 1;
            *entry
        };

        let out_dir = self.crashes_dir().join(&name);
        if let Err(e) = create_dir_all(&out_dir) {
            if e.kind() != ErrorKind::AlreadyExists {
                return Err(e).context("failed to create crash dir");
            }
        }
        write(out_dir.join(format!("image{}", id)), image).context("failed to write image")?;
        let meta = serde_json::to_vec_pretty(meta).context("failed to encode meta")?;
        write(out_dir.join(format!("meta{}", id)), meta).context("failed to write meta")?;
        write(out_dir.join(format!("console{}", id)), console)
            .context("failed to write console")?;
        Ok(Some((out_dir, id)))
    }

    pub fn dir_name(title: &str) -> String {
        let mut dir_name = title.replace('/', "~");
        if dir_name.len() >= 255 {
            let mut hasher = ahash::AHasher::default();
            dir_name.hash(&mut hasher);
            let hash = hasher.finish();
            dir_name = format!("{:X}", hash);
        }
        dir_name
    }
}
