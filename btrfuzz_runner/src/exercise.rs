//! Fixed workload run against the mounted image.
//!
//! Every step is bounded and visits entries in sorted order, so two runs over the
//! same tree issue the same syscalls.

use nix::{sys::statfs::statfs, unistd::sync};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

/// Entries visited by the directory walk.
pub const MAX_ENTRIES: usize = 256;
pub const MAX_DEPTH: usize = 8;
/// Regular files read back after the walk.
pub const MAX_READ_FILES: usize = 16;
pub const MAX_READ_LEN: u64 = 64 << 10;

const SCRATCH_FILE: &str = ".btrfuzz-file";
const SCRATCH_DIR: &str = ".btrfuzz-dir";
const SCRATCH_LINK: &str = ".btrfuzz-symlink";
const SCRATCH_HARDLINK: &str = ".btrfuzz-hardlink";
const PAYLOAD: &[u8] = b"btrfuzz exercise payload\n";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub executed: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    fn step<T>(&mut self, name: &str, r: io::Result<T>) -> Option<T> {
        self.executed += 1;
        match r {
            Ok(v) => Some(v),
            Err(e) => {
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(format!("{}: {}", name, e));
                }
                None
            }
        }
    }
}

pub fn exercise(root: &Path) -> Report {
    let mut report = Report::default();

    report.step(
        "statfs",
        statfs(root).map_err(|e| io::Error::from_raw_os_error(e as i32)),
    );

    let mut files = Vec::new();
    let mut budget = MAX_ENTRIES;
    walk(root, 0, &mut budget, &mut files, &mut report);

    for f in files.iter().take(MAX_READ_FILES) {
        report.step("read", read_bounded(f));
    }

    mutate_tree(root, &mut report);
    sync();
    report.executed += 1;
    report
}

fn walk(
    dir: &Path,
    depth: usize,
    budget: &mut usize,
    files: &mut Vec<PathBuf>,
    report: &mut Report,
) {
    if depth > MAX_DEPTH || *budget == 0 {
        return;
    }
    let entries = match report.step("readdir", sorted_entries(dir)) {
        Some(entries) => entries,
        None => return,
    };

    for path in entries {
        if *budget == 0 {
            return;
        }
        *budget -= 1;
        let meta = match report.step("stat", fs::symlink_metadata(&path)) {
            Some(meta) => meta,
            None => continue,
        };
        let ty = meta.file_type();
        if ty.is_symlink() {
            report.step("readlink", fs::read_link(&path));
        } else if ty.is_dir() {
            walk(&path, depth + 1, budget, files, report);
        } else if ty.is_file() {
            files.push(path);
        }
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn read_bounded(path: &Path) -> io::Result<usize> {
    let mut buf = Vec::new();
    File::open(path)?.take(MAX_READ_LEN).read_to_end(&mut buf)
}

fn mutate_tree(root: &Path, report: &mut Report) {
    let file = root.join(SCRATCH_FILE);
    let dir = root.join(SCRATCH_DIR);
    let moved = dir.join(SCRATCH_FILE);
    let sym = root.join(SCRATCH_LINK);
    let hard = dir.join(SCRATCH_HARDLINK);

    let created = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&file);
    if let Some(mut f) = report.step("create", created) {
        report.step("write", f.write_all(PAYLOAD));
        report.step("fsync", f.sync_all());
        report.step("truncate", f.set_len(1));
    }
    report.step("mkdir", fs::create_dir(&dir));
    report.step("rename", fs::rename(&file, &moved));
    report.step("symlink", symlink(&moved, &sym));
    report.step("link", fs::hard_link(&moved, &hard));
    report.step("unlink", fs::remove_file(&sym));
    report.step("unlink", fs::remove_file(&hard));
    report.step("unlink", fs::remove_file(&moved));
    report.step("rmdir", fs::remove_dir(&dir));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn scratch_dir() -> PathBuf {
        let mut rng = SmallRng::from_entropy();
        let p = std::env::temp_dir().join(format!("btrfuzz-ex-{:016x}", rng.gen::<u64>()));
        fs::create_dir_all(&p).unwrap();
        p
    }

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/one"), b"1").unwrap();
        fs::write(root.join("a/b/two"), vec![7; 1 << 17]).unwrap();
        fs::write(root.join("z"), b"").unwrap();
        symlink("a/one", root.join("l")).unwrap();
    }

    #[test]
    fn clean_and_deterministic() {
        let root = scratch_dir();
        populate(&root);
        let r1 = exercise(&root);
        let r2 = exercise(&root);
        assert!(r1.is_clean(), "{:?}", r1.first_error);
        assert_eq!(r1, r2);
        assert!(!root.join(SCRATCH_FILE).exists());
        assert!(!root.join(SCRATCH_DIR).exists());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_root_fails() {
        let root = scratch_dir().join("missing");
        let r = exercise(&root);
        assert!(!r.is_clean());
        assert!(r.first_error.unwrap().starts_with("statfs"));
    }

    #[test]
    fn walk_is_bounded() {
        let root = scratch_dir();
        for i in 0..(MAX_ENTRIES + 10) {
            fs::write(root.join(format!("f{:04}", i)), b"x").unwrap();
        }
        let mut budget = MAX_ENTRIES;
        let mut files = Vec::new();
        let mut report = Report::default();
        walk(&root, 0, &mut budget, &mut files, &mut report);
        assert_eq!(files.len(), MAX_ENTRIES);
        assert_eq!(files[0], root.join("f0000"));
        fs::remove_dir_all(&root).unwrap();
    }
}
