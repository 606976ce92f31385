//! Kernel failure signatures and the console monitor matching them.
//!
//! Signatures are plain substrings, compiled into one `RegexSet` of escaped
//! patterns. The monitor scans console output incrementally and keeps enough of the
//! previous tail around that a marker split across two reads is still found.
use anyhow::Context;
use regex::RegexSet;
use std::{fs::read_to_string, path::Path};

pub const DEFAULT_SIGNATURES: &[&str] = &[
    "Kernel panic",
    "kernel BUG at",
    "BUG:",
    "Oops:",
    "general protection fault",
    "Unable to handle kernel",
    "KASAN:",
    "UBSAN:",
    "WARNING:",
    "assertion failed",
    "BTRFS critical",
    "BTRFS: Transaction aborted",
    "INFO: task hung",
    "rcu_sched detected stall",
    "kernel stack overflow",
    "divide error:",
    "invalid opcode:",
    "double fault:",
    "Call Trace:",
];

/// Console bytes kept per session.
pub const MAX_TRANSCRIPT: usize = 4 << 20;
/// Lines of console kept after the matching one.
const EXCERPT_LINES: usize = 8;
const MAX_EXCERPT: usize = 4096;

pub struct Signatures {
    markers: Vec<String>,
    set: RegexSet,
    longest: usize,
}

impl Default for Signatures {
    fn default() -> Self {
        let markers = DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect();
        Self::new(markers).unwrap_or_else(|e| unreachable!("escaped markers: {}", e))
    }
}

impl Signatures {
    pub fn new(markers: Vec<String>) -> Result<Self, regex::Error> {
        let set = RegexSet::new(markers.iter().map(|m| regex::escape(m)))?;
        let longest = markers.iter().map(|m| m.len()).max().unwrap_or(0);
        Ok(Self {
            markers,
            set,
            longest,
        })
    }

    /// Defaults plus one marker per non-empty line of `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let extra = read_to_string(path)
            .with_context(|| format!("failed to read signatures: {}", path.display()))?;
        let mut markers: Vec<String> = DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect();
        for l in extra.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !markers.iter().any(|m| m == l) {
                markers.push(l.to_string());
            }
        }
        Ok(Self::new(markers)?)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Earliest marker occurrence in `text`: marker and byte offset.
    pub fn find<'a>(&'a self, text: &str) -> Option<(&'a str, usize)> {
        self.set
            .matches(text)
            .into_iter()
            .filter_map(|i| {
                let m = &self.markers[i];
                text.find(m.as_str()).map(|pos| (m.as_str(), pos))
            })
            .min_by_key(|(_, pos)| *pos)
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.set.is_match(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub signature: String,
    pub excerpt: String,
}

pub struct ConsoleMonitor {
    sigs: std::sync::Arc<Signatures>,
    transcript: Vec<u8>,
    /// Transcript bytes before this offset were scanned already.
    scanned: usize,
    /// Matching never looks before this offset.
    floor: usize,
    found: Option<Match>,
}

impl ConsoleMonitor {
    pub fn new(sigs: std::sync::Arc<Signatures>) -> Self {
        Self {
            sigs,
            transcript: Vec::new(),
            scanned: 0,
            floor: 0,
            found: None,
        }
    }

    /// Forget earlier matches, only output fed from now on counts.
    pub fn mark(&mut self) {
        self.found = None;
        self.scanned = self.transcript.len();
        self.floor = self.transcript.len();
    }

    /// Drop the transcript, e.g. before a fresh boot.
    pub fn clear(&mut self) {
        self.transcript.clear();
        self.scanned = 0;
        self.floor = 0;
        self.found = None;
    }

    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    pub fn found(&self) -> Option<&Match> {
        self.found.as_ref()
    }

    /// Append console output and scan it, returning the first match since the last `mark`.
    pub fn feed(&mut self, data: &[u8]) -> Option<&Match> {
        if !data.is_empty() {
            self.transcript.extend_from_slice(data);
            self.trim();
            if self.found.is_none() {
                self.scan();
            }
        }
        self.found.as_ref()
    }

    fn trim(&mut self) {
        if self.transcript.len() <= MAX_TRANSCRIPT {
            return;
        }
        let excess = self.transcript.len() - MAX_TRANSCRIPT;
        self.transcript.drain(..excess);
        self.scanned = self.scanned.saturating_sub(excess);
        self.floor = self.floor.saturating_sub(excess);
    }

    fn scan(&mut self) {
        let overlap = self.sigs.longest.saturating_sub(1);
        let mut from = std::cmp::max(self.scanned.saturating_sub(overlap), self.floor);
        // start at a line boundary so the excerpt holds the whole line
        let back = std::cmp::max(from.saturating_sub(MAX_EXCERPT), self.floor);
        if let Some(nl) = self.transcript[back..from]
            .iter()
            .rposition(|&b| b == b'\n')
        {
            from = back + nl + 1;
        } else if from - back < MAX_EXCERPT {
            from = back;
        }
        self.scanned = self.transcript.len();

        let window = String::from_utf8_lossy(&self.transcript[from..]);
        if let Some((sig, pos)) = self.sigs.find(&window) {
            let start = window[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
            let mut excerpt: String = window[start..]
                .lines()
                .take(EXCERPT_LINES)
                .collect::<Vec<_>>()
                .join("\n");
            if excerpt.len() > MAX_EXCERPT {
                let mut end = MAX_EXCERPT;
                while !excerpt.is_char_boundary(end) {
                    end -= 1;
                }
                excerpt.truncate(end);
            }
            self.found = Some(Match {
                signature: sig.to_string(),
                excerpt,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn monitor() -> ConsoleMonitor {
        ConsoleMonitor::new(Arc::new(Signatures::default()))
    }

    #[test]
    fn earliest_marker_wins() {
        let sigs = Signatures::default();
        let text = "[ 1.0] BTRFS info\n[ 2.0] BUG: unable to handle page fault\n[ 2.1] Call Trace:\n";
        let (sig, pos) = sigs.find(text).unwrap();
        assert_eq!(sig, "BUG:");
        assert_eq!(&text[pos..pos + 4], "BUG:");
        assert!(sigs.find("BTRFS info (device loop0): disk space caching is enabled").is_none());
        // markers are literal
        assert!(!sigs.is_match("kernel BUG xt"));
    }

    #[test]
    fn split_marker() {
        let mut m = monitor();
        assert!(m.feed(b"[ 5.1] loop0: detected capacity change\n[ 5.2] Kernel pa").is_none());
        let hit = m.feed(b"nic - not syncing: Fatal exception\n").unwrap().clone();
        assert_eq!(hit.signature, "Kernel panic");
        assert_eq!(hit.excerpt, "[ 5.2] Kernel panic - not syncing: Fatal exception");
    }

    #[test]
    fn mark_ignores_earlier_output() {
        let mut m = monitor();
        assert!(m.feed(b"WARNING: boot time warning\n").is_some());
        m.mark();
        assert!(m.found().is_none());
        assert!(m.feed(b"BTRFS info: mounted\n").is_none());
        let hit = m.feed(b"BTRFS critical (device loop0): corrupt leaf\n").unwrap();
        assert_eq!(hit.signature, "BTRFS critical");
        // the first match sticks
        m.feed(b"Kernel panic - not syncing\n");
        assert_eq!(m.found().unwrap().signature, "BTRFS critical");
        assert!(m.transcript().starts_with(b"WARNING: boot"));
    }

    #[test]
    fn excerpt_is_bounded() {
        let mut m = monitor();
        let mut out = b"general protection fault: 0000\n".to_vec();
        for i in 0..32 {
            out.extend_from_slice(format!("frame {}\n", i).as_bytes());
        }
        let hit = m.feed(&out).unwrap();
        assert_eq!(hit.excerpt.lines().count(), EXCERPT_LINES);
        assert!(hit.excerpt.starts_with("general protection fault"));
    }

    #[test]
    fn transcript_is_bounded() {
        let mut m = monitor();
        let chunk = vec![b'.'; 1 << 20];
        for _ in 0..6 {
            m.feed(&chunk);
        }
        assert_eq!(m.transcript().len(), MAX_TRANSCRIPT);
        assert!(m.feed(b"\nOops: 0002 [#1] SMP\n").is_some());
    }

    #[test]
    fn extra_signatures() {
        let dir = std::env::temp_dir().join(format!("btrfuzz-sigs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let f = dir.join("sigs");
        std::fs::write(&f, "btrfs_panic\n\n  BUG:\nrefcount_t: underflow\n").unwrap();
        let sigs = Signatures::load(&f).unwrap();
        assert_eq!(sigs.len(), DEFAULT_SIGNATURES.len() + 2);
        assert!(sigs.is_match("refcount_t: underflow; use-after-free."));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
