use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

const COOLDOWN_HOURS: i64 = 1;
const RECURRENCE_THRESHOLD: u32 = 2;
const SENTINEL_COOLDOWN_DAYS: i64 = 7;

static ISO_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}[.\d]*Z?").unwrap()
});
static UNIX_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{10,13}(\.\d+)?\b").unwrap());
static PID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bPID[:\s]*\d+").unwrap());
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bline\s*\d+").unwrap());
static PORT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\d{2,5}\b").unwrap());
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}").unwrap()
});
static HEX_LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b0x[a-f0-9]+\b").unwrap());
static HEX_HASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b[a-f0-9]{12,}\b").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalizes an error line by stripping timestamps, PIDs, ports, UUIDs,
/// and hex blobs, then MD5-hashes the result so semantically identical
/// errors collide regardless of their volatile metadata.
pub fn fingerprint(error_line: &str) -> String {
    let mut normalized = error_line.trim().to_string();
    normalized = ISO_TIMESTAMP_RE.replace_all(&normalized, "").into_owned();
    normalized = UNIX_TIMESTAMP_RE.replace_all(&normalized, "").into_owned();
    normalized = PID_RE.replace_all(&normalized, "").into_owned();
    normalized = LINE_RE.replace_all(&normalized, "").into_owned();
    normalized = PORT_RE.replace_all(&normalized, "").into_owned();
    normalized = UUID_RE.replace_all(&normalized, "").into_owned();
    normalized = HEX_LITERAL_RE.replace_all(&normalized, "").into_owned();
    normalized = HEX_HASH_RE.replace_all(&normalized, "").into_owned();
    normalized = WHITESPACE_RE.replace_all(&normalized, " ").trim().to_string();
    normalized.truncate(200);

    let digest = md5::compute(normalized.as_bytes());
    format!("{digest:x}")[..12].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealStatus {
    Pending,
    Fixed,
    Recurring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealerEntry {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u32,
    pub status: HealStatus,
    pub session_id: Option<String>,
    pub error_preview: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HealerData {
    #[serde(default)]
    treated_errors: HashMap<String, HealerEntry>,
}

/// Tracks treated errors so the same fault isn't repeatedly re-healed
/// inside its cooldown window, and escalates errors that keep coming back
/// after a fix attempt.
pub struct HealerMemory {
    path: PathBuf,
    data: HealerData,
}

impl HealerMemory {
    pub fn new(memory_root: impl AsRef<Path>) -> Self {
        let path = memory_root.as_ref().join("healer_history.json");
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self { path, data }
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&self.data) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(error = %e, "failed to save healer history");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize healer history"),
        }
    }

    /// True if this error is new, or past cooldown and not marked recurring.
    pub fn should_heal(&self, error_line: &str) -> bool {
        let hash = fingerprint(error_line);
        let Some(entry) = self.data.treated_errors.get(&hash) else {
            return true;
        };

        if Utc::now() - entry.last_seen < Duration::hours(COOLDOWN_HOURS) {
            debug!(hash, "error in cooldown, skipping");
            return false;
        }

        if entry.status == HealStatus::Recurring {
            warn!(hash, "error is recurring, escalating");
            return false;
        }

        true
    }

    pub fn mark_pending(&mut self, error_line: &str, session_id: &str) {
        let hash = fingerprint(error_line);
        let now = Utc::now();
        let entry = self
            .data
            .treated_errors
            .entry(hash.clone())
            .or_insert_with(|| HealerEntry {
                first_seen: now,
                last_seen: now,
                count: 0,
                status: HealStatus::Pending,
                session_id: None,
                error_preview: String::new(),
            });

        entry.last_seen = now;
        entry.count += 1;
        entry.status = HealStatus::Pending;
        entry.session_id = Some(session_id.to_string());
        entry.error_preview = error_line.chars().take(100).collect();

        info!(hash, attempt = entry.count, "marked error pending");
        self.save();
    }

    pub fn mark_fixed(&mut self, hash: &str) {
        if let Some(entry) = self.data.treated_errors.get_mut(hash) {
            entry.status = HealStatus::Fixed;
            info!(hash, "error marked fixed");
            self.save();
        }
    }

    pub fn mark_recurring(&mut self, error_line: &str) {
        let hash = fingerprint(error_line);
        if let Some(entry) = self.data.treated_errors.get_mut(&hash) {
            if entry.count >= RECURRENCE_THRESHOLD {
                entry.status = HealStatus::Recurring;
                warn!(hash, count = entry.count, "error marked recurring");
                self.save();
            }
        }
    }

    pub fn recurring_errors(&self) -> Vec<(&str, &HealerEntry)> {
        self.data
            .treated_errors
            .iter()
            .filter(|(_, e)| e.status == HealStatus::Recurring)
            .map(|(h, e)| (h.as_str(), e))
            .collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SentinelData {
    #[serde(default)]
    queue: Vec<String>,
    #[serde(default)]
    last_refactored: HashMap<String, DateTime<Utc>>,
}

/// Tracks which source files have already been swept by the self-review
/// pass and holds a rotating queue of what's next, so the same file isn't
/// refactored every single run.
pub struct SentinelMemory {
    path: PathBuf,
    data: SentinelData,
}

impl SentinelMemory {
    const FORBIDDEN_ZONES: &'static [&'static str] = &["memories/**", ".git/*", "target/*", "tests/*"];

    pub fn new(memory_root: impl AsRef<Path>) -> Self {
        let path = memory_root.as_ref().join("sentinel_queue.json");
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self { path, data }
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&self.data) {
            let _ = std::fs::write(&self.path, json);
        }
    }

    fn is_forbidden(path: &str) -> bool {
        Self::FORBIDDEN_ZONES.iter().any(|pattern| glob_match(pattern, path))
    }

    /// Scans `root_dir` for `.rs` files and populates the rotation queue.
    /// A no-op if the queue has already been populated.
    pub fn populate_queue(&mut self, root_dir: &Path) {
        if !self.data.queue.is_empty() {
            return;
        }

        let mut queue = Vec::new();
        collect_rs_files(root_dir, root_dir, &mut queue);
        queue.retain(|p| !Self::is_forbidden(p));

        info!(count = queue.len(), "sentinel queue populated");
        self.data.queue = queue;
        self.save();
    }

    pub fn next_target(&self) -> Option<&str> {
        let now = Utc::now();
        self.data.queue.iter().find_map(|path| {
            match self.data.last_refactored.get(path) {
                Some(last) if now - *last < Duration::days(SENTINEL_COOLDOWN_DAYS) => None,
                _ => Some(path.as_str()),
            }
        })
    }

    pub fn mark_refactored(&mut self, path: &str) {
        self.data.last_refactored.insert(path.to_string(), Utc::now());
        if let Some(pos) = self.data.queue.iter().position(|p| p == path) {
            let entry = self.data.queue.remove(pos);
            self.data.queue.push(entry);
        }
        info!(path, "marked refactored");
        self.save();
    }
}

fn collect_rs_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(root, &path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

fn glob_match(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path.starts_with(prefix) && path[prefix.len()..].trim_start_matches('/').split('/').count() <= 1;
    }
    path == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_timestamps_and_pids() {
        let a = fingerprint("2026-01-21T14:55:13.123Z ERROR connection refused PID:4821");
        let b = fingerprint("2026-03-02T09:10:00.456Z ERROR connection refused PID:9911");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_ignores_ports_and_uuids() {
        let a = fingerprint("timeout on :8089 request a3b8d1b6-0b3b-4b1a-9c1a-1a2b3c4d5e6f");
        let b = fingerprint("timeout on :9099 request 11112222-3333-4444-5555-666677778888");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_different_errors() {
        let a = fingerprint("connection refused by downstream");
        let b = fingerprint("null pointer dereference in parser");
        assert_ne!(a, b);
    }

    #[test]
    fn healer_should_heal_new_error() {
        let dir = tempfile::tempdir().unwrap();
        let healer = HealerMemory::new(dir.path());
        assert!(healer.should_heal("brand new failure"));
    }

    #[test]
    fn healer_cooldown_blocks_immediate_reheal() {
        let dir = tempfile::tempdir().unwrap();
        let mut healer = HealerMemory::new(dir.path());
        healer.mark_pending("flaky timeout", "session-1");
        assert!(!healer.should_heal("flaky timeout"));
    }

    #[test]
    fn healer_recurring_blocks_heal() {
        let dir = tempfile::tempdir().unwrap();
        let mut healer = HealerMemory::new(dir.path());
        healer.mark_pending("bad state", "s1");
        healer.mark_pending("bad state", "s2");
        healer.mark_recurring("bad state");
        assert!(!healer.should_heal("bad state"));
        assert_eq!(healer.recurring_errors().len(), 1);
    }

    #[test]
    fn sentinel_skips_forbidden_zones() {
        assert!(SentinelMemory::is_forbidden("memories/forge/state.json"));
        assert!(SentinelMemory::is_forbidden("tests/helpers.rs"));
        assert!(!SentinelMemory::is_forbidden("src/forge.rs"));
    }

    #[test]
    fn sentinel_populate_and_rotate() {
        let memdir = tempfile::tempdir().unwrap();
        let srcdir = tempfile::tempdir().unwrap();
        std::fs::write(srcdir.path().join("a.rs"), "fn a() {}").unwrap();
        std::fs::write(srcdir.path().join("b.rs"), "fn b() {}").unwrap();

        let mut sentinel = SentinelMemory::new(memdir.path());
        sentinel.populate_queue(srcdir.path());
        assert_eq!(sentinel.data.queue.len(), 2);

        let first = sentinel.next_target().unwrap().to_string();
        sentinel.mark_refactored(&first);
        let second = sentinel.next_target().unwrap();
        assert_ne!(first, second);
    }
}
