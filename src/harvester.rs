use crate::agent_client::AgentClient;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

const HARVEST_INTERVAL_HOURS: i64 = 24;
const HARVEST_WAIT_MINUTES: i64 = 10;
const CACHE_CAP: usize = 20;

const HARVEST_PROMPT: &str = r#"
SUGGESTION SYNC

You have already analyzed this repository and generated improvement suggestions
under "Codebase overview" > "Suggested".

MISSION:
Generate a file `memories/forge/HARVEST_SUGGESTIONS.md` containing EXACTLY the
suggestions you have already identified.

PRIORITIES TO INCLUDE:
- CRITICAL: bugs, errors, security issues
- HIGH: performance, blocking I/O, inefficient patterns

STRICT FORMAT (Markdown):
```
# Harvest

## CRITICAL
- [ ] **Exact title of your suggestion** | `file.rs:line` | short explanation

## HIGH
- [ ] **Exact title of your suggestion** | `file.rs:line` | short explanation
```

RULES:
1. Do not modify any code, generate ONLY the markdown file.
2. Use the EXACT titles of your suggestions (the ones visible in "Suggested").
3. Include the file and line concerned.
4. Only emit CRITICAL and HIGH, ignore medium/low priority items.

If you have no stored suggestions, analyze the code and produce some.
"#;

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-\s\[\s\]\s\*\*(.+?)\*\*\s*[|-]\s*`(.+?)`\s*[|-]\s*(.+)").unwrap()
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSession {
    pub id: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarvestState {
    #[serde(default)]
    pub last_harvest: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_sessions: Vec<PendingSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestItem {
    pub title: String,
    pub location: String,
    pub description: String,
    pub priority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarvestCache {
    #[serde(default)]
    pub items: Vec<HarvestItem>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSuggestion {
    pub title: String,
    pub description: String,
    pub source: &'static str,
    pub priority: String,
}

/// Caches coding-agent suggestions once a day so the nightly council can
/// fuse them in with its own proposals, without needing to re-ask the
/// agent every cycle. State is persisted so a restart doesn't lose track
/// of sessions already in flight.
pub struct Harvester {
    state_file: PathBuf,
    cache_file: PathBuf,
}

impl Harvester {
    pub fn new(memory_root: impl AsRef<Path>) -> Self {
        Self {
            state_file: memory_root.as_ref().join("harvest_state.json"),
            cache_file: memory_root.as_ref().join("harvest_cache.json"),
        }
    }

    fn load_state(&self) -> HarvestState {
        std::fs::read_to_string(&self.state_file)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    fn save_state(&self, state: &HarvestState) {
        if let Some(parent) = self.state_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(state) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.state_file, data) {
                    error!(error = %e, "failed to save harvest state");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize harvest state"),
        }
    }

    /// True once 24h have passed since the last harvest and no session
    /// from a prior harvest is still pending.
    pub fn should_harvest(&self) -> bool {
        let state = self.load_state();
        if !state.pending_sessions.is_empty() {
            debug!("sessions pending, skipping new harvest");
            return false;
        }
        match state.last_harvest {
            None => true,
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                elapsed >= chrono::Duration::hours(HARVEST_INTERVAL_HOURS)
            }
        }
    }

    /// Starts a harvest session on both keys. A failure on one profile
    /// does not prevent the other from starting.
    pub async fn start_harvest(
        &self,
        guardian: &AgentClient,
        creator: &AgentClient,
    ) -> Option<String> {
        info!("starting dual-key suggestion harvest");
        let mut state = self.load_state();
        let mut created = Vec::new();

        for (key, client) in [("guardian", guardian), ("creator", creator)] {
            let source = match client.get_default_source("").await {
                Ok(source) => source,
                Err(e) => {
                    warn!(%key, error = %e, "harvest could not resolve a source");
                    continue;
                }
            };
            let title = format!("Harvest ({key}) - {}", Utc::now().format("%H:%M"));
            match client
                .create_session(HARVEST_PROMPT, &title, &source, "main", false)
                .await
            {
                Ok(session) => {
                    info!(session_id = %session.id, %key, "harvest session created");
                    state.pending_sessions.push(PendingSession {
                        id: session.id.clone(),
                        key: key.to_string(),
                        created_at: Utc::now(),
                    });
                    created.push(session.id);
                }
                Err(e) => warn!(%key, error = %e, "harvest session failed"),
            }
        }

        state.last_harvest = Some(Utc::now());
        self.save_state(&state);
        created.into_iter().next()
    }

    /// If `session_id` is a pending harvest session, fetches its activities
    /// and imports any suggestion markdown found in the patch. Returns the
    /// number of newly cached items (0 if this isn't a harvest session, if
    /// it's too early to check, or if nothing was found).
    pub async fn check_and_import(&self, session_id: &str, agent: &AgentClient) -> usize {
        let mut state = self.load_state();
        let Some(pos) = state.pending_sessions.iter().position(|p| p.id == session_id) else {
            return 0;
        };

        let session_info = state.pending_sessions[pos].clone();
        let elapsed = Utc::now().signed_duration_since(session_info.created_at);
        if elapsed < chrono::Duration::minutes(HARVEST_WAIT_MINUTES) {
            debug!(%session_id, "harvest session too young to check yet");
            return 0;
        }

        state.pending_sessions.remove(pos);
        self.save_state(&state);

        info!(%session_id, "fetching harvest suggestions");
        let activities = match agent.get_activities(session_id, 50).await {
            Ok(activities) => activities,
            Err(e) => {
                error!(%session_id, error = %e, "failed to fetch harvest activities");
                return 0;
            }
        };

        for activity in activities.iter().rev() {
            for artifact in &activity.artifacts {
                let Some(patch) = artifact
                    .get("changeSet")
                    .and_then(|cs| cs.get("gitPatch"))
                    .and_then(|gp| gp.get("unidiffPatch"))
                    .and_then(|v| v.as_str())
                else {
                    continue;
                };

                if patch.contains("SUGGESTIONS") || patch.contains("CRITICAL") {
                    info!("found suggestions in activity");
                    let markdown = extract_from_patch(patch);
                    let items = parse_harvest_file(&markdown);
                    return self.cache_suggestions(items);
                }
            }
        }

        warn!(%session_id, "no suggestions found in activities");
        0
    }

    /// Merges `items` into the on-disk cache (deduped by title), caps it at
    /// [`CACHE_CAP`] entries, and returns how many were newly added.
    pub fn cache_suggestions(&self, items: Vec<HarvestItem>) -> usize {
        if items.is_empty() {
            return 0;
        }

        let mut cache = std::fs::read_to_string(&self.cache_file)
            .ok()
            .and_then(|data| serde_json::from_str::<HarvestCache>(&data).ok())
            .unwrap_or_default();

        let mut existing_titles: std::collections::HashSet<String> =
            cache.items.iter().map(|i| i.title.clone()).collect();
        let mut added = 0;

        for item in items {
            if existing_titles.insert(item.title.clone()) {
                cache.items.push(item);
                added += 1;
            }
        }

        if cache.items.len() > CACHE_CAP {
            let drop = cache.items.len() - CACHE_CAP;
            cache.items.drain(0..drop);
        }
        cache.updated_at = Some(Utc::now());

        if let Some(parent) = self.cache_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&cache) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.cache_file, data) {
                    error!(error = %e, "failed to save harvest cache");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize harvest cache"),
        }

        info!(added, "cached harvest items for council fusion");
        added
    }

    pub fn get_cached_suggestions(&self) -> Vec<HarvestSuggestion> {
        let cache = std::fs::read_to_string(&self.cache_file)
            .ok()
            .and_then(|data| serde_json::from_str::<HarvestCache>(&data).ok())
            .unwrap_or_default();

        cache
            .items
            .into_iter()
            .map(|item| HarvestSuggestion {
                title: item.title,
                description: format!("{} ({})", item.description, item.location),
                source: "harvest",
                priority: item.priority,
            })
            .collect()
    }
}

/// Extracts added (`+`) lines from a unified diff patch, skipping the diff
/// headers, to recover the raw markdown a coding-agent session wrote.
fn extract_from_patch(patch: &str) -> String {
    let mut lines = Vec::new();
    let mut in_content = false;

    for line in patch.split('\n') {
        if line.starts_with("diff --git") || line.starts_with("index ") {
            continue;
        }
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            continue;
        }
        if line.starts_with("@@ ") {
            in_content = true;
            continue;
        }
        if in_content {
            if let Some(added) = line.strip_prefix('+') {
                lines.push(added);
            }
        }
    }

    lines.join("\n")
}

/// Parses a `HARVEST_SUGGESTIONS.md`-shaped markdown body into structured
/// items, grouped under `## CRITICAL`/`## HIGH` headers.
fn parse_harvest_file(content: &str) -> Vec<HarvestItem> {
    let mut items = Vec::new();
    let mut current_priority: Option<&str> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim();

        if line.contains("## CRITICAL") {
            current_priority = Some("CRITICAL");
        } else if line.contains("## HIGH") {
            current_priority = Some("HIGH");
        } else if line.starts_with("## ") {
            current_priority = None;
        }

        let Some(priority) = current_priority else {
            continue;
        };
        if !line.starts_with("- [ ] **") {
            continue;
        }

        if let Some(caps) = ITEM_RE.captures(line) {
            items.push(HarvestItem {
                title: caps[1].to_string(),
                location: caps[2].to_string(),
                description: caps[3].to_string(),
                priority: priority.to_string(),
            });
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_harvest_with_no_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let harvester = Harvester::new(dir.path());
        assert!(harvester.should_harvest());
    }

    #[test]
    fn should_not_harvest_with_pending_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let harvester = Harvester::new(dir.path());
        let state = HarvestState {
            last_harvest: Some(Utc::now()),
            pending_sessions: vec![PendingSession {
                id: "s1".into(),
                key: "guardian".into(),
                created_at: Utc::now(),
            }],
        };
        harvester.save_state(&state);
        assert!(!harvester.should_harvest());
    }

    #[test]
    fn should_not_harvest_before_interval_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let harvester = Harvester::new(dir.path());
        let state = HarvestState {
            last_harvest: Some(Utc::now()),
            pending_sessions: vec![],
        };
        harvester.save_state(&state);
        assert!(!harvester.should_harvest());
    }

    #[test]
    fn extract_from_patch_strips_diff_headers() {
        let patch = "diff --git a/x b/x\nindex 123..456\n--- a/x\n+++ b/x\n@@ -0,0 +1,2 @@\n+line one\n+line two\n";
        assert_eq!(extract_from_patch(patch), "line one\nline two");
    }

    #[test]
    fn parse_harvest_file_extracts_pipe_format() {
        let md = "## CRITICAL\n- [ ] **Fix race condition** | `src/lib.rs:42` | data race on shared state\n";
        let items = parse_harvest_file(md);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Fix race condition");
        assert_eq!(items[0].location, "src/lib.rs:42");
        assert_eq!(items[0].priority, "CRITICAL");
    }

    #[test]
    fn parse_harvest_file_ignores_other_priorities() {
        let md = "## MEDIUM\n- [ ] **Low value** | `a.rs:1` | not important\n";
        assert!(parse_harvest_file(md).is_empty());
    }

    #[test]
    fn cache_suggestions_dedupes_by_title_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let harvester = Harvester::new(dir.path());

        let mut items: Vec<HarvestItem> = (0..25)
            .map(|i| HarvestItem {
                title: format!("item-{i}"),
                location: "f.rs:1".into(),
                description: "d".into(),
                priority: "HIGH".into(),
            })
            .collect();
        let added_first = harvester.cache_suggestions(items.split_off(0));
        assert_eq!(added_first, 25);

        let suggestions = harvester.get_cached_suggestions();
        assert_eq!(suggestions.len(), CACHE_CAP);

        let dup = vec![HarvestItem {
            title: "item-24".into(),
            location: "f.rs:1".into(),
            description: "d".into(),
            priority: "HIGH".into(),
        }];
        assert_eq!(harvester.cache_suggestions(dup), 0);
    }
}
