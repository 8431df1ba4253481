use crate::agent_client::{AgentClient, SessionStatus};
use crate::config::NotificationConfig;
use crate::critic::PlanCritic;
use crate::git_ops::GitOps;
use crate::harvester::Harvester;
use crate::llm_gateway::{LlmGateway, Route};
use crate::sandbox::Sandbox;
use crate::sanitizer;
use crate::staging::StagingStore;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

static CONFIDENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CONFIDENCE[:\s]*(\d+)").unwrap());

const CONFIDENCE_THRESHOLD: i64 = 50;
const DEFAULT_CONFIDENCE: i64 = 70;

/// Outbound alerting seam. The default implementation just logs; a real
/// deployment wires this to whatever paging/chat system it already has.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, message: &str) -> bool;
}

pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &str, message: &str) -> bool {
        info!(%event, %message, "notification");
        true
    }
}

async fn notify_if_enabled(
    notifier: &dyn Notifier,
    config: &NotificationConfig,
    event: &str,
    message: &str,
) -> bool {
    let enabled = match event {
        "pr_created" => config.on_pr_created,
        "pr_merged" => config.on_pr_merged,
        "council_complete" => config.on_council_complete,
        "mission_failed" => config.on_mission_failed,
        _ => true,
    };
    if !enabled {
        debug!(%event, "notification skipped, disabled by config");
        return false;
    }
    notifier.notify(event, message).await
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RefinementCounts(HashMap<String, u32>);

fn load_refinement_counts(path: &std::path::Path) -> RefinementCounts {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default()
}

/// Writes `data` to `path` via a temp file in the same directory followed by
/// a rename, so a crash mid-write never leaves a truncated file behind for
/// the watchdog to read on its next poll.
fn atomic_write(path: &std::path::Path, data: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data)?;
    std::fs::rename(&tmp_path, path)
}

fn save_refinement_counts(path: &std::path::Path, counts: &RefinementCounts) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_string(counts) {
        Ok(data) => {
            if let Err(e) = atomic_write(path, &data) {
                error!(error = %e, "failed to save refinement counts");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize refinement counts"),
    }
}

fn load_active_sessions(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default()
}

fn save_active_sessions(path: &std::path::Path, sessions: &[String]) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(data) = serde_json::to_string(sessions) {
        if let Err(e) = atomic_write(path, &data) {
            error!(error = %e, "failed to save active sessions");
        }
    }
}

/// Registers a session for the watchdog loop to poll. Called by anything
/// that creates a session outside the Forge's own inline refinement loop
/// (the harvester, ad hoc sessions started from the API).
pub fn track_session(memory_root: &std::path::Path, session_id: &str) {
    let path = memory_root.join("active_sessions.json");
    let mut sessions = load_active_sessions(&path);
    if !sessions.iter().any(|s| s == session_id) {
        sessions.push(session_id.to_string());
        save_active_sessions(&path, &sessions);
    }
}

fn untrack_session(memory_root: &std::path::Path, session_id: &str) {
    let path = memory_root.join("active_sessions.json");
    let mut sessions = load_active_sessions(&path);
    sessions.retain(|s| s != session_id);
    save_active_sessions(&path, &sessions);
}

/// Parses a `CONFIDENCE: NN` line out of a free-form review response,
/// clamped to [0, 100], falling back to a neutral default if absent.
fn parse_confidence(review: &str) -> i64 {
    CONFIDENCE_RE
        .captures(&review.to_uppercase())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .map(|n| n.clamp(0, 100))
        .unwrap_or(DEFAULT_CONFIDENCE)
}

/// True if the diff adds a new top-level definition (function, async
/// function, class) in a non-test file without also touching a test file.
/// Bugfixes to code already under test don't need a new test file; brand
/// new surface does. The orchestrated agent writes Python, so the markers
/// are Python's, not Rust's.
fn diff_needs_tests(diff: &str) -> bool {
    let mut has_new_code = false;
    let mut has_test_file = false;

    for line in diff.lines() {
        if line.starts_with("diff --git") || line.starts_with("+++") {
            if line.contains("tests/") || line.contains("test_") {
                has_test_file = true;
            }
        }
        if let Some(content) = line.strip_prefix('+') {
            if content.starts_with('+') {
                continue;
            }
            let stripped = content.trim_start();
            if stripped.starts_with("def ") || stripped.starts_with("async def ") || stripped.starts_with("class ") {
                has_new_code = true;
            }
        }
    }

    has_new_code && !has_test_file
}

fn extract_modified_files(diff: &str) -> Vec<String> {
    diff.lines()
        .filter(|l| l.starts_with("diff --git"))
        .filter_map(|l| l.split(" b/").nth(1).map(str::to_string))
        .collect()
}

/// Background watchdog: polls every actively tracked agent session,
/// reviews PRs with a confidence score before handing them to staging for
/// human decision, runs the planning critic's refinement gate on plans
/// awaiting approval, and clears failed sessions out of the active list.
/// Mirrors the review this module's source applies independently of the
/// Forge's own inline quality gate, so sessions started outside a mission
/// (harvested suggestions, ad hoc runs) still get reviewed.
pub struct Heart<G: LlmGateway> {
    agent: Arc<AgentClient>,
    gateway: Arc<G>,
    critic: Arc<PlanCritic<G>>,
    staging: Arc<StagingStore>,
    git_ops: Arc<GitOps>,
    sandbox: Arc<Sandbox>,
    harvester: Arc<Harvester>,
    notifier: Arc<dyn Notifier>,
    notifications: NotificationConfig,
    memory_root: PathBuf,
    max_refinements: u32,
}

impl<G: LlmGateway + 'static> Heart<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<AgentClient>,
        gateway: Arc<G>,
        critic: Arc<PlanCritic<G>>,
        staging: Arc<StagingStore>,
        git_ops: Arc<GitOps>,
        sandbox: Arc<Sandbox>,
        harvester: Arc<Harvester>,
        notifier: Arc<dyn Notifier>,
        notifications: NotificationConfig,
        memory_root: PathBuf,
        max_refinements: u32,
    ) -> Self {
        Self {
            agent,
            gateway,
            critic,
            staging,
            git_ops,
            sandbox,
            harvester,
            notifier,
            notifications,
            memory_root,
            max_refinements,
        }
    }

    fn refinement_counts_path(&self) -> PathBuf {
        self.memory_root.join("refinement_counts.json")
    }

    fn active_sessions_path(&self) -> PathBuf {
        self.memory_root.join("active_sessions.json")
    }

    /// Runs one polling pass over every actively tracked session.
    pub async fn tick(&self) {
        let active_ids = load_active_sessions(&self.active_sessions_path());
        if active_ids.is_empty() {
            return;
        }
        debug!(count = active_ids.len(), "polling active sessions");

        for session_id in active_ids {
            if let Err(e) = self.poll_session(&session_id).await {
                error!(%session_id, error = %e, "watchdog error");
            }
        }
    }

    async fn poll_session(&self, session_id: &str) -> Result<(), String> {
        let Some(session) = self
            .agent
            .get_session(session_id)
            .await
            .map_err(|e| e.to_string())?
        else {
            return Ok(());
        };

        match session.status {
            SessionStatus::PrOpen | SessionStatus::Completed if session.pr_url.is_some() => {
                self.handle_pr_ready(&session).await;
            }
            SessionStatus::AwaitingPlanApproval => {
                self.handle_awaiting_plan_approval(&session).await;
            }
            SessionStatus::Executing | SessionStatus::Planning => {
                if let Ok(activities) = self.agent.get_activities(session_id, 3).await {
                    if let Some(latest) = activities.first() {
                        debug!(%session_id, ?latest.create_time, "session activity");
                    }
                }
            }
            SessionStatus::Failed | SessionStatus::Error => {
                error!(%session_id, "session failed");
                notify_if_enabled(
                    self.notifier.as_ref(),
                    &self.notifications,
                    "mission_failed",
                    &format!("Task failed: {session_id}"),
                )
                .await;
                untrack_session(&self.memory_root, session_id);
            }
            _ => {}
        }

        Ok(())
    }

    async fn handle_pr_ready(&self, session: &crate::agent_client::Session) {
        let session_id = &session.id;
        let Some(pr_url) = session.pr_url.clone() else {
            return;
        };
        info!(%pr_url, "PR detected");

        let imported = self.harvester.check_and_import(session_id, &self.agent).await;
        if imported > 0 {
            info!(imported, "harvest import");
        }

        if !self.sandbox.check_probation() {
            warn!("system not safe, deferring review");
            return;
        }

        let diff = self.git_ops.get_pr_diff(&pr_url).await;

        if let Err(pattern) = sanitizer::scan_diff(&diff) {
            error!(%pattern, "security violation detected, rejecting PR");
            self.git_ops.cleanup_pr(&pr_url, false).await;
            notify_if_enabled(
                self.notifier.as_ref(),
                &self.notifications,
                "mission_failed",
                &format!("Security violation: PR rejected ({pr_url}), forbidden pattern {pattern}"),
            )
            .await;
            untrack_session(&self.memory_root, session_id);
            self.clear_refinement_count(session_id);
            return;
        }

        let sandbox_result = self.sandbox.run_tests(std::path::Path::new("."), "true");
        if !sandbox_result.passed {
            warn!(output = %sandbox_result.output, "sandbox failed");
            self.git_ops.cleanup_pr(&pr_url, false).await;
            notify_if_enabled(
                self.notifier.as_ref(),
                &self.notifications,
                "mission_failed",
                &format!("PR rejected (sandbox failed): {pr_url}"),
            )
            .await;
            untrack_session(&self.memory_root, session_id);
            self.clear_refinement_count(session_id);
            return;
        }

        if diff_needs_tests(&diff) {
            warn!("rejected: new code added without a test file");
            self.git_ops.cleanup_pr(&pr_url, false).await;
            notify_if_enabled(
                self.notifier.as_ref(),
                &self.notifications,
                "mission_failed",
                &format!("PR rejected (new code without tests): {pr_url}"),
            )
            .await;
            untrack_session(&self.memory_root, session_id);
            self.clear_refinement_count(session_id);
            return;
        }

        let diff_preview: String = diff.chars().take(8000).collect();
        let review_prompt = format!(
            "You are the code guardian. Review this PR with a CONFIDENCE SCORE.\n\n\
             URL: {pr_url}\nDIFF:\n```\n{diff_preview}\n```\n\n\
             CRITERIA:\n1. Code is correct and functional\n2. No security flaws\n\
             3. Tests included for new functionality\n4. Code style and quality\n\n\
             RESPOND WITH EXACTLY THIS FORMAT:\n\
             CONFIDENCE: [0-100]\nVERDICT: [APPROVE/REJECT]\nREASON: [short explanation]"
        );

        let confidence = match self.gateway.route(&review_prompt, Route::Fast).await {
            Ok(review) => {
                let confidence = parse_confidence(&review);
                info!(confidence, "review confidence");
                confidence
            }
            Err(e) => {
                error!(error = %e, "review failed, falling back to manual approval");
                notify_if_enabled(
                    self.notifier.as_ref(),
                    &self.notifications,
                    "pr_created",
                    &format!("Manual review needed (review failed): {pr_url}"),
                )
                .await;
                self.clear_refinement_count(session_id);
                untrack_session(&self.memory_root, session_id);
                return;
            }
        };

        let _ = self.sandbox.record_confidence(confidence);

        if confidence >= CONFIDENCE_THRESHOLD {
            info!(confidence, "confidence sufficient, awaiting human decision");
            let files = extract_modified_files(&diff);
            let file_changes: Vec<crate::staging::FileChange> = files
                .iter()
                .map(|f| crate::staging::FileChange {
                    path: f.clone(),
                    additions: 0,
                    deletions: 0,
                })
                .collect();

            let _ = self.staging.stage_project(
                session_id,
                session.title.as_str(),
                session_id,
                &file_changes,
                &diff,
                Some(pr_url.clone()),
                session.pr_description.clone(),
            );

            notify_if_enabled(
                self.notifier.as_ref(),
                &self.notifications,
                "pr_created",
                &format!("PR ready for review: {pr_url} (confidence {confidence}%)"),
            )
            .await;
        } else {
            warn!(confidence, "low confidence, auto-rejecting");
            self.sandbox.enter_probation().ok();
            self.git_ops.cleanup_pr(&pr_url, false).await;
            notify_if_enabled(
                self.notifier.as_ref(),
                &self.notifications,
                "mission_failed",
                &format!("PR rejected (low confidence {confidence}%): {pr_url}"),
            )
            .await;
        }

        self.clear_refinement_count(session_id);
        untrack_session(&self.memory_root, session_id);
    }

    async fn handle_awaiting_plan_approval(&self, session: &crate::agent_client::Session) {
        let session_id = &session.id;
        info!(%session_id, "plan awaiting approval");

        let mut counts = load_refinement_counts(&self.refinement_counts_path());
        let current = *counts.0.get(session_id).unwrap_or(&0);

        if current < self.max_refinements {
            let plan_summary = match self.agent.get_plan(session_id).await {
                Ok(Some(plan)) => plan
                    .steps
                    .iter()
                    .map(|s| format!("- {}: {}", s.title, s.description))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => "Plan ready for review".to_string(),
            };

            let review = self
                .critic
                .critique_plan(&session.title, &plan_summary)
                .await;

            if !review.approved {
                warn!(confidence = review.confidence, critique = %review.critique, "plan rejected by critic");
                let _ = self
                    .agent
                    .send_message(
                        session_id,
                        &format!("PLANNING CRITIC FEEDBACK: {}", review.improvement_prompt),
                    )
                    .await;

                counts.0.insert(session_id.clone(), current + 1);
                save_refinement_counts(&self.refinement_counts_path(), &counts);
                info!(attempt = current + 1, max = self.max_refinements, "requested plan refinement");
                return;
            }

            info!(confidence = review.confidence, "plan approved by critic");
        }

        notify_if_enabled(
            self.notifier.as_ref(),
            &self.notifications,
            "pr_created",
            &format!("Plan ready for approval: {} ({session_id})", session.title),
        )
        .await;
    }

    fn clear_refinement_count(&self, session_id: &str) {
        let path = self.refinement_counts_path();
        let mut counts = load_refinement_counts(&path);
        if counts.0.remove(session_id).is_some() {
            save_refinement_counts(&path, &counts);
        }
    }

    /// Spawns the watchdog as a background task. Returns immediately; the
    /// task runs until `stop` is set.
    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>, poll_secs: u64) {
        tokio::spawn(async move {
            info!("watchdog loop started");
            while !stop.load(Ordering::Relaxed) {
                self.tick().await;
                tokio::time::sleep(tokio::time::Duration::from_secs(poll_secs)).await;
            }
            info!("watchdog loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_confidence_extracts_number() {
        assert_eq!(parse_confidence("CONFIDENCE: 82\nVERDICT: APPROVE"), 82);
    }

    #[test]
    fn parse_confidence_clamps_out_of_range() {
        assert_eq!(parse_confidence("confidence: 150"), 100);
    }

    #[test]
    fn parse_confidence_defaults_when_absent() {
        assert_eq!(parse_confidence("no score here"), DEFAULT_CONFIDENCE);
    }

    #[test]
    fn diff_needs_tests_flags_new_function_without_test_file() {
        let diff = "diff --git a/forge/gate.py b/forge/gate.py\n+++ b/forge/gate.py\n+def new_thing():\n+    pass\n";
        assert!(diff_needs_tests(diff));
    }

    #[test]
    fn diff_needs_tests_flags_new_class_without_test_file() {
        let diff = "diff --git a/forge/gate.py b/forge/gate.py\n+++ b/forge/gate.py\n+class NewThing:\n+    pass\n";
        assert!(diff_needs_tests(diff));
    }

    #[test]
    fn diff_needs_tests_flags_new_async_function_without_test_file() {
        let diff = "diff --git a/forge/gate.py b/forge/gate.py\n+++ b/forge/gate.py\n+async def new_thing():\n+    pass\n";
        assert!(diff_needs_tests(diff));
    }

    #[test]
    fn diff_needs_tests_allows_new_function_with_test_file() {
        let diff = "diff --git a/forge/gate.py b/forge/gate.py\n+++ b/forge/gate.py\n+def new_thing():\n+    pass\n\
                     diff --git a/tests/test_gate.py b/tests/test_gate.py\n+++ b/tests/test_gate.py\n+def test_it():\n+    pass\n";
        assert!(!diff_needs_tests(diff));
    }

    #[test]
    fn diff_needs_tests_ignores_pure_modifications() {
        let diff = "diff --git a/forge/gate.py b/forge/gate.py\n+++ b/forge/gate.py\n+    x += 1\n";
        assert!(!diff_needs_tests(diff));
    }

    #[test]
    fn extract_modified_files_parses_headers() {
        let diff = "diff --git a/src/a.rs b/src/a.rs\n+++ b/src/a.rs\ndiff --git a/src/b.rs b/src/b.rs\n+++ b/src/b.rs\n";
        assert_eq!(extract_modified_files(diff), vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn track_and_untrack_session_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        track_session(dir.path(), "sess-1");
        let path = dir.path().join("active_sessions.json");
        assert_eq!(load_active_sessions(&path), vec!["sess-1"]);

        track_session(dir.path(), "sess-1");
        assert_eq!(load_active_sessions(&path).len(), 1);

        untrack_session(dir.path(), "sess-1");
        assert!(load_active_sessions(&path).is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write(&path, "{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn refinement_counts_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refinement_counts.json");
        let mut counts = RefinementCounts::default();
        counts.0.insert("s1".to_string(), 2);
        save_refinement_counts(&path, &counts);
        let loaded = load_refinement_counts(&path);
        assert_eq!(loaded.0.get("s1"), Some(&2));
    }
}
