use crate::agent_client::{AgentClient, SessionStatus};
use crate::config::ForgeSettings;
use crate::critic::PlanCritic;
use crate::gate::{QualityGate, Verdict};
use crate::git_ops::GitOps;
use crate::llm_gateway::LlmGateway;
use crate::staging::{FileChange, StagingStore};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default = "default_requires_repo")]
    pub requires_repo: bool,
    #[serde(default = "default_confidence")]
    pub confidence: i64,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_requires_repo() -> bool {
    true
}

fn default_confidence() -> i64 {
    75
}

fn default_source() -> String {
    "UNKNOWN".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionOutcome {
    Success {
        pr_url: String,
        score: i64,
        session_id: String,
    },
    SandboxSuccess {
        session_id: String,
        outputs: Option<serde_json::Value>,
    },
    Failed {
        reason: String,
    },
}

/// Extract per-file addition/deletion counts from a unidiff patch by
/// scanning `diff --git` headers and counting `+`/`-` lines until the
/// next header.
pub fn parse_files_from_diff(diff: &str) -> Vec<FileChange> {
    if diff.is_empty() {
        return Vec::new();
    }

    let mut files = Vec::new();
    let mut current: Option<(String, u32, u32)> = None;

    for line in diff.lines() {
        if line.starts_with("diff --git") {
            if let Some((path, additions, deletions)) = current.take() {
                files.push(FileChange { path, additions, deletions });
            }
            let parts: Vec<&str> = line.split(' ').collect();
            current = parts.get(3).map(|p| (p.trim_start_matches("b/").to_string(), 0, 0));
        } else if let Some((_, additions, deletions)) = current.as_mut() {
            if line.starts_with('+') && !line.starts_with("+++") {
                *additions += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                *deletions += 1;
            }
        }
    }

    if let Some((path, additions, deletions)) = current {
        files.push(FileChange { path, additions, deletions });
    }

    files
}

/// True once a refinement attempt improved the score over the previous one
/// by at least 5 points, earning the loop an extra iteration beyond its
/// configured max. A `previous_score` of 0 means there was no prior attempt
/// to compare against.
fn earns_bonus_iteration(score: i64, previous_score: i64) -> bool {
    previous_score > 0 && score > previous_score && score - previous_score >= 5
}

/// True once consecutive unchanged-diff retries have hit the configured
/// cap, meaning the agent is unresponsive and the mission should abort
/// rather than wait again.
fn unchanged_retry_cap_reached(unchanged_retries: u32, max_unchanged_retries: u32) -> bool {
    unchanged_retries >= max_unchanged_retries
}

/// The refinement loop: a mission is sent to the agent, its plan is
/// critiqued before execution, and the resulting PR diff is scored by the
/// Quality Gate across iterations until it passes, is judged trash, or
/// budgets run out.
pub struct Forge<'a, G: LlmGateway> {
    agent: &'a AgentClient,
    gate: &'a QualityGate<G>,
    critic: &'a PlanCritic<G>,
    staging: &'a StagingStore,
    git_ops: &'a GitOps,
    settings: &'a ForgeSettings,
}

impl<'a, G: LlmGateway> Forge<'a, G> {
    pub fn new(
        agent: &'a AgentClient,
        gate: &'a QualityGate<G>,
        critic: &'a PlanCritic<G>,
        staging: &'a StagingStore,
        git_ops: &'a GitOps,
        settings: &'a ForgeSettings,
    ) -> Self {
        Self {
            agent,
            gate,
            critic,
            staging,
            git_ops,
            settings,
        }
    }

    pub async fn forge_mission(&self, mission: &Mission) -> MissionOutcome {
        info!(title = %mission.title, requires_repo = mission.requires_repo, "starting mission");

        if !mission.requires_repo {
            return self.forge_repoless(mission).await;
        }

        let prompt = self.draft_prompt(mission);
        let mut feedback_history: Vec<String> = Vec::new();

        for attempt in 1..=self.settings.max_plan_attempts {
            let mut full_prompt = prompt.clone();
            if !feedback_history.is_empty() {
                full_prompt.push_str("\n\nPREVIOUS PLAN FEEDBACK (fix these issues):\n");
                for (i, fb) in feedback_history.iter().enumerate() {
                    full_prompt.push_str(&format!("{}. {fb}\n", i + 1));
                }
                info!(attempt, "retrying plan with critic feedback");
            }

            let source = match self.agent.get_default_source("").await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "no source available");
                    return MissionOutcome::Failed {
                        reason: "No source available".into(),
                    };
                }
            };

            let session = match self
                .agent
                .create_session(&full_prompt, &format!("Forge: {}", mission.title), &source, "main", true)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "session creation failed");
                    return MissionOutcome::Failed {
                        reason: "Session creation failed".into(),
                    };
                }
            };

            match self.critic_gate(&session.id, mission).await {
                Ok(true) => return self.refinement_loop(&session.id, mission).await,
                Ok(false) => {
                    feedback_history.push("Improve the plan".to_string());
                    info!(attempt, "plan rejected, retrying");
                }
                Err(reason) => {
                    feedback_history.push(reason);
                }
            }
        }

        info!("all plan attempts exhausted, aborting mission");
        MissionOutcome::Failed {
            reason: format!("Plan rejected after {} sessions", self.settings.max_plan_attempts),
        }
    }

    fn draft_prompt(&self, mission: &Mission) -> String {
        format!(
            "MISSION\n\nTITLE: {}\nDESCRIPTION: {}\nRATIONALE: {}\n\n\
             Implement this strictly within the existing project structure. Identify \
             existing files to modify rather than reinventing them. Add tests for any new \
             code. Use strict typing, exhaustive error handling, and keep the style of the \
             surrounding code.",
            mission.title, mission.description, mission.rationale
        )
    }

    /// Wait for the agent to produce a plan, then send it through the
    /// Planning Critic before approving execution. Returns `Ok(true)` on
    /// approval, `Ok(false)` on a clean rejection with generic feedback,
    /// or `Err(reason)` when the session itself failed before a plan
    /// could be critiqued.
    async fn critic_gate(&self, session_id: &str, mission: &Mission) -> Result<bool, String> {
        info!("waiting for plan");

        let mut plan_ready = false;
        for _ in 0..self.settings.plan_poll_attempts {
            match self.agent.get_session(session_id).await {
                Ok(Some(session)) => {
                    if session.status == SessionStatus::AwaitingPlanApproval {
                        plan_ready = true;
                        break;
                    }
                    if matches!(
                        session.status,
                        SessionStatus::Failed | SessionStatus::Error | SessionStatus::Completed
                    ) {
                        warn!(?session.status, "session ended before plan approval");
                        return Err("Session ended unexpectedly".to_string());
                    }
                }
                Ok(None) | Err(_) => {}
            }
            sleep(Duration::from_secs(self.settings.plan_poll_secs)).await;
        }

        if !plan_ready {
            warn!("timeout waiting for plan");
            return Err("Timeout waiting for plan".to_string());
        }

        let plan_text = match self.agent.get_plan(session_id).await {
            Ok(Some(plan)) => {
                info!(steps = plan.steps.len(), "got plan");
                plan.steps
                    .iter()
                    .map(|s| format!("- {}: {}", s.title, s.description))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            _ => {
                warn!("could not fetch plan structure");
                "No plan structure available".to_string()
            }
        };

        let review = self.critic.critique_plan(&mission.title, &plan_text).await;

        if review.approved {
            info!(confidence = review.confidence, "plan approved");
            match self.agent.approve_plan(session_id).await {
                Ok(true) => Ok(true),
                Ok(false) => {
                    error!("failed to send plan approval");
                    Err("API approval failed".to_string())
                }
                Err(e) => {
                    error!(error = %e, "failed to send plan approval");
                    Err("API approval failed".to_string())
                }
            }
        } else {
            info!(critique = %review.critique, "plan rejected");
            Ok(false)
        }
    }

    async fn refinement_loop(&self, session_id: &str, mission: &Mission) -> MissionOutcome {
        let mut previous_diff: Option<String> = None;
        let mut previous_score: i64 = 0;
        let mut bonus_iterations: u32 = 0;
        let mut unchanged_retries: u32 = 0;

        let mut iteration: u32 = 0;
        loop {
            let effective_max = self.settings.max_iterations + bonus_iterations;
            if iteration >= effective_max {
                break;
            }
            iteration += 1;
            info!(iteration, effective_max, %session_id, "refinement iteration");

            let pr_url = match self.wait_for_pr(session_id).await {
                Some(url) => url,
                None => {
                    error!("no PR generated");
                    return MissionOutcome::Failed {
                        reason: "No PR generated".into(),
                    };
                }
            };

            let mut diff = self.get_diff(session_id, &pr_url).await;

            if previous_diff.as_deref() == Some(diff.as_str()) {
                unchanged_retries += 1;
                info!(unchanged_retries, max = self.settings.max_unchanged_retries, "diff unchanged, waiting for update");

                if unchanged_retry_cap_reached(unchanged_retries, self.settings.max_unchanged_retries) {
                    warn!("max unchanged retries reached, aborting");
                    return MissionOutcome::Failed {
                        reason: format!(
                            "Agent unresponsive after {} unchanged diff cycles",
                            self.settings.max_unchanged_retries
                        ),
                    };
                }

                self.wait_for_pr_update(session_id, previous_diff.as_deref().unwrap_or("")).await;
                diff = self.get_diff(session_id, &pr_url).await;
                if previous_diff.as_deref() == Some(diff.as_str()) {
                    warn!("diff still unchanged after wait");
                    iteration -= 1;
                    continue;
                }
            } else {
                unchanged_retries = 0;
            }

            previous_diff = Some(diff.clone());

            let context = format!("{mission:?}");
            let judgment = self.gate.evaluate(&diff, &context).await;
            info!(score = judgment.score, verdict = ?judgment.verdict, "gate judgment");

            if earns_bonus_iteration(judgment.score, previous_score) {
                bonus_iterations += 1;
                info!(improvement = judgment.score - previous_score, bonus_iterations, "score improved, granting bonus iteration");
            }
            previous_score = judgment.score;

            match judgment.verdict {
                Verdict::Pass => {
                    info!(%pr_url, "mission accomplished");
                    let files = parse_files_from_diff(&diff);
                    if let Err(e) = self.staging.stage_project(
                        session_id,
                        &mission.title,
                        session_id,
                        &files,
                        &diff,
                        Some(pr_url.clone()),
                        Some(mission.description.clone()),
                    ) {
                        warn!(error = %e, "failed to stage project");
                    }
                    return MissionOutcome::Success {
                        pr_url,
                        score: judgment.score,
                        session_id: session_id.to_string(),
                    };
                }
                Verdict::Trash => {
                    info!("code is trash, aborting immediately");
                    self.git_ops.cleanup_pr(&pr_url, false).await;
                    return MissionOutcome::Failed {
                        reason: format!("Trash code ({}): {}", judgment.score, judgment.feedback),
                    };
                }
                Verdict::Refine => {
                    let effective_max = self.settings.max_iterations + bonus_iterations;
                    if iteration >= effective_max {
                        info!(effective_max, "max iterations reached, aborting");
                        self.git_ops.cleanup_pr(&pr_url, false).await;
                        return MissionOutcome::Failed {
                            reason: format!("Max iterations reached (score: {}/100)", judgment.score),
                        };
                    }

                    let feedback = self.build_feedback(&judgment);
                    info!("sending feedback for refinement");
                    match self.agent.send_message(session_id, &feedback).await {
                        Ok(true) => {}
                        _ => {
                            return MissionOutcome::Failed {
                                reason: "Communication breakdown".into(),
                            }
                        }
                    }

                    let wait_secs = if judgment.critical_issues.len() > 2 {
                        self.settings.refine_sleep_secs_critical
                    } else {
                        self.settings.refine_sleep_secs
                    };
                    info!(wait_secs, "waiting for agent to process feedback");
                    sleep(Duration::from_secs(wait_secs)).await;
                }
            }
        }

        MissionOutcome::Failed {
            reason: "Unknown error".into(),
        }
    }

    fn build_feedback(&self, judgment: &crate::gate::Judgment) -> String {
        let mut gap_section = String::new();
        if !judgment.gap_analysis.fixes.is_empty() {
            gap_section.push_str("\n\nGAP ANALYSIS (to reach pass threshold):\n");
            for fix in &judgment.gap_analysis.fixes {
                gap_section.push_str(&format!("  - {} (+{} pts)\n", fix.action, fix.points));
            }
        }

        format!(
            "GATE FEEDBACK (Score: {}/100)\n\
             ANALYSIS:\n{}\n\n\
             CRITICAL ISSUES: {:?}{}\n\n\
             Fix these precise points and push to the same branch.",
            judgment.score, judgment.feedback, judgment.critical_issues, gap_section
        )
    }

    async fn wait_for_pr(&self, session_id: &str) -> Option<String> {
        for i in 0..self.settings.pr_wait_attempts {
            if let Ok(Some(session)) = self.agent.get_session(session_id).await {
                if let Some(pr_url) = session.pr_url {
                    return Some(pr_url);
                }
                if session.status == SessionStatus::Failed {
                    return None;
                }
            }
            if i > 0 && i % 30 == 0 {
                info!(elapsed_secs = i * self.settings.pr_wait_poll_secs, "still waiting for PR");
            }
            sleep(Duration::from_secs(self.settings.pr_wait_poll_secs)).await;
        }
        warn!("timeout waiting for PR");
        None
    }

    async fn wait_for_pr_update(&self, session_id: &str, previous_diff: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.settings.unchanged_wait_secs);
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(session)) = self.agent.get_session(session_id).await {
                if let Some(pr_url) = &session.pr_url {
                    let new_diff = self.get_diff(session_id, pr_url).await;
                    if new_diff != previous_diff {
                        info!("detected PR update");
                        return true;
                    }
                }
            }
            sleep(Duration::from_secs(self.settings.unchanged_poll_secs)).await;
        }
        false
    }

    /// Prefer the real unidiff patch from session activities; fall back to
    /// the `gh` CLI's rendering of the PR diff if the activities API has
    /// nothing yet.
    async fn get_diff(&self, session_id: &str, pr_url: &str) -> String {
        match self.agent.get_git_patch(session_id).await {
            Ok(Some(patch)) => patch,
            _ => {
                warn!("activities API returned no patch, falling back to gh CLI");
                self.git_ops.get_pr_diff(pr_url).await
            }
        }
    }

    async fn forge_repoless(&self, mission: &Mission) -> MissionOutcome {
        info!(title = %mission.title, "repoless sandbox mission");

        let prompt = format!(
            "SANDBOX MISSION (REPOLESS)\n\nTITLE: {}\nDESCRIPTION: {}\n\n\
             You operate in an ephemeral cloud environment with Node, Python, Rust, and Bun \
             preloaded. Execute this task and return results directly; no PR is needed.",
            mission.title, mission.description
        );

        let session = match self
            .agent
            .create_repoless_session(&prompt, &format!("Sandbox: {}", mission.title))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "repoless session creation failed");
                return MissionOutcome::Failed {
                    reason: "Repoless session creation failed".into(),
                };
            }
        };

        for _ in 0..self.settings.repoless_attempts {
            if let Ok(Some(s)) = self.agent.get_session(&session.id).await {
                if s.status == SessionStatus::Completed {
                    info!(title = %mission.title, "sandbox completed");
                    return MissionOutcome::SandboxSuccess {
                        session_id: session.id,
                        outputs: None,
                    };
                }
                if s.status == SessionStatus::Failed {
                    error!(title = %mission.title, "sandbox failed");
                    return MissionOutcome::Failed {
                        reason: "Session failed".into(),
                    };
                }
            }
            sleep(Duration::from_secs(self.settings.repoless_poll_secs)).await;
        }

        MissionOutcome::Failed {
            reason: "Timeout waiting for sandbox".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_files_from_diff_counts_additions_and_deletions() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n+fn a() {}\n+fn b() {}\n-fn old() {}\n\
                     diff --git a/src/new.rs b/src/new.rs\n+fn c() {}";
        let files = parse_files_from_diff(diff);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[0].additions, 2);
        assert_eq!(files[0].deletions, 1);
        assert_eq!(files[1].path, "src/new.rs");
        assert_eq!(files[1].additions, 1);
    }

    #[test]
    fn parse_files_from_diff_empty() {
        assert!(parse_files_from_diff("").is_empty());
    }

    #[test]
    fn earns_bonus_iteration_on_sufficient_improvement() {
        assert!(earns_bonus_iteration(90, 80));
    }

    #[test]
    fn no_bonus_iteration_on_marginal_improvement() {
        assert!(!earns_bonus_iteration(83, 80));
    }

    #[test]
    fn no_bonus_iteration_without_a_prior_score() {
        assert!(!earns_bonus_iteration(90, 0));
    }

    #[test]
    fn no_bonus_iteration_when_score_drops() {
        assert!(!earns_bonus_iteration(60, 80));
    }

    #[test]
    fn unchanged_retry_cap_reached_at_threshold() {
        assert!(unchanged_retry_cap_reached(3, 3));
        assert!(!unchanged_retry_cap_reached(2, 3));
    }

    #[test]
    fn mission_defaults_when_confidence_and_source_missing() {
        let mission: Mission = serde_json::from_str(r#"{"title": "Thing"}"#).unwrap();
        assert_eq!(mission.confidence, 75);
        assert_eq!(mission.source, "UNKNOWN");
    }
}
