use crate::council::{self, BriefCandidate, Council, MorningBrief};
use crate::forge::{Forge, Mission, MissionOutcome};
use crate::llm_gateway::LlmGateway;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

const HEARTBEAT_SECS: u64 = 3600;

/// Coordinates the two event triggers the rest of the system dispatches
/// through it: convening the nightly council (strategy) and executing a
/// single mission picked from the morning brief (execution). Never merges
/// a PR on its own; staged projects wait for a human decision. Owns the
/// "is a council run currently in flight" flag so the HTTP layer and any
/// other caller share one source of truth instead of tracking it twice.
pub struct Architect {
    memory_root: PathBuf,
    running: Arc<AtomicBool>,
    council_running: Arc<AtomicBool>,
    council_started_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Architect {
    pub fn new(memory_root: impl Into<PathBuf>) -> Self {
        Self {
            memory_root: memory_root.into(),
            running: Arc::new(AtomicBool::new(false)),
            council_running: Arc::new(AtomicBool::new(false)),
            council_started_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Hourly heartbeat. The architect is reactive — real work happens when
    /// `convene_council`/`execute_mission_from_brief` are called directly
    /// (from the API or from a scheduler) — this loop just logs that it's
    /// alive and exits promptly once `stop` is flipped.
    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) {
        self.running.store(true, Ordering::Relaxed);
        info!("architect ready");
        tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(HEARTBEAT_SECS)) => {
                        info!("architect heartbeat");
                    }
                }
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            self.running.store(false, Ordering::Relaxed);
            info!("architect shutdown");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Claims the right to run the council, refusing if one is already in
    /// flight. Returns the claimed start time on success.
    pub fn try_start_council(&self) -> Option<DateTime<Utc>> {
        if self
            .council_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let started_at = Utc::now();
        *self.council_started_at.lock().unwrap() = Some(started_at);
        Some(started_at)
    }

    pub fn is_council_running(&self) -> bool {
        self.council_running.load(Ordering::SeqCst)
    }

    pub fn council_started_at(&self) -> Option<DateTime<Utc>> {
        *self.council_started_at.lock().unwrap()
    }

    /// Triggers the nightly council's full collect/validate/dedup/dispatch
    /// pipeline, clearing the in-flight flag once it finishes regardless of
    /// outcome. Callers that want the concurrency guard should pair this
    /// with `try_start_council`.
    pub async fn convene_council<G: LlmGateway>(&self, council: &Council<'_, G>) {
        info!("convening the nightly council");
        match council.convene().await {
            Some(report) => info!(
                achieved = report.achieved,
                target = report.target,
                "council session complete"
            ),
            None => warn!("council convened with no ideas to act on"),
        }
        self.council_running.store(false, Ordering::SeqCst);
    }

    fn load_morning_brief(&self) -> Option<MorningBrief> {
        let path = council::morning_brief_path(&self.memory_root);
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn load_brief_candidate(&self, mission_index: usize) -> Option<BriefCandidate> {
        let brief = self.load_morning_brief()?;
        if mission_index >= brief.candidates.len() {
            error!(mission_index, total = brief.candidates.len(), "invalid mission index");
            return None;
        }
        Some(brief.candidates[mission_index].clone())
    }

    /// Executes a single mission selected by index out of the morning
    /// brief's candidate list, dispatching it through the Forge.
    pub async fn execute_mission_from_brief<G: LlmGateway>(
        &self,
        forge: &Forge<'_, G>,
        mission_index: usize,
    ) -> Option<MissionOutcome> {
        let Some(candidate) = self.load_brief_candidate(mission_index) else {
            error!("no brief found or invalid index");
            return None;
        };

        info!(title = %candidate.title, "sending mission to forge");
        let mission = Mission {
            title: candidate.title.clone(),
            description: candidate.description.clone(),
            rationale: candidate.verdict.clone(),
            requires_repo: true,
            confidence: candidate.confidence,
            source: candidate.source.clone(),
        };

        let outcome = forge.forge_mission(&mission).await;
        match &outcome {
            MissionOutcome::Success { pr_url, .. } => {
                info!(%pr_url, "mission success");
            }
            MissionOutcome::SandboxSuccess { session_id, .. } => {
                info!(%session_id, "mission succeeded in sandbox");
            }
            MissionOutcome::Failed { reason } => {
                error!(%reason, "mission failed");
            }
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_architect_starts_not_running() {
        let architect = Architect::new("memories/forge");
        assert!(!architect.is_running());
        assert!(!architect.is_council_running());
    }

    #[test]
    fn try_start_council_refuses_concurrent_runs() {
        let architect = Architect::new("memories/forge");
        assert!(architect.try_start_council().is_some());
        assert!(architect.is_council_running());
        assert!(architect.try_start_council().is_none());
    }

    #[test]
    fn load_brief_candidate_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let architect = Architect::new(dir.path());
        assert!(architect.load_brief_candidate(0).is_none());
    }

    #[test]
    fn load_brief_candidate_out_of_range_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let brief = MorningBrief {
            date: "2026-01-01T00:00:00Z".to_string(),
            candidates: vec![BriefCandidate {
                id: "project_1".to_string(),
                index: 0,
                title: "Thing".to_string(),
                description: String::new(),
                source: "HARVEST".to_string(),
                verdict: String::new(),
                confidence: 75,
                status: "WAITING_DECISION".to_string(),
            }],
            status: "WAITING_USER_DECISION".to_string(),
            total: 1,
        };
        std::fs::write(
            council::morning_brief_path(dir.path()),
            serde_json::to_string(&brief).unwrap(),
        )
        .unwrap();

        let architect = Architect::new(dir.path());
        assert!(architect.load_brief_candidate(5).is_none());
        assert!(architect.load_brief_candidate(0).is_some());
    }
}
