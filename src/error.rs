//! Shared result-reporting type. Every module keeps its own `thiserror`
//! enum for fallible operations; this just gives the CLI one shape to print
//! regardless of which subsystem produced the outcome.

use std::fmt;

/// A human-facing summary of something the orchestrator did, used by the
/// CLI to print a single consistent line no matter which subsystem ran.
#[derive(Debug, Clone)]
pub enum RecordedOutcome {
    Success { summary: String },
    Failure { summary: String },
}

impl RecordedOutcome {
    pub fn success(summary: impl Into<String>) -> Self {
        Self::Success { summary: summary.into() }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self::Failure { summary: summary.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl fmt::Display for RecordedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { summary } => write!(f, "OK: {summary}"),
            Self::Failure { summary } => write!(f, "FAILED: {summary}"),
        }
    }
}

impl From<&crate::forge::MissionOutcome> for RecordedOutcome {
    fn from(outcome: &crate::forge::MissionOutcome) -> Self {
        use crate::forge::MissionOutcome;
        match outcome {
            MissionOutcome::Success { pr_url, score, .. } => {
                Self::success(format!("PR opened at {pr_url} (score {score})"))
            }
            MissionOutcome::SandboxSuccess { session_id, .. } => {
                Self::success(format!("sandbox session {session_id} completed"))
            }
            MissionOutcome::Failed { reason } => Self::failure(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::MissionOutcome;

    #[test]
    fn success_displays_ok_prefix() {
        let outcome = RecordedOutcome::success("done");
        assert_eq!(outcome.to_string(), "OK: done");
        assert!(outcome.is_success());
    }

    #[test]
    fn mission_outcome_failed_converts_to_failure() {
        let mission = MissionOutcome::Failed { reason: "gate rejected".into() };
        let recorded: RecordedOutcome = (&mission).into();
        assert!(!recorded.is_success());
        assert_eq!(recorded.to_string(), "FAILED: gate rejected");
    }
}
