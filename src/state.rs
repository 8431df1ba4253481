use crate::agent_client::{AgentClient, AgentClientError, AgentProfile};
use crate::architect::Architect;
use crate::config::OrchestratorConfig;
use crate::critic::PlanCritic;
use crate::forge::Forge;
use crate::gate::QualityGate;
use crate::git_ops::GitOps;
use crate::harvester::Harvester;
use crate::heart::{Heart, Notifier, TracingNotifier};
use crate::llm_gateway::HttpLlmGateway;
use crate::sandbox::Sandbox;
use crate::staging::{StagingError, StagingStore};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("agent client init failed: {0}")]
    Agent(#[from] AgentClientError),
    #[error("staging store init failed: {0}")]
    Staging(#[from] StagingError),
}

/// The orchestrator's injectable runtime context: every long-lived
/// collaborator constructed once at startup and shared by the API
/// handlers, the Architect's heartbeat, and the Heart's watchdog loop.
/// Replaces the module-level singletons the source wires up at import
/// time with explicit, testable ownership.
pub struct OrchestratorContext {
    pub config: OrchestratorConfig,
    pub guardian: Arc<AgentClient>,
    pub creator: Arc<AgentClient>,
    pub gateway: HttpLlmGateway,
    pub gate: QualityGate<HttpLlmGateway>,
    pub critic: Arc<PlanCritic<HttpLlmGateway>>,
    pub staging: Arc<StagingStore>,
    pub git_ops: Arc<GitOps>,
    pub sandbox: Arc<Sandbox>,
    pub harvester: Arc<Harvester>,
    pub heart: Arc<Heart<HttpLlmGateway>>,
    pub architect: Arc<Architect>,
}

impl OrchestratorContext {
    pub fn new(config: OrchestratorConfig, repo_root: impl Into<std::path::PathBuf>, repo_slug: impl Into<String>) -> Result<Self, StateError> {
        Self::new_with_notifier(config, repo_root, repo_slug, Arc::new(TracingNotifier))
    }

    pub fn new_with_notifier(
        config: OrchestratorConfig,
        repo_root: impl Into<std::path::PathBuf>,
        repo_slug: impl Into<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, StateError> {
        let guardian = Arc::new(AgentClient::new(AgentProfile::Guardian)?);
        let creator = Arc::new(AgentClient::new(AgentProfile::Creator)?);

        let gateway = HttpLlmGateway::new(config.gateway.endpoint.clone());

        let gate = QualityGate::new(
            gateway.clone(),
            config.gate.pass_threshold,
            config.gate.trash_threshold,
            config.gate.max_diff_chars,
        );
        let critic = Arc::new(PlanCritic::new(gateway.clone()));

        let staging = Arc::new(StagingStore::new(&config.storage.memory_root)?);
        let git_ops = Arc::new(GitOps::new(repo_root, repo_slug));
        let sandbox = Arc::new(Sandbox::new(config.storage.memory_root.clone()));
        let harvester = Arc::new(Harvester::new(&config.storage.memory_root));

        let heart = Arc::new(Heart::new(
            creator.clone(),
            Arc::new(gateway.clone()),
            critic.clone(),
            staging.clone(),
            git_ops.clone(),
            sandbox.clone(),
            harvester.clone(),
            notifier,
            config.notifications.clone(),
            config.storage.memory_root.clone(),
            config.forge.max_refinements,
        ));

        let architect = Arc::new(Architect::new(config.storage.memory_root.clone()));

        Ok(Self {
            config,
            guardian,
            creator,
            gateway,
            gate,
            critic,
            staging,
            git_ops,
            sandbox,
            harvester,
            heart,
            architect,
        })
    }

    /// Builds a `Forge` borrowing this context's collaborators. Cheap to
    /// call repeatedly (once per mission dispatch); the returned value
    /// cannot outlive `self`.
    pub fn forge(&self) -> Forge<'_, HttpLlmGateway> {
        Forge::new(
            &self.creator,
            &self.gate,
            &self.critic,
            &self.staging,
            &self.git_ops,
            &self.config.forge,
        )
    }

    /// Builds a `Council` borrowing this context's collaborators plus the
    /// caller's already-constructed `Forge` (Council dispatches missions
    /// through it). Callers keep both bindings alive in the same scope:
    /// `let forge = ctx.forge(); let council = ctx.council(&forge);`.
    pub fn council<'a>(&'a self, forge: &'a Forge<'a, HttpLlmGateway>) -> crate::council::Council<'a, HttpLlmGateway> {
        crate::council::Council::new(
            &self.creator,
            &self.gateway,
            forge,
            &self.staging,
            &self.harvester,
            self.config.storage.memory_root.clone(),
            self.config.council.target_success,
        )
    }

    pub fn start_background_loops(self: &Arc<Self>, stop: Arc<std::sync::atomic::AtomicBool>) {
        self.heart.clone().spawn(stop.clone(), self.config.heart.poll_secs);
        self.architect.clone().spawn(stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_init_fails_without_api_keys() {
        for key in ["AGENT_API_KEY_GUARDIAN", "AGENT_API_KEY_CREATOR"] {
            unsafe {
                std::env::remove_var(key);
            }
        }
        let config = OrchestratorConfig::default();
        let result = OrchestratorContext::new(config, ".", "owner/repo");
        assert!(result.is_err());
    }
}
