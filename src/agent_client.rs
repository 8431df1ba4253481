use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, error, info, warn};

const DEFAULT_BASE_URL: &str = "https://agent-sessions.googleapis.com/v1alpha";

/// Dual-key operating mode: Guardian sessions auto-approve plans and favor
/// fast healing; Creator sessions require a human (or the Planning Critic)
/// to approve the plan before execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProfile {
    Guardian,
    Creator,
}

impl AgentProfile {
    fn env_key(self) -> &'static str {
        match self {
            AgentProfile::Guardian => "AGENT_API_KEY_GUARDIAN",
            AgentProfile::Creator => "AGENT_API_KEY_CREATOR",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    #[error("missing API key for profile {0:?} (set {1})")]
    MissingApiKey(AgentProfile, &'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("agent API returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("no source available for session")]
    NoSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub id: String,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Planning,
    AwaitingPlanApproval,
    Executing,
    PrOpen,
    Completed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub title: String,
    pub status: SessionStatus,
    pub pr_url: Option<String>,
    pub pr_title: Option<String>,
    pub pr_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Activity {
    #[serde(default, rename = "createTime")]
    pub create_time: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
    #[serde(default, rename = "planGenerated")]
    pub plan_generated: Option<serde_json::Value>,
}

/// HTTP client for the hosted coding-agent API. Wraps session lifecycle
/// (create/get/list), plan inspection/approval, and the newest-first patch
/// scan used to pull the actual diff out of session activities.
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    profile: AgentProfile,
    source_cache: std::sync::Mutex<Option<String>>,
}

impl AgentClient {
    pub fn new(profile: AgentProfile) -> Result<Self, AgentClientError> {
        let key = env::var(profile.env_key())
            .map_err(|_| AgentClientError::MissingApiKey(profile, profile.env_key()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Goog-Api-Key",
            reqwest::header::HeaderValue::from_str(&key)
                .map_err(|_| AgentClientError::MissingApiKey(profile, profile.env_key()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        debug!(?profile, "agent client initialized");

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            profile,
            source_cache: std::sync::Mutex::new(None),
        })
    }

    fn session_path(session_id: &str) -> String {
        if session_id.starts_with("sessions/") {
            session_id.to_string()
        } else {
            format!("sessions/{session_id}")
        }
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, AgentClientError> {
        let url = format!("{}/sources", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "list_sources failed");
            return Ok(Vec::new());
        }
        let data: serde_json::Value = resp.json().await?;
        let sources = data
            .get("sources")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|src| {
                        let gh = src.get("githubRepo").cloned().unwrap_or_default();
                        Source {
                            name: src
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            id: src
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            owner: gh
                                .get("owner")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            repo: gh
                                .get("repo")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(sources)
    }

    /// Resolve and cache a default source, preferring one whose repo name
    /// contains `prefer_repo_hint`.
    pub async fn get_default_source(
        &self,
        prefer_repo_hint: &str,
    ) -> Result<String, AgentClientError> {
        if let Some(cached) = self.source_cache.lock().unwrap().clone() {
            return Ok(cached);
        }

        let sources = self.list_sources().await?;
        let chosen = sources
            .iter()
            .find(|s| s.repo.to_lowercase().contains(&prefer_repo_hint.to_lowercase()))
            .or_else(|| sources.first())
            .map(|s| s.name.clone())
            .ok_or(AgentClientError::NoSource)?;

        *self.source_cache.lock().unwrap() = Some(chosen.clone());
        Ok(chosen)
    }

    pub async fn create_session(
        &self,
        prompt: &str,
        title: &str,
        source: &str,
        starting_branch: &str,
        require_plan_approval: bool,
    ) -> Result<Session, AgentClientError> {
        let mut payload = serde_json::json!({
            "prompt": prompt,
            "title": title,
            "sourceContext": {
                "source": source,
                "githubRepoContext": { "startingBranch": starting_branch },
            },
            "automationMode": "AUTO_CREATE_PR",
        });
        if require_plan_approval {
            payload["requirePlanApproval"] = serde_json::Value::Bool(true);
        }

        info!(%title, "creating session");
        let url = format!("{}/sessions", self.base_url);
        let resp = self.http.post(&url).json(&payload).send().await?;
        self.parse_session_response(resp, title).await
    }

    /// Create a repoless (serverless sandbox) session: no `sourceContext`.
    pub async fn create_repoless_session(
        &self,
        prompt: &str,
        title: &str,
    ) -> Result<Session, AgentClientError> {
        let payload = serde_json::json!({ "prompt": prompt, "title": title });
        info!(%title, "creating repoless session");
        let url = format!("{}/sessions", self.base_url);
        let resp = self.http.post(&url).json(&payload).send().await?;
        self.parse_session_response(resp, title).await
    }

    async fn parse_session_response(
        &self,
        resp: reqwest::Response,
        fallback_title: &str,
    ) -> Result<Session, AgentClientError> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentClientError::Api { status, body });
        }
        let data: serde_json::Value = resp.json().await?;
        Ok(Session {
            id: data.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            name: data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            title: data
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or(fallback_title)
                .to_string(),
            status: SessionStatus::Pending,
            pr_url: None,
            pr_title: None,
            pr_description: None,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, AgentClientError> {
        let url = format!("{}/{}", self.base_url, Self::session_path(session_id));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let data: serde_json::Value = resp.json().await?;

        let mut pr_url = None;
        let mut pr_title = None;
        let mut pr_description = None;
        if let Some(outputs) = data.get("outputs").and_then(|v| v.as_array()) {
            for output in outputs {
                if let Some(pr) = output.get("pullRequest") {
                    pr_url = pr.get("url").and_then(|v| v.as_str()).map(str::to_string);
                    pr_title = pr.get("title").and_then(|v| v.as_str()).map(str::to_string);
                    pr_description = pr
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    break;
                }
            }
        }

        let api_state = data.get("state").and_then(|v| v.as_str()).unwrap_or("");
        let status = if pr_url.is_some() {
            SessionStatus::PrOpen
        } else {
            match api_state {
                "AWAITING_PLAN_APPROVAL" => SessionStatus::AwaitingPlanApproval,
                "EXECUTING" => SessionStatus::Executing,
                "PLANNING" => SessionStatus::Planning,
                "FAILED" => SessionStatus::Failed,
                "COMPLETED" => SessionStatus::Completed,
                _ => SessionStatus::Pending,
            }
        };

        Ok(Some(Session {
            id: data.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            name: data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            title: data.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            status,
            pr_url,
            pr_title,
            pr_description,
        }))
    }

    pub async fn send_message(&self, session_id: &str, prompt: &str) -> Result<bool, AgentClientError> {
        let url = format!(
            "{}/{}:sendMessage",
            self.base_url,
            Self::session_path(session_id)
        );
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    pub async fn approve_plan(&self, session_id: &str) -> Result<bool, AgentClientError> {
        let url = format!(
            "{}/{}:approvePlan",
            self.base_url,
            Self::session_path(session_id)
        );
        let resp = self.http.post(&url).json(&serde_json::json!({})).send().await?;
        let ok = resp.status().is_success();
        if ok {
            info!(%session_id, "plan approved");
        } else {
            warn!(%session_id, "approve_plan failed");
        }
        Ok(ok)
    }

    pub async fn get_activities(
        &self,
        session_id: &str,
        page_size: u32,
    ) -> Result<Vec<Activity>, AgentClientError> {
        let url = format!(
            "{}/{}/activities?pageSize={page_size}",
            self.base_url,
            Self::session_path(session_id)
        );
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let data: serde_json::Value = resp.json().await?;
        let activities = data
            .get("activities")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok(activities)
    }

    /// Scan activities newest-first for the most recent unidiff patch.
    /// Activities are returned oldest-first by the API; after a refinement
    /// round the new patch is appended at the end, so we must reverse.
    pub async fn get_git_patch(&self, session_id: &str) -> Result<Option<String>, AgentClientError> {
        let activities = self.get_activities(session_id, 50).await?;
        for activity in activities.iter().rev() {
            for artifact in &activity.artifacts {
                if let Some(patch) = artifact
                    .get("changeSet")
                    .and_then(|cs| cs.get("gitPatch"))
                    .and_then(|gp| gp.get("unidiffPatch"))
                    .and_then(|v| v.as_str())
                {
                    debug!(len = patch.len(), "found git patch");
                    return Ok(Some(patch.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Scan activities oldest-first for the first generated plan.
    pub async fn get_plan(&self, session_id: &str) -> Result<Option<Plan>, AgentClientError> {
        let activities = self.get_activities(session_id, 20).await?;
        for activity in &activities {
            if let Some(plan_generated) = &activity.plan_generated {
                if let Some(plan) = plan_generated.get("plan") {
                    if let Ok(plan) = serde_json::from_value::<Plan>(plan.clone()) {
                        debug!(steps = plan.steps.len(), "found plan");
                        return Ok(Some(plan));
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_path_adds_prefix() {
        assert_eq!(AgentClient::session_path("123"), "sessions/123");
        assert_eq!(AgentClient::session_path("sessions/123"), "sessions/123");
    }

    #[test]
    fn env_key_differs_by_profile() {
        assert_ne!(
            AgentProfile::Guardian.env_key(),
            AgentProfile::Creator.env_key()
        );
    }

    #[test]
    fn new_errors_without_api_key() {
        unsafe {
            env::remove_var("AGENT_API_KEY_GUARDIAN");
        }
        let result = AgentClient::new(AgentProfile::Guardian);
        assert!(result.is_err());
    }
}
