use crate::llm_gateway::{extract_json, LlmGateway, Route};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCritique {
    pub approved: bool,
    pub confidence: i64,
    pub critique: String,
    pub improvement_prompt: String,
}

impl PlanCritique {
    fn fail_open(reason: &str) -> Self {
        Self {
            approved: true,
            confidence: 50,
            critique: reason.to_string(),
            improvement_prompt: String::new(),
        }
    }
}

/// Adversarial reviewer for auto-approved plans: reviews a proposed plan
/// for feasibility, safety, and completeness before any code is written.
/// On gateway failure it fails open (approves with confidence 50) so a
/// critic outage never deadlocks the refinement loop.
pub struct PlanCritic<G: LlmGateway> {
    gateway: G,
}

impl<G: LlmGateway> PlanCritic<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    pub async fn critique_plan(&self, task_description: &str, plan_text: &str) -> PlanCritique {
        info!("reviewing plan");

        let prompt = format!(
            "ROLE: You are the Planning Critic. Your goal is to reduce task failure by \
             finding flaws in a plan before execution.\n\n\
             ORIGINAL TASK:\n\"{task_description}\"\n\n\
             PROPOSED PLAN:\n\"\"\"\n{plan_text}\n\"\"\"\n\n\
             Critique this plan ruthlessly but constructively. Check: feasibility (are files \
             missing?), safety (forbidden imports like os.system), completeness (does it solve \
             the whole task?), and whether the steps are logical.\n\n\
             Respond with strict JSON:\n\
             {{\"approved\": true/false, \"confidence\": 0-100, \"critique\": \"...\", \
             \"improvement_prompt\": \"instruction to fix the plan\"}}"
        );

        match self.gateway.route(&prompt, Route::Pro).await {
            Ok(response) => match extract_json(&response) {
                Ok(parsed) => PlanCritique {
                    approved: parsed
                        .get("approved")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    confidence: parsed
                        .get("confidence")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(50),
                    critique: parsed
                        .get("critique")
                        .and_then(|v| v.as_str())
                        .unwrap_or("No critique provided")
                        .to_string(),
                    improvement_prompt: parsed
                        .get("improvement_prompt")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Please refine the plan based on feedback.")
                        .to_string(),
                },
                Err(e) => {
                    error!(error = %e, "failed to parse critic response");
                    PlanCritique::fail_open("Critic response unparsable - auto-passing")
                }
            },
            Err(e) => {
                error!(error = %e, "failed to critique plan");
                PlanCritique::fail_open("Critic unavailable - auto-passing")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_gateway::GateError;
    use async_trait::async_trait;

    struct Canned(Result<&'static str, ()>);

    #[async_trait]
    impl LlmGateway for Canned {
        async fn route(&self, _prompt: &str, _route: Route) -> Result<String, GateError> {
            self.0.map(str::to_string).map_err(|_| {
                GateError::Gateway {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "down".into(),
                }
            })
        }
    }

    #[tokio::test]
    async fn approved_plan_parses() {
        let critic = PlanCritic::new(Canned(Ok(
            r#"{"approved": true, "confidence": 92, "critique": "solid", "improvement_prompt": ""}"#,
        )));
        let result = critic.critique_plan("do x", "step 1, step 2").await;
        assert!(result.approved);
        assert_eq!(result.confidence, 92);
    }

    #[tokio::test]
    async fn rejected_plan_parses() {
        let critic = PlanCritic::new(Canned(Ok(
            r#"{"approved": false, "confidence": 30, "critique": "missing tests", "improvement_prompt": "add tests"}"#,
        )));
        let result = critic.critique_plan("do x", "step 1").await;
        assert!(!result.approved);
        assert_eq!(result.improvement_prompt, "add tests");
    }

    #[tokio::test]
    async fn gateway_failure_fails_open() {
        let critic = PlanCritic::new(Canned(Err(())));
        let result = critic.critique_plan("do x", "step 1").await;
        assert!(result.approved);
        assert_eq!(result.confidence, 50);
    }

    #[tokio::test]
    async fn malformed_response_fails_open() {
        let critic = PlanCritic::new(Canned(Ok("not json")));
        let result = critic.critique_plan("do x", "step 1").await;
        assert!(result.approved);
        assert_eq!(result.confidence, 50);
    }
}
