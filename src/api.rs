//! HTTP surface for the orchestrator: staged-project review and decisions,
//! council status/triggering, and notification config, mirroring the
//! endpoint contract the nightly council's companion dashboard depends on.

use crate::config::NotificationConfig;
use crate::council::{morning_brief_path, ExecutionReport, MorningBrief};
use crate::forge::MissionOutcome;
use crate::state::OrchestratorContext;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct ApiState {
    ctx: Arc<OrchestratorContext>,
}

impl ApiState {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/morning-brief", get(morning_brief))
        .route("/staged-projects", get(staged_projects))
        .route("/project/{id}", get(project))
        .route("/project/{id}/diff", get(project_diff))
        .route("/project/{id}/files", get(project_files))
        .route("/project/{id}/decision", post(project_decision))
        .route("/rejected", get(rejected))
        .route("/stats", get(stats))
        .route("/council-stats", get(council_stats))
        .route("/history", get(history))
        .route("/notifications", get(notifications_get).post(notifications_set))
        .route("/council/start", post(council_start))
        .route("/council/status", get(council_status))
        .with_state(Arc::new(state))
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: message.into() })).into_response()
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct StatusBody {
    probation: bool,
    staged_count: usize,
    council_running: bool,
}

async fn status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let body = StatusBody {
        probation: state.ctx.sandbox.check_probation(),
        staged_count: state.ctx.staging.list_staged_projects().len(),
        council_running: state.ctx.architect.is_council_running(),
    };
    Json(body)
}

async fn morning_brief(State(state): State<Arc<ApiState>>) -> Response {
    let path = morning_brief_path(&state.ctx.config.storage.memory_root);
    match std::fs::read_to_string(&path).ok().and_then(|data| serde_json::from_str::<MorningBrief>(&data).ok()) {
        Some(brief) => Json(brief).into_response(),
        None => not_found("no morning brief available"),
    }
}

async fn staged_projects(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.ctx.staging.list_staged_projects())
}

async fn project(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.ctx.staging.get_project(&id) {
        Some(project) => Json(project).into_response(),
        None => not_found("project not found"),
    }
}

async fn project_diff(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.ctx.staging.get_project_diff(&id) {
        Some(diff) => diff.into_response(),
        None => not_found("diff not found"),
    }
}

async fn project_files(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> impl IntoResponse {
    Json(state.ctx.staging.get_project_files(&id))
}

#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum DecisionAction {
    Merge,
    Pending,
    Reject,
}

#[derive(Deserialize)]
struct DecisionRequest {
    action: DecisionAction,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct DecisionResponse {
    success: bool,
    message: String,
}

async fn project_decision(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Response {
    let outcome = match req.action {
        DecisionAction::Merge => state.ctx.staging.accept_project(&id, &state.ctx.git_ops).await,
        DecisionAction::Pending => match state.ctx.staging.set_pending(&id) {
            Ok(()) => crate::staging::AcceptOutcome {
                success: true,
                message: "Project set to pending".into(),
            },
            Err(e) => crate::staging::AcceptOutcome {
                success: false,
                message: e.to_string(),
            },
        },
        DecisionAction::Reject => match state
            .ctx
            .staging
            .reject_project(&id, req.reason.as_deref(), &state.ctx.git_ops)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => crate::staging::AcceptOutcome {
                success: false,
                message: e.to_string(),
            },
        },
    };

    let status = if outcome.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (
        status,
        Json(DecisionResponse {
            success: outcome.success,
            message: outcome.message,
        }),
    )
        .into_response()
}

async fn rejected(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.ctx.staging.list_rejected())
}

#[derive(Serialize)]
struct StatsBody {
    staged: usize,
    pending: usize,
    rejected: usize,
    accepted: usize,
}

async fn stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let staged_projects = state.ctx.staging.list_staged_projects();
    let pending = staged_projects
        .iter()
        .filter(|p| p.status == crate::staging::ProjectStatus::Pending)
        .count();
    let staged = staged_projects
        .iter()
        .filter(|p| p.status == crate::staging::ProjectStatus::Staged)
        .count();
    let rejected = state.ctx.staging.list_rejected().len();
    let accepted = state.ctx.staging.merge_history().len();

    Json(StatsBody {
        staged,
        pending,
        rejected,
        accepted,
    })
}

#[derive(Serialize)]
struct CouncilStatsBody {
    last_council_date: Option<String>,
    success_rate: f64,
    avg_score: f64,
    total_missions: usize,
    total_prs_created: usize,
}

async fn council_stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let path = state.ctx.config.storage.memory_root.join("nightly_execution.json");
    let report: Option<ExecutionReport> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok());

    let merged_count = state.ctx.staging.merge_history().len();

    let body = match report {
        Some(report) => {
            let success_rate = if report.total_attempted > 0 {
                report.achieved as f64 / report.total_attempted as f64
            } else {
                0.0
            };
            let scores: Vec<i64> = report
                .results
                .iter()
                .filter_map(|r| match &r.outcome {
                    MissionOutcome::Success { score, .. } => Some(*score),
                    _ => None,
                })
                .collect();
            let avg_score = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<i64>() as f64 / scores.len() as f64
            };
            let prs_created = report
                .results
                .iter()
                .filter(|r| matches!(r.outcome, MissionOutcome::Success { .. }))
                .count();

            CouncilStatsBody {
                last_council_date: Some(report.date),
                success_rate,
                avg_score,
                total_missions: report.total_attempted,
                total_prs_created: prs_created + merged_count,
            }
        }
        None => CouncilStatsBody {
            last_council_date: None,
            success_rate: 0.0,
            avg_score: 0.0,
            total_missions: 0,
            total_prs_created: merged_count,
        },
    };

    Json(body)
}

#[derive(Serialize)]
struct HistoryBody {
    merged: Vec<crate::staging::MergeRecord>,
    rejected: Vec<crate::staging::StagedProject>,
}

async fn history(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let mut merged = state.ctx.staging.merge_history();
    let start = merged.len().saturating_sub(5);
    let merged = merged.split_off(start);

    let mut rejected = state.ctx.staging.list_rejected();
    let start = rejected.len().saturating_sub(5);
    let rejected = rejected.split_off(start);

    Json(HistoryBody { merged, rejected })
}

async fn notifications_get(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.ctx.config.notifications.clone())
}

async fn notifications_set(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<NotificationConfig>,
) -> impl IntoResponse {
    let path = state.ctx.config.storage.memory_root.join("notifications.json");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                error!(error = %e, "failed to persist notification config");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(config)).into_response();
            }
            (StatusCode::OK, Json(config)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct CouncilStartResponse {
    success: bool,
    message: String,
    started_at: Option<DateTime<Utc>>,
}

async fn council_start(State(state): State<Arc<ApiState>>) -> Response {
    let Some(started_at) = state.ctx.architect.try_start_council() else {
        return (
            StatusCode::CONFLICT,
            Json(CouncilStartResponse {
                success: false,
                message: "council already running".into(),
                started_at: state.ctx.architect.council_started_at(),
            }),
        )
            .into_response();
    };

    let ctx = state.ctx.clone();
    tokio::spawn(async move {
        let forge = ctx.forge();
        let council = ctx.council(&forge);
        ctx.architect.convene_council(&council).await;
    });

    Json(CouncilStartResponse {
        success: true,
        message: "council started".into(),
        started_at: Some(started_at),
    })
    .into_response()
}

#[derive(Serialize)]
struct CouncilStatusResponse {
    running: bool,
    started_at: Option<DateTime<Utc>>,
}

async fn council_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(CouncilStatusResponse {
        running: state.ctx.architect.is_council_running(),
        started_at: state.ctx.architect.council_started_at(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_action_parses_from_uppercase() {
        let req: DecisionRequest = serde_json::from_str(r#"{"action":"MERGE"}"#).unwrap();
        assert!(matches!(req.action, DecisionAction::Merge));
    }

    #[test]
    fn decision_action_rejects_unknown() {
        let result: Result<DecisionRequest, _> = serde_json::from_str(r#"{"action":"NUKE"}"#);
        assert!(result.is_err());
    }
}
