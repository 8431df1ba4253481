use crate::llm_gateway::{extract_json, GateError, LlmGateway, Route};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Trash,
    Refine,
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GapFix {
    pub action: String,
    pub points: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GapAnalysis {
    #[serde(default)]
    pub points_to_90: i64,
    #[serde(default)]
    pub fixes: Vec<GapFix>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub score: i64,
    pub verdict: Verdict,
    pub feedback: String,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    #[serde(default)]
    pub gap_analysis: GapAnalysis,
}

impl Judgment {
    fn trash(feedback: impl Into<String>) -> Self {
        Self {
            score: 0,
            verdict: Verdict::Trash,
            feedback: feedback.into(),
            critical_issues: Vec::new(),
            gap_analysis: GapAnalysis::default(),
        }
    }
}

/// Reviews a diff against project context and assigns a confidence score
/// in `0..=100`, splitting the range into Trash/Refine/Pass bands at
/// configurable thresholds.
pub struct QualityGate<G: LlmGateway> {
    gateway: G,
    pass_threshold: u8,
    trash_threshold: u8,
    max_diff_chars: usize,
}

impl<G: LlmGateway> QualityGate<G> {
    pub fn new(gateway: G, pass_threshold: u8, trash_threshold: u8, max_diff_chars: usize) -> Self {
        Self {
            gateway,
            pass_threshold,
            trash_threshold,
            max_diff_chars,
        }
    }

    pub async fn evaluate(&self, diff: &str, context: &str) -> Judgment {
        if diff.is_empty() {
            return Judgment::trash("No diff generated.");
        }

        info!("inspecting code quality");
        let sample = prepare_diff_sample(diff, self.max_diff_chars);

        let prompt = format!(
            "You are the Quality Inspector reviewing a proposed change.\n\n\
             PROJECT CONTEXT:\n{context}\n\n\
             PROPOSED DIFF (balanced sample, {total_len} chars total):\n```diff\n{sample}\n```\n\n\
             Score this code out of 100 against: security (0 if a forbidden pattern or \
             injection is present), robustness (error handling, types), conformance to the \
             stated context, and presence of tests for new code.\n\n\
             Scale: below {trash} is Trash (dangerous, hallucinated, or off-topic); \
             {trash}-{pass_minus_one} is Refine (right direction, not finished); \
             {pass}-100 is Pass (ready to merge).\n\n\
             If the score is below {pass}, you MUST include a gap analysis: an exact list of \
             changes needed to reach {pass}, with an estimated point value for each, naming \
             concrete files/functions/lines.\n\n\
             Respond with strict JSON:\n\
             {{\"score\": 0-100, \"feedback\": \"...\", \"critical_issues\": [...], \
             \"gap_analysis\": {{\"points_to_90\": 0, \"fixes\": [{{\"action\": \"...\", \"points\": 0}}]}}}}",
            total_len = diff.len(),
            trash = self.trash_threshold,
            pass_minus_one = self.pass_threshold.saturating_sub(1),
            pass = self.pass_threshold,
        );

        match self.run(&prompt).await {
            Ok(judgment) => {
                info!(score = judgment.score, verdict = ?judgment.verdict, "gate verdict");
                judgment
            }
            Err(e) => {
                error!(error = %e, "gate evaluation failed");
                Judgment::trash(format!("Gate error: {e}"))
            }
        }
    }

    async fn run(&self, prompt: &str) -> Result<Judgment, GateError> {
        let response = self.gateway.route(prompt, Route::Fast).await?;
        let parsed = extract_json(&response)?;

        let score = parsed
            .get("score")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .clamp(0, 100);
        let verdict = if score < self.trash_threshold as i64 {
            Verdict::Trash
        } else if score < self.pass_threshold as i64 {
            Verdict::Refine
        } else {
            Verdict::Pass
        };

        let feedback = parsed
            .get("feedback")
            .and_then(|v| v.as_str())
            .unwrap_or("No feedback provided.")
            .to_string();
        let critical_issues = parsed
            .get("critical_issues")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|x| x.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let gap_analysis = parsed
            .get("gap_analysis")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Ok(Judgment {
            score,
            verdict,
            feedback,
            critical_issues,
            gap_analysis,
        })
    }
}

struct FileChunk {
    header: String,
    lines: Vec<String>,
    kind: FileKind,
}

#[derive(PartialEq)]
enum FileKind {
    New,
    Deleted,
    Modified,
}

/// Balanced sample of a large diff: all file headers (capped at 20), then
/// a 60/30/10 character budget split across new/modified/deleted files so
/// new-file additions aren't crowded out by earlier deletions.
fn prepare_diff_sample(diff: &str, max_chars: usize) -> String {
    if diff.len() <= max_chars {
        return diff.to_string();
    }

    let mut chunks: Vec<FileChunk> = Vec::new();
    for line in diff.lines() {
        if line.starts_with("diff --git") {
            chunks.push(FileChunk {
                header: line.to_string(),
                lines: vec![line.to_string()],
                kind: FileKind::Modified,
            });
        } else if let Some(chunk) = chunks.last_mut() {
            chunk.lines.push(line.to_string());
        }
    }

    for chunk in &mut chunks {
        let head: String = chunk.lines.iter().take(5).cloned().collect::<Vec<_>>().join("\n");
        chunk.kind = if head.contains("+++ b/") && head.contains("/dev/null") {
            FileKind::New
        } else if head.contains("+++ /dev/null") {
            FileKind::Deleted
        } else {
            FileKind::Modified
        };
    }

    let mut out = Vec::new();
    out.push(format!("# DIFF SUMMARY: {} files changed", chunks.len()));
    for chunk in chunks.iter().take(20) {
        let parts: Vec<&str> = chunk.header.split(' ').collect();
        if parts.len() >= 4 {
            out.push(format!("# - {} -> {}", parts[2], parts[3]));
        }
    }
    out.push(String::new());
    out.push("# --- SAMPLE OF CHANGES ---".to_string());
    out.push(String::new());

    let header_len: usize = out.iter().map(|l| l.len() + 1).sum();
    let budget = max_chars.saturating_sub(header_len);

    for (kind, ratio) in [
        (FileKind::New, 0.6),
        (FileKind::Modified, 0.3),
        (FileKind::Deleted, 0.1),
    ] {
        let file_budget = (budget as f64 * ratio) as usize;
        let mut used = 0usize;
        for chunk in chunks.iter().filter(|c| c.kind == kind) {
            let text = chunk.lines.join("\n");
            if used + text.len() < file_budget {
                out.extend(chunk.lines.clone());
                used += text.len();
            } else if used < file_budget {
                let remaining = file_budget - used;
                let truncated: String = text.chars().take(remaining).collect();
                out.push(truncated);
                out.push("# ... (truncated)".to_string());
                break;
            }
        }
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Canned(&'static str);

    #[async_trait]
    impl LlmGateway for Canned {
        async fn route(&self, _prompt: &str, _route: Route) -> Result<String, GateError> {
            Ok(self.0.to_string())
        }
    }

    fn gate(response: &'static str) -> QualityGate<Canned> {
        QualityGate::new(Canned(response), 85, 50, 12_000)
    }

    #[tokio::test]
    async fn empty_diff_is_trash_without_calling_gateway() {
        let g = gate(r#"{"score": 99}"#);
        let judgment = g.evaluate("", "ctx").await;
        assert_eq!(judgment.verdict, Verdict::Trash);
        assert_eq!(judgment.score, 0);
    }

    #[tokio::test]
    async fn low_score_is_trash() {
        let g = gate(r#"{"score": 20, "feedback": "bad"}"#);
        let judgment = g.evaluate("diff --git a b\n+x", "ctx").await;
        assert_eq!(judgment.verdict, Verdict::Trash);
    }

    #[tokio::test]
    async fn mid_score_is_refine() {
        let g = gate(r#"{"score": 70, "feedback": "close"}"#);
        let judgment = g.evaluate("diff --git a b\n+x", "ctx").await;
        assert_eq!(judgment.verdict, Verdict::Refine);
    }

    #[tokio::test]
    async fn high_score_is_pass() {
        let g = gate(r#"{"score": 95, "feedback": "great"}"#);
        let judgment = g.evaluate("diff --git a b\n+x", "ctx").await;
        assert_eq!(judgment.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn out_of_range_score_is_clamped() {
        let g = gate(r#"{"score": 150, "feedback": "great"}"#);
        let judgment = g.evaluate("diff --git a b\n+x", "ctx").await;
        assert_eq!(judgment.score, 100);
        assert_eq!(judgment.verdict, Verdict::Pass);

        let g = gate(r#"{"score": -20, "feedback": "bad"}"#);
        let judgment = g.evaluate("diff --git a b\n+x", "ctx").await;
        assert_eq!(judgment.score, 0);
        assert_eq!(judgment.verdict, Verdict::Trash);
    }

    #[tokio::test]
    async fn malformed_response_is_trash() {
        let g = gate("not json");
        let judgment = g.evaluate("diff --git a b\n+x", "ctx").await;
        assert_eq!(judgment.verdict, Verdict::Trash);
    }

    #[test]
    fn small_diff_is_unsampled() {
        let diff = "diff --git a/x b/x\n+hello";
        assert_eq!(prepare_diff_sample(diff, 12_000), diff);
    }

    #[test]
    fn large_diff_is_sampled_within_budget() {
        let mut diff = String::new();
        for i in 0..50 {
            diff.push_str(&format!(
                "diff --git a/file{i}.rs b/file{i}.rs\n+++ b/file{i}.rs\n+fn f{i}() {{}}\n"
            ));
        }
        let sample = prepare_diff_sample(&diff, 500);
        assert!(sample.len() <= 500 + 200);
        assert!(sample.starts_with("# DIFF SUMMARY"));
    }
}
