use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tokio::process::Command;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());
static NON_ALNUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\s]").unwrap());
static PR_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/pull/(\d+)").unwrap());

const PROTECTED_BRANCH_ERROR: &str = "Protected branch rules not configured for this branch";
const PR_CLOSED_ERROR: &str = "Pull request is closed";

fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").to_string()
}

/// Strip ANSI, collapse punctuation and whitespace, so error strings from
/// `gh` can be matched against an ignore-list regardless of exact
/// formatting or terminal color codes.
fn normalize_error_message(text: &str) -> String {
    let clean = strip_ansi(text);
    let clean = NON_ALNUM_RE.replace_all(&clean, " ");
    clean.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn contains_normalized(haystack: &str, needle: &str) -> bool {
    normalize_error_message(haystack)
        .to_lowercase()
        .contains(&normalize_error_message(needle).to_lowercase())
}

pub fn extract_pr_number(pr_url: &str) -> Option<String> {
    PR_NUMBER_RE
        .captures(pr_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Thin async wrapper over the `gh` CLI for hosted PR-level operations:
/// merge, close, branch deletion, diff retrieval. Distinct from
/// [`crate::git`]'s synchronous local-repo plumbing (pull/commit/push/
/// worktree), which stays untouched.
pub struct GitOps {
    repo_root: PathBuf,
    repo_slug: String,
}

impl GitOps {
    pub fn new(repo_root: impl Into<PathBuf>, repo_slug: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            repo_slug: repo_slug.into(),
        }
    }

    /// Runs a `gh` subcommand with an explicit argv (never shell
    /// interpolation). Errors matching `ignored_errors` (after
    /// normalization) are returned without a logged error, since the
    /// caller treats them as an expected terminal state.
    async fn run_gh(&self, args: &[&str], ignored_errors: &[&str]) -> (bool, String) {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                (true, String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => {
                let err_msg = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let should_log = !ignored_errors
                    .iter()
                    .any(|ignored| contains_normalized(&err_msg, ignored));
                if should_log {
                    error!(args = ?args, error = %err_msg, "gh command failed");
                }
                (false, err_msg)
            }
            Err(e) => {
                error!(error = %e, "failed to spawn gh");
                (false, e.to_string())
            }
        }
    }

    pub async fn get_pr_diff(&self, pr_url: &str) -> String {
        let Some(pr_number) = extract_pr_number(pr_url) else {
            return String::new();
        };
        let (ok, output) = self.run_gh(&["pr", "diff", &pr_number], &[]).await;
        if ok {
            output
        } else {
            String::new()
        }
    }

    pub async fn get_pr_branch(&self, pr_url: &str) -> String {
        let Some(pr_number) = extract_pr_number(pr_url) else {
            return String::new();
        };
        let (ok, output) = self
            .run_gh(
                &["pr", "view", &pr_number, "--json", "headRefName", "-q", ".headRefName"],
                &[],
            )
            .await;
        if ok {
            output
        } else {
            String::new()
        }
    }

    pub async fn is_pr_merged(&self, pr_number: &str) -> bool {
        let (ok, output) = self.run_gh(&["pr", "view", pr_number, "--json", "state"], &[]).await;
        if !ok {
            return false;
        }
        serde_json::from_str::<serde_json::Value>(&output)
            .ok()
            .and_then(|v| v.get("state").and_then(|s| s.as_str()).map(str::to_string))
            .is_some_and(|state| state == "MERGED")
    }

    /// Merge a PR, retrying through the same fallback ladder as the
    /// original tooling: protected-branch-rules drops `--auto`,
    /// conflict/not-mergeable triggers an auto-rebase then one retry, and
    /// an already-closed PR resolves by checking whether it was merged.
    pub async fn merge_pr(&self, pr_url: &str, squash: bool) -> bool {
        let Some(pr_number) = extract_pr_number(pr_url) else {
            error!("invalid PR URL");
            return false;
        };

        let mut args: Vec<String> = vec![
            "pr".into(),
            "merge".into(),
            pr_number.clone(),
            "--auto".into(),
            "--delete-branch".into(),
        ];
        args.push(if squash { "--squash".into() } else { "--merge".into() });

        let ignored = [PROTECTED_BRANCH_ERROR, PR_CLOSED_ERROR];
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let (mut success, mut output) = self.run_gh(&args_ref, &ignored).await;

        if !success {
            if contains_normalized(&output, "pull request is closed") {
                warn!(%pr_number, "PR already closed, checking merge status");
                return if self.is_pr_merged(&pr_number).await {
                    info!(%pr_number, "PR was already merged");
                    true
                } else {
                    false
                };
            }

            if contains_normalized(&output, PROTECTED_BRANCH_ERROR) {
                warn!(%pr_number, "auto-merge not configured, retrying without --auto");
                args.retain(|a| a != "--auto");
                let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
                let retry = self.run_gh(&args_ref, &[]).await;
                success = retry.0;
                output = retry.1;
            } else if contains_normalized(&output, "not mergeable")
                || contains_normalized(&output, "conflict")
                || contains_normalized(&output, "cleanly created")
            {
                warn!(%pr_number, "PR has conflicts, attempting auto-rebase");
                if self.update_pr_branch(pr_url).await {
                    info!(%pr_number, "rebase succeeded, retrying merge");
                    sleep(Duration::from_secs(2)).await;
                    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
                    let retry = self.run_gh(&args_ref, &[]).await;
                    success = retry.0;
                    output = retry.1;
                    if success {
                        info!(%pr_number, "merged via auto-rebase");
                    } else {
                        error!(%pr_number, error = %output, "merge failed even after rebase");
                    }
                } else {
                    error!(%pr_number, "auto-rebase failed, manual intervention required");
                }
            }
        }

        if success {
            info!(%pr_number, "PR merged successfully");
        }
        success
    }

    pub async fn close_pr(&self, pr_url: &str) -> bool {
        let Some(pr_number) = extract_pr_number(pr_url) else {
            return false;
        };
        let (success, _) = self.run_gh(&["pr", "close", &pr_number], &[]).await;
        if success {
            info!(%pr_number, "PR closed");
        }
        success
    }

    /// Delete a remote branch via the GitHub API. Refuses to touch
    /// `main`/`master`. An already-deleted branch (404/422/"Reference
    /// does not exist") is treated as success.
    pub async fn delete_branch(&self, branch_name: &str) -> bool {
        if branch_name.is_empty() || branch_name == "main" || branch_name == "master" {
            warn!(%branch_name, "refusing to delete protected branch");
            return false;
        }

        let ignored = [
            "Reference does not exist",
            "422",
            "Not Found",
            "HTTP 422",
            "gh: Reference does not exist",
        ];
        let endpoint = format!("repos/{}/git/refs/heads/{branch_name}", self.repo_slug);
        let (success, output) = self
            .run_gh(&["api", "-X", "DELETE", &endpoint], &ignored)
            .await;

        if !success {
            for err in ignored {
                if contains_normalized(&output, err) {
                    info!(%branch_name, "branch already deleted or not found");
                    return true;
                }
            }
        }

        if success {
            info!(%branch_name, "branch deleted");
        }
        success
    }

    /// Close (or merge) a PR, then delete its branch if that succeeded.
    pub async fn cleanup_pr(&self, pr_url: &str, merge: bool) -> bool {
        let branch = self.get_pr_branch(pr_url).await;
        let success = if merge {
            self.merge_pr(pr_url, true).await
        } else {
            self.close_pr(pr_url).await
        };

        if !branch.is_empty() && success {
            self.delete_branch(&branch).await;
        }
        success
    }

    /// Update a PR branch with the latest base changes: rebase first,
    /// falling back to a merge-style update if the rebase fails.
    pub async fn update_pr_branch(&self, pr_url: &str) -> bool {
        let pr_number = match extract_pr_number(pr_url) {
            Some(n) => n,
            None if pr_url.chars().all(|c| c.is_ascii_digit()) && !pr_url.is_empty() => {
                pr_url.to_string()
            }
            None => return false,
        };

        info!(%pr_number, "attempting rebase update");
        let (success, output) = self
            .run_gh(&["pr", "update-branch", &pr_number, "--rebase"], &[])
            .await;
        if success {
            info!(%pr_number, "updated via rebase");
            return true;
        }
        debug!(%pr_number, error = %output, "rebase failed");

        warn!(%pr_number, "falling back to merge update");
        let (success, output) = self.run_gh(&["pr", "update-branch", &pr_number], &[]).await;
        if success {
            info!(%pr_number, "updated via merge");
            true
        } else {
            error!(%pr_number, error = %output, "failed to update branch");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_pr_number_from_url() {
        assert_eq!(
            extract_pr_number("https://github.com/owner/repo/pull/123"),
            Some("123".to_string())
        );
    }

    #[test]
    fn extract_pr_number_missing() {
        assert_eq!(extract_pr_number("https://github.com/owner/repo"), None);
    }

    #[test]
    fn normalize_strips_punctuation_and_ansi() {
        let raw = "\x1b[31mProtected branch rules not configured for this branch!\x1b[0m";
        assert_eq!(
            normalize_error_message(raw),
            "Protected branch rules not configured for this branch"
        );
    }

    #[test]
    fn contains_normalized_matches_regardless_of_case_and_formatting() {
        assert!(contains_normalized(
            "gh: HTTP 422: Reference does not exist (https://...)",
            "Reference does not exist"
        ));
    }

    #[tokio::test]
    async fn delete_branch_refuses_main() {
        let ops = GitOps::new(".", "owner/repo");
        assert!(!ops.delete_branch("main").await);
        assert!(!ops.delete_branch("master").await);
    }
}
