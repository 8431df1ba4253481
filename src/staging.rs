use crate::git_ops::GitOps;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Staged,
    Pending,
    Merged,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedProject {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    pub staged_at: String,
    #[serde(default = "default_status")]
    pub status: ProjectStatus,
    #[serde(default)]
    pub files_count: usize,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
    #[serde(default)]
    pub rejected_at: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

fn default_status() -> ProjectStatus {
    ProjectStatus::Staged
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    NotFound(String),
}

pub struct AcceptOutcome {
    pub success: bool,
    pub message: String,
}

/// Manages the lifecycle of a proposed project from staging (awaiting
/// human review) to a terminal decision: `accept_project` merges the PR
/// and discards the staging folder, `reject_project` closes the PR,
/// deletes its branch, and demotes the record to a metadata-only entry
/// under the rejected folder so the same idea isn't proposed again.
pub struct StagingStore {
    staging_dir: PathBuf,
    rejected_dir: PathBuf,
    merge_history_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: String,
    pub title: String,
    pub pr_url: Option<String>,
    pub merged_at: String,
}

impl StagingStore {
    pub fn new(memory_root: impl AsRef<Path>) -> Result<Self, StagingError> {
        let staging_dir = memory_root.as_ref().join("staging");
        let rejected_dir = memory_root.as_ref().join("rejected");
        std::fs::create_dir_all(&staging_dir)?;
        std::fs::create_dir_all(&rejected_dir)?;
        Ok(Self {
            staging_dir,
            rejected_dir,
            merge_history_file: memory_root.as_ref().join("merge_history.json"),
        })
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.staging_dir.join(project_id)
    }

    pub fn merge_history(&self) -> Vec<MergeRecord> {
        std::fs::read_to_string(&self.merge_history_file)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    fn append_merge_history(&self, record: MergeRecord) {
        let mut history = self.merge_history();
        history.push(record);
        if let Ok(json) = serde_json::to_string_pretty(&history) {
            if let Err(e) = std::fs::write(&self.merge_history_file, json) {
                warn!(error = %e, "failed to append merge history");
            }
        }
    }

    pub fn stage_project(
        &self,
        project_id: &str,
        title: &str,
        session_id: &str,
        files: &[FileChange],
        patch: &str,
        pr_url: Option<String>,
        description: Option<String>,
    ) -> Result<(), StagingError> {
        let dir = self.project_dir(project_id);
        std::fs::create_dir_all(&dir)?;

        let additions = files.iter().map(|f| f.additions).sum();
        let deletions = files.iter().map(|f| f.deletions).sum();

        let metadata = StagedProject {
            id: project_id.to_string(),
            title: title.to_string(),
            description,
            session_id: session_id.to_string(),
            pr_url,
            staged_at: Utc::now().to_rfc3339(),
            status: ProjectStatus::Staged,
            files_count: files.len(),
            additions,
            deletions,
            rejected_at: None,
            rejection_reason: None,
        };

        std::fs::write(dir.join("metadata.json"), serde_json::to_string_pretty(&metadata)?)?;

        if !patch.is_empty() {
            std::fs::write(dir.join("diff.patch"), patch)?;
        }
        if !files.is_empty() {
            std::fs::write(dir.join("files.json"), serde_json::to_string_pretty(files)?)?;
        }

        info!(%project_id, files = files.len(), "project staged");
        Ok(())
    }

    pub fn list_staged_projects(&self) -> Vec<StagedProject> {
        let Ok(entries) = std::fs::read_dir(&self.staging_dir) else {
            return Vec::new();
        };

        let mut projects: Vec<StagedProject> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let metadata_file = e.path().join("metadata.json");
                let data = std::fs::read_to_string(&metadata_file).ok()?;
                match serde_json::from_str(&data) {
                    Ok(project) => Some(project),
                    Err(err) => {
                        warn!(path = %metadata_file.display(), %err, "failed to load staged project");
                        None
                    }
                }
            })
            .collect();

        projects.sort_by(|a, b| b.staged_at.cmp(&a.staged_at));
        projects
    }

    pub fn get_project(&self, project_id: &str) -> Option<StagedProject> {
        let data = std::fs::read_to_string(self.project_dir(project_id).join("metadata.json")).ok()?;
        serde_json::from_str(&data).ok()
    }

    pub fn get_project_diff(&self, project_id: &str) -> Option<String> {
        std::fs::read_to_string(self.project_dir(project_id).join("diff.patch")).ok()
    }

    pub fn get_project_files(&self, project_id: &str) -> Vec<FileChange> {
        std::fs::read_to_string(self.project_dir(project_id).join("files.json"))
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    fn update_status(&self, project_id: &str, status: ProjectStatus) -> Result<(), StagingError> {
        let metadata_file = self.project_dir(project_id).join("metadata.json");
        let data = std::fs::read_to_string(&metadata_file)?;
        let mut project: StagedProject = serde_json::from_str(&data)?;
        project.status = status;
        std::fs::write(&metadata_file, serde_json::to_string_pretty(&project)?)?;
        Ok(())
    }

    pub fn set_pending(&self, project_id: &str) -> Result<(), StagingError> {
        self.update_status(project_id, ProjectStatus::Pending)?;
        info!(%project_id, "project set to pending");
        Ok(())
    }

    /// Merge the project's PR (if any) and delete its staging folder.
    pub async fn accept_project(&self, project_id: &str, git_ops: &GitOps) -> AcceptOutcome {
        let Some(project) = self.get_project(project_id) else {
            return AcceptOutcome {
                success: false,
                message: "Project not found".into(),
            };
        };

        if let Some(pr_url) = &project.pr_url {
            if !git_ops.merge_pr(pr_url, true).await {
                return AcceptOutcome {
                    success: false,
                    message: "Failed to merge PR".into(),
                };
            }
        }

        let _ = self.update_status(project_id, ProjectStatus::Merged);
        self.append_merge_history(MergeRecord {
            id: project.id.clone(),
            title: project.title.clone(),
            pr_url: project.pr_url.clone(),
            merged_at: Utc::now().to_rfc3339(),
        });
        let dir = self.project_dir(project_id);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!(%project_id, error = %e, "failed to remove staging dir after accept");
        }

        info!(%project_id, "project accepted");
        AcceptOutcome {
            success: true,
            message: "Project merged successfully".into(),
        }
    }

    /// Close the PR without merging, delete its branch, demote the record
    /// to a metadata-only entry under the rejected folder, and discard the
    /// staging folder's files.
    pub async fn reject_project(
        &self,
        project_id: &str,
        reason: Option<&str>,
        git_ops: &GitOps,
    ) -> Result<AcceptOutcome, StagingError> {
        let dir = self.project_dir(project_id);
        if !dir.exists() {
            return Ok(AcceptOutcome {
                success: false,
                message: "Project not found".into(),
            });
        }

        let metadata_file = dir.join("metadata.json");
        let data = std::fs::read_to_string(&metadata_file)?;
        let mut project: StagedProject = serde_json::from_str(&data)?;

        if let Some(pr_url) = project.pr_url.clone() {
            if !git_ops.cleanup_pr(&pr_url, false).await {
                warn!(%project_id, "github cleanup failed, continuing");
            } else {
                info!(%project_id, "cleaned up PR and branch");
            }
        }

        project.status = ProjectStatus::Rejected;
        project.rejected_at = Some(Utc::now().to_rfc3339());
        if let Some(reason) = reason {
            project.rejection_reason = Some(reason.to_string());
        }

        let rejected_dest = self.rejected_dir.join(project_id);
        std::fs::create_dir_all(&rejected_dest)?;
        std::fs::write(
            rejected_dest.join("metadata.json"),
            serde_json::to_string_pretty(&project)?,
        )?;

        std::fs::remove_dir_all(&dir)?;

        info!(%project_id, "project rejected");
        Ok(AcceptOutcome {
            success: true,
            message: "Project rejected and cleaned up".into(),
        })
    }

    /// List every rejected project's metadata, newest last (directory order).
    pub fn list_rejected(&self) -> Vec<StagedProject> {
        let Ok(entries) = std::fs::read_dir(&self.rejected_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                std::fs::read_to_string(e.path().join("metadata.json"))
                    .ok()
                    .and_then(|data| serde_json::from_str(&data).ok())
            })
            .collect()
    }

    pub fn is_rejected(&self, title: &str) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.rejected_dir) else {
            return false;
        };
        entries.filter_map(|e| e.ok()).any(|e| {
            std::fs::read_to_string(e.path().join("metadata.json"))
                .ok()
                .and_then(|data| serde_json::from_str::<StagedProject>(&data).ok())
                .is_some_and(|p| p.title == title)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_files() -> Vec<FileChange> {
        vec![FileChange {
            path: "src/lib.rs".into(),
            additions: 10,
            deletions: 2,
        }]
    }

    #[test]
    fn stage_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path()).unwrap();
        store
            .stage_project("p1", "Add feature", "sess-1", &sample_files(), "diff content", None, None)
            .unwrap();

        let projects = store.list_staged_projects();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "p1");
        assert_eq!(projects[0].additions, 10);
        assert_eq!(projects[0].status, ProjectStatus::Staged);
    }

    #[test]
    fn get_project_diff_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path()).unwrap();
        store
            .stage_project("p1", "t", "s", &sample_files(), "diff content", None, None)
            .unwrap();

        assert_eq!(store.get_project_diff("p1").unwrap(), "diff content");
        assert_eq!(store.get_project_files("p1").len(), 1);
    }

    #[test]
    fn set_pending_updates_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path()).unwrap();
        store.stage_project("p1", "t", "s", &[], "", None, None).unwrap();
        store.set_pending("p1").unwrap();
        assert_eq!(store.get_project("p1").unwrap().status, ProjectStatus::Pending);
    }

    #[tokio::test]
    async fn accept_without_pr_removes_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path()).unwrap();
        store.stage_project("p1", "t", "s", &[], "", None, None).unwrap();

        let git_ops = GitOps::new(".", "owner/repo");
        let outcome = store.accept_project("p1", &git_ops).await;
        assert!(outcome.success);
        assert!(store.get_project("p1").is_none());

        let history = store.merge_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "p1");
    }

    #[tokio::test]
    async fn reject_moves_metadata_to_rejected_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path()).unwrap();
        store.stage_project("p1", "t", "s", &[], "", None, None).unwrap();

        let git_ops = GitOps::new(".", "owner/repo");
        let outcome = store.reject_project("p1", Some("not needed"), &git_ops).await.unwrap();
        assert!(outcome.success);
        assert!(store.get_project("p1").is_none());
        assert!(store.is_rejected("t"));
        assert_eq!(store.list_rejected().len(), 1);
    }

    #[test]
    fn accept_unknown_project_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path()).unwrap();
        assert!(store.get_project("missing").is_none());
    }
}
