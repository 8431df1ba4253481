use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const PROBATION_LOCK: &str = ".probation_lock";
const LAST_CONFIDENCE_FILE: &str = ".last_confidence";
const BASE_PROBATION_SECS: f64 = 600.0;

#[derive(Debug, Clone, Serialize)]
pub struct SandboxResult {
    pub passed: bool,
    pub output: String,
}

impl SandboxResult {
    fn ok() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }

    fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Test-execution environment for a refined project. Runs the project's
/// test command with an explicit argv (never a shell string) and tracks a
/// probation lock file that throttles further attempts after a low-
/// confidence judgment, following the dynamic-timeout formula: the worse
/// the last score, the longer the probation.
pub struct Sandbox {
    memory_root: PathBuf,
}

impl Sandbox {
    pub fn new(memory_root: impl Into<PathBuf>) -> Self {
        Self {
            memory_root: memory_root.into(),
        }
    }

    /// Runs the project's test suite. Absence of a `tests/` directory is
    /// treated as vacuously passing, matching the behavior of a project
    /// that hasn't been asked to produce tests yet.
    pub fn run_tests(&self, project_dir: &Path, test_cmd: &str) -> SandboxResult {
        if !project_dir.join("tests").exists() {
            return SandboxResult::ok();
        }

        debug!("running tests");
        let output = Command::new("bash")
            .arg("-c")
            .arg(test_cmd)
            .current_dir(project_dir)
            .output();

        match output {
            Ok(output) if output.status.success() => {
                info!("tests passed");
                SandboxResult::ok()
            }
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let truncated = |s: &str| s.chars().take(1000).collect::<String>();
                SandboxResult::fail(format!(
                    "STDOUT:\n{}\n\nSTDERR:\n{}",
                    truncated(&stdout),
                    truncated(&stderr)
                ))
            }
            Err(e) => {
                warn!(error = %e, "sandbox execution error");
                SandboxResult::fail(e.to_string())
            }
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.memory_root.join(PROBATION_LOCK)
    }

    fn last_confidence_path(&self) -> PathBuf {
        self.memory_root.join(LAST_CONFIDENCE_FILE)
    }

    /// Record the score that triggered probation, read back on the next
    /// check to compute the dynamic timeout.
    pub fn record_confidence(&self, score: i64) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.memory_root)?;
        std::fs::write(self.last_confidence_path(), score.to_string())
    }

    pub fn enter_probation(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.memory_root)?;
        std::fs::write(self.lock_path(), "")
    }

    /// Returns true if the system is clear to proceed. If a stale lock has
    /// outlived its dynamic timeout it is removed and the check passes.
    pub fn check_probation(&self) -> bool {
        let lock = self.lock_path();
        let Ok(metadata) = std::fs::metadata(&lock) else {
            return true;
        };

        let last_confidence = std::fs::read_to_string(self.last_confidence_path())
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok());

        let dynamic_timeout = last_confidence
            .map(|conf| (BASE_PROBATION_SECS * (1.0 - ((conf - 50.0) / 50.0))).max(0.0))
            .unwrap_or(BASE_PROBATION_SECS);

        let age = metadata
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        if age > dynamic_timeout {
            let _ = std::fs::remove_file(&lock);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn no_tests_dir_passes_vacuously() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path().join("memories"));
        let result = sandbox.run_tests(dir.path(), "true");
        assert!(result.passed);
    }

    #[test]
    fn passing_test_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tests")).unwrap();
        let sandbox = Sandbox::new(dir.path().join("memories"));
        let result = sandbox.run_tests(dir.path(), "exit 0");
        assert!(result.passed);
    }

    #[test]
    fn failing_test_command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tests")).unwrap();
        let sandbox = Sandbox::new(dir.path().join("memories"));
        let result = sandbox.run_tests(dir.path(), "echo boom 1>&2; exit 1");
        assert!(!result.passed);
        assert!(result.output.contains("boom"));
    }

    #[test]
    fn no_lock_file_clears_probation() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path());
        assert!(sandbox.check_probation());
    }

    #[test]
    fn fresh_lock_blocks_probation() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path());
        sandbox.record_confidence(10).unwrap();
        sandbox.enter_probation().unwrap();
        assert!(!sandbox.check_probation());
    }

    #[test]
    fn high_confidence_shortens_timeout_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path());
        sandbox.record_confidence(100).unwrap();
        sandbox.enter_probation().unwrap();
        sleep(Duration::from_millis(10));
        assert!(sandbox.check_probation());
    }
}
