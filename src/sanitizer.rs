use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static FORBIDDEN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"import\s+os",
        r"from\s+os",
        r"import\s+subprocess",
        r"from\s+subprocess",
        r"import\s+shutil",
        r"from\s+shutil",
        r"import\s+sys",
        r"from\s+sys",
        r"eval\(",
        r"exec\(",
        r"__import__",
        r"os\.system",
        r"os\.popen",
        r"std::process::Command",
        r"Command::new",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern is valid"))
    .collect()
});

/// Result of scanning a diff: `None` means the diff is clean, `Some(pattern)`
/// carries the forbidden regex source that tripped.
pub type ScanResult = Option<&'static str>;

/// Scans the added lines of a unidiff patch for forbidden constructs
/// (shell-out, dynamic eval, banned imports) before a diff is allowed to
/// reach staging. Lines under a test path, comment lines, and lines
/// mentioning "mock" are exempt.
pub fn scan_diff(diff: &str) -> Result<(), &'static str> {
    if diff.is_empty() {
        return Ok(());
    }

    let mut current_file = String::new();
    let mut is_test_file = false;

    for line in diff.lines() {
        if line.starts_with("+++ b/") || line.starts_with("diff --git") {
            current_file = match line.split_once(" b/") {
                Some((_, path)) => path.trim().to_string(),
                None => line.rsplit('/').next().unwrap_or(line).to_string(),
            };
            let basename = current_file.rsplit('/').next().unwrap_or(&current_file);
            is_test_file = current_file.contains("tests/")
                || basename.starts_with("test_")
                || basename.contains("conftest.py");
            continue;
        }

        if let Some(content) = line.strip_prefix('+') {
            if content.starts_with('+') || is_test_file {
                continue;
            }
            let content = content.trim();
            if content.starts_with('#') || content.starts_with("//") {
                continue;
            }
            if content.to_lowercase().contains("mock") {
                continue;
            }
            for pattern in FORBIDDEN_PATTERNS.iter() {
                if pattern.is_match(content) {
                    warn!(pattern = pattern.as_str(), %content, "blocked forbidden pattern");
                    return Err(pattern.as_str());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_diff_passes() {
        assert!(scan_diff("").is_ok());
    }

    #[test]
    fn clean_diff_passes() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n+++ b/src/lib.rs\n+fn add(a: i32, b: i32) -> i32 { a + b }";
        assert!(scan_diff(diff).is_ok());
    }

    #[test]
    fn blocks_shell_out() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n+++ b/src/lib.rs\n+std::process::Command::new(\"rm\");";
        assert!(scan_diff(diff).is_err());
    }

    #[test]
    fn allows_forbidden_pattern_in_test_file() {
        let diff = "diff --git a/tests/sandbox_test.rs b/tests/sandbox_test.rs\n+++ b/tests/sandbox_test.rs\n+std::process::Command::new(\"echo\");";
        assert!(scan_diff(diff).is_ok());
    }

    #[test]
    fn allows_mocked_usage() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n+++ b/src/lib.rs\n+let _ = mock_command(\"eval(\");";
        assert!(scan_diff(diff).is_ok());
    }

    #[test]
    fn ignores_comment_lines() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n+++ b/src/lib.rs\n+// eval(x) is dangerous, see RFC";
        assert!(scan_diff(diff).is_ok());
    }
}
