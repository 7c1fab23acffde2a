//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce layering rules on
//! the workspace sources:
//! - The framer is a pure state machine: no threads, locks, channels, or I/O
//! - The framer does not depend on the scheduler
//! - No sleep() calls in production code
//!
//! The helpers here scan source text line by line. Comments are ignored, and
//! scanning of a file stops at its `#[cfg(test)]` module.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A forbidden pattern found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the pattern was found in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Pattern that matched
    pub pattern: String,
    /// Trimmed source line
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}] - {}",
            self.path.display(),
            self.line,
            self.pattern,
            self.text
        )
    }
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every `.rs` file under `dir`, sorted
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Code lines of `content` before its test module, with comments removed
fn production_lines(content: &str) -> impl Iterator<Item = (usize, &str, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (idx + 1, code, line.trim())
        })
}

/// Find every occurrence of `patterns` in production code under `dir`
#[must_use]
pub fn find_patterns(dir: &Path, patterns: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in rust_files(dir) {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, code, text) in production_lines(&content) {
            for pattern in patterns {
                if code.contains(pattern) {
                    violations.push(Violation {
                        path: path.clone(),
                        line,
                        pattern: (*pattern).to_string(),
                        text: text.to_string(),
                    });
                }
            }
        }
    }
    violations
}

/// Panic with a readable report if `violations` is non-empty
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!("\nFound {} violation(s): {rule}", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_and_test_modules_are_skipped() {
        let source = "use a; // thread::spawn\n/// Mutex docs\nfn f() {}\n#[cfg(test)]\nmod tests { use std::sync::Mutex; }\n";
        let lines: Vec<_> = production_lines(source).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|(_, code, _)| !code.contains("Mutex")));
        assert!(lines.iter().all(|(_, code, _)| !code.contains("thread")));
    }

    #[test]
    fn test_workspace_root_contains_core() {
        assert!(workspace_root().join("conductor/core/src/lib.rs").exists());
    }
}
