//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep() calls on the request path (bound calls with timeouts instead)
//! - No unwrap()/expect() in library code
//!
//! The helpers here walk a source tree and hand each test the production
//! portion of every file: comment-only lines are dropped and scanning stops
//! at the first `#[cfg(test)]` item.

use std::fs;
use std::path::{Path, PathBuf};

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Code with any trailing `//` comment removed
    pub code: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Workspace root, resolved from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Production lines of every `.rs` file under `dir` (relative to the
/// workspace root), skipping files whose name is listed in `exempt_files`
pub fn production_lines(dir: &str, exempt_files: &[&str]) -> Vec<SourceLine> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }

    let mut lines = Vec::new();
    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if exempt_files.contains(&name) {
            continue;
        }
        if let Ok(content) = fs::read_to_string(path) {
            lines.extend(scan_source(path, &content));
        }
    }
    lines
}

/// Split `content` into production lines
pub fn scan_source(path: &Path, content: &str) -> Vec<SourceLine> {
    let mut lines = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim_start().starts_with("#[cfg(test)]") {
            break;
        }
        let code = line.split("//").next().unwrap_or(line);
        if code.trim().is_empty() {
            continue;
        }
        lines.push(SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: code.to_string(),
        });
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_stops_at_test_module() {
        let source = "fn a() {}\n// note\n#[cfg(test)]\nmod tests { fn b() {} }\n";
        let lines = scan_source(Path::new("x.rs"), source);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 1);
    }

    #[test]
    fn test_trailing_comment_removed() {
        let lines = scan_source(Path::new("x.rs"), "let a = 1; // a.unwrap()\n");
        assert!(!lines[0].code.contains("unwrap"));
    }

    #[test]
    fn test_workspace_root_has_core() {
        assert!(workspace_root().join("modelgate").join("core").exists());
    }
}
