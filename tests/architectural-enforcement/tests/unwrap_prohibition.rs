//! Integration Test: Panic-Free Library Code
//!
//! **Policy**: Library code in modelgate-core MUST propagate errors with `?`
//! or degrade explicitly. `.unwrap()` and `.expect(` are only allowed in tests.

use architectural_enforcement::production_lines;

#[test]
fn test_no_unwrap_in_core_library() {
    let violations: Vec<String> = production_lines("modelgate/core/src", &["test_utils.rs"])
        .into_iter()
        .filter(|line| line.code.contains(".unwrap()") || line.code.contains(".expect("))
        .map(|line| line.to_string())
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: unwrap()/expect() found in library code!\n");
        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }
        panic!(
            "\nFound {} panic site(s) in library code.\nReturn a Result instead!",
            violations.len()
        );
    }
}

#[test]
fn test_scan_covers_routing_modules() {
    let files: std::collections::HashSet<_> = production_lines("modelgate/core/src", &[])
        .into_iter()
        .filter_map(|l| l.path.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect();
    for expected in ["health.rs", "strategy.rs", "fallback.rs", "resolver.rs", "load_shed.rs"] {
        assert!(files.contains(expected), "{expected} was not scanned");
    }
}
