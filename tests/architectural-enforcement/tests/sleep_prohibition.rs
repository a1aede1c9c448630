//! Integration Test: Sleep Prohibition
//!
//! **Policy**: The routing core MUST NOT sleep. Waiting happens only on the
//! instance invocation, bounded by the per-attempt timeout, and cooldowns are
//! evaluated lazily against a monotonic clock.
//! **Exceptions**: test code and the scripted test invoker.

use architectural_enforcement::production_lines;

/// Test that routing code does not contain sleep() calls
#[test]
fn test_no_sleep_in_routing_core() {
    let violations: Vec<String> = production_lines("modelgate/core/src", &["test_utils.rs"])
        .into_iter()
        .filter(|line| line.code.contains("::sleep(") || line.code.contains(".sleep("))
        .map(|line| line.to_string())
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in the routing core!\n");
        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::timeout() around the instance call");
        eprintln!("  - Instant comparisons evaluated on next access for cooldowns");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Test that the detector flags what it should
#[test]
fn test_sleep_detector() {
    let source = "fn bad() {\n    std::thread::sleep(d);\n}\n#[cfg(test)]\nmod tests {\n    tokio::time::sleep(d);\n}\n";
    let lines = architectural_enforcement::scan_source(std::path::Path::new("bad.rs"), source);
    let hits: Vec<_> = lines
        .iter()
        .filter(|l| l.code.contains("::sleep("))
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].number, 2);
}
