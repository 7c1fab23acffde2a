//! Integration Test: Framer Purity
//!
//! **Policy**: The conductor framer is a pure function of bytes plus parser
//! state. It MUST NOT spawn threads, take locks, use channels, touch the
//! filesystem or network, or depend on the scheduler.
//! **Exceptions**: Test modules.

use architectural_enforcement::{assert_clean, find_patterns, workspace_root};

const FORBIDDEN_PRIMITIVES: &[&str] = &[
    "std::thread",
    "Mutex",
    "RwLock",
    "Condvar",
    "mpsc",
    "tokio",
    "std::fs",
    "std::net",
    "std::io",
];

#[test]
fn test_framer_has_no_concurrency_or_io() {
    let dir = workspace_root().join("conductor/core/src/framer");
    assert!(dir.exists(), "framer sources not found at {}", dir.display());

    let violations = find_patterns(&dir, FORBIDDEN_PRIMITIVES);
    assert_clean("Framer must stay a pure state machine", &violations);
}

#[test]
fn test_framer_does_not_depend_on_scheduler() {
    let dir = workspace_root().join("conductor/core/src/framer");
    let violations = find_patterns(&dir, &["crate::scheduler", "super::super::scheduler"]);
    assert_clean("Framer must not depend on the scheduler", &violations);
}
