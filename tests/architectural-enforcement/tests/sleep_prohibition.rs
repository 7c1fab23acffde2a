//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. The executor
//! waits on its mailbox; producers wait on delivery slots; pauses stop
//! progress without blocking the thread.
//! **Exceptions**: Test code.

use architectural_enforcement::{assert_clean, find_patterns, workspace_root};

const SLEEP_CALLS: &[&str] = &["::sleep(", ".sleep("];

#[test]
fn test_no_sleep_in_core() {
    let dir = workspace_root().join("conductor/core/src");
    assert!(dir.exists(), "core sources not found at {}", dir.display());
    assert_clean(
        "Sleep calls found in conductor-stream",
        &find_patterns(&dir, SLEEP_CALLS),
    );
}

#[test]
fn test_no_sleep_in_replay() {
    let dir = workspace_root().join("conductor/replay/src");
    assert_clean(
        "Sleep calls found in conductor-replay",
        &find_patterns(&dir, SLEEP_CALLS),
    );
}

#[test]
fn test_executor_never_blocks_on_slots() {
    // Only producers may wait for a delivery slot
    let executor = workspace_root().join("conductor/core/src/scheduler/executor.rs");
    let dir = executor.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
    let violations: Vec<_> = find_patterns(&dir, &["acquire_blocking", "block_on("])
        .into_iter()
        .filter(|v| v.path.ends_with("executor.rs"))
        .collect();
    assert_clean("Executor must not wait for delivery slots", &violations);
}
