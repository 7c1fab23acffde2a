//! Scheduler Collaborators
//!
//! The scheduler executes tokens against a [`Terminal`] and consults a
//! [`SchedulerDelegate`] at a fixed set of points. Both live on the executor
//! thread except [`SchedulerDelegate::sync_state`] and
//! [`SchedulerDelegate::handle_side_effect_flags`], which run wherever side
//! effects are flushed.

use crate::token::Token;

use super::executor::ExecutionContext;
use super::lanes::Lane;

/// Hooks into the surrounding terminal-state system
///
/// Every method has a no-op default.
pub trait SchedulerDelegate: Send + Sync + 'static {
    /// When true, draining returns immediately and leaves every batch queued
    fn should_queue_tokens(&self) -> bool {
        false
    }

    /// When true, tokens from `lane` are consumed without being executed
    fn should_discard_tokens(&self, _lane: Lane) -> bool {
        false
    }

    /// A batch decoded from `byte_len` bytes is about to be queued
    fn will_enqueue(&self, _byte_len: usize) {}

    /// A batch decoded from `byte_len` bytes has been fully consumed
    fn did_execute(&self, _byte_len: usize) {}

    /// A drain pass consumed at least one batch
    fn did_handle_input(&self) {}

    /// Publish executor state before queued side effects run
    fn sync_state(&self) {}

    /// Handle flag bits set with `set_side_effect_flag`
    fn handle_side_effect_flags(&self, _flags: u64) {}
}

/// Delegate that accepts every default
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl SchedulerDelegate for NoopDelegate {}

/// The terminal state tokens are executed against
///
/// Owned by the executor thread; never shared.
pub trait Terminal<T>: Send + 'static {
    /// Execute one token
    ///
    /// The context can pause, inject high-priority tokens, queue side
    /// effects, or roll the token back so it runs again.
    fn execute(&mut self, token: &Token<T>, context: &mut ExecutionContext<'_, T>);
}
