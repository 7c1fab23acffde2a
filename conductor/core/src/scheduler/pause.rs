//! Pause Tokens
//!
//! Pausing is a counter owned by the scheduler. Every [`PauseToken`] adds
//! one to it and takes one away when released; draining stops while the
//! counter is nonzero and resumes when the last token goes.
//!
//! A token is not `Clone`. Releasing it consumes it, and dropping an
//! unreleased token releases it, so each pause is undone exactly once.
//!
//! [`global_pause`] returns a token against a second, process-wide counter
//! that halts every scheduler at once. When it returns to zero every live
//! scheduler is woken.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

/// Called when the pause count returns to zero
pub(crate) type Waker = Box<dyn Fn() + Send + Sync>;

pub(crate) struct PauseState {
    count: AtomicUsize,
    wake: Waker,
}

impl PauseState {
    pub(crate) fn new(wake: Waker) -> Self {
        Self {
            count: AtomicUsize::new(0),
            wake,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.count() > 0
    }

    fn acquire(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> usize {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "pause count released below zero");
        prev - 1
    }
}

/// Process-wide pause shared by every scheduler
struct GlobalPause {
    state: Arc<PauseState>,
    members: Mutex<Vec<Weak<PauseState>>>,
}

static GLOBAL: OnceLock<GlobalPause> = OnceLock::new();

fn global() -> &'static GlobalPause {
    GLOBAL.get_or_init(|| GlobalPause {
        state: Arc::new(PauseState::new(Box::new(|| global().wake_members()))),
        members: Mutex::new(Vec::new()),
    })
}

impl GlobalPause {
    fn wake_members(&self) {
        let live: Vec<Arc<PauseState>> = {
            let mut members = self.members.lock();
            members.retain(|member| member.strong_count() > 0);
            members.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(schedulers = live.len(), "Global pause released");
        for member in live {
            (member.wake)();
        }
    }
}

/// Wake `state` whenever the global pause is lifted
pub(crate) fn register(state: &Arc<PauseState>) {
    let mut members = global().members.lock();
    members.retain(|member| member.strong_count() > 0);
    members.push(Arc::downgrade(state));
}

/// Whether a global pause is outstanding
pub(crate) fn is_globally_paused() -> bool {
    GLOBAL.get().is_some_and(|g| g.state.is_paused())
}

/// Pause every scheduler in the process until the token is released
pub fn global_pause() -> PauseToken {
    PauseToken::new(Arc::clone(&global().state))
}

/// Capability that keeps the scheduler paused until released
#[must_use = "dropping a pause token resumes the scheduler immediately"]
pub struct PauseToken {
    state: Arc<PauseState>,
    released: bool,
}

impl PauseToken {
    pub(crate) fn new(state: Arc<PauseState>) -> Self {
        let count = state.acquire();
        tracing::debug!(count, "Scheduler paused");
        Self {
            state,
            released: false,
        }
    }

    /// Release this pause; may be called from any thread
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let remaining = self.state.release();
        tracing::debug!(remaining, "Pause released");
        if remaining == 0 {
            (self.state.wake)();
        }
    }
}

impl Drop for PauseToken {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!("Pause token dropped without explicit release");
            self.release_once();
        }
    }
}

impl std::fmt::Debug for PauseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseToken")
            .field("released", &self.released)
            .finish()
    }
}
