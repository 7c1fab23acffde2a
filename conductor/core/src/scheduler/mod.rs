//! Priority Token Scheduler
//!
//! Executes token batches on one dedicated thread per connection, in order
//! within a lane, with `High` preempting `Normal` at token boundaries.
//!
//! # Architecture
//!
//! ```text
//!  producer threads                      executor thread
//!  ────────────────                      ───────────────
//!  add_tokens(Normal) ─► SlotPool ─┐
//!  add_tokens(High) ───────────────┼─► mailbox ─► lanes ─► Terminal::execute
//!  schedule_high_priority_task ────┘                │
//!                                                   └─► side effects ─► controlling thread
//! ```
//!
//! # Thread Safety
//!
//! [`Scheduler`] is a cheap `Clone` handle; every method may be called from
//! any thread. Operations that must happen on the executor itself go
//! through [`ExecutionContext`], which tokens and tasks receive as an
//! argument.

pub mod backpressure;
pub mod delegate;
pub mod executor;
pub mod lanes;
pub mod pause;
pub mod side_effects;

pub use backpressure::{BackpressureLevel, ReleaseHandler, SlotPermit, SlotPool};
pub use delegate::{NoopDelegate, SchedulerDelegate, Terminal};
pub use executor::{ExecutionContext, Task};
pub use lanes::{Lane, PriorityLanes};
pub use pause::{global_pause, PauseToken};
pub use side_effects::{FlushNotifier, FlushUrgency, SideEffect};

use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::token::TokenBatch;

use executor::{ContextState, Executor, Message};
use pause::PauseState;
use side_effects::SideEffectQueue;

struct Inner<T: Send + 'static> {
    tx: mpsc::UnboundedSender<Message<T>>,
    slots: SlotPool,
    pause: Arc<PauseState>,
    side_effects: Arc<SideEffectQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<T: Send + 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        self.slots.close();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if std::thread::current().id() == self.thread_id {
            return;
        }
        if handle.join().is_err() {
            tracing::warn!("Scheduler executor thread panicked");
        }
    }
}

/// Handle to a running scheduler
pub struct Scheduler<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("slots", &self.inner.slots)
            .field("pause_count", &self.pause_count())
            .finish()
    }
}

impl<T: Send + 'static> Scheduler<T> {
    /// Start a scheduler executing against `terminal`
    ///
    /// Spawns the executor thread named by `config.thread_name`.
    pub fn new<X>(
        terminal: X,
        delegate: Arc<dyn SchedulerDelegate>,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError>
    where
        X: Terminal<T>,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let wake_tx = tx.clone();
        let pause = Arc::new(PauseState::new(Box::new(move || {
            let _ = wake_tx.send(Message::Wake);
        })));
        pause::register(&pause);
        let side_effects = Arc::new(SideEffectQueue::new(Arc::clone(&delegate)));
        let slots = SlotPool::new(config.buffer_depth);

        let state = ContextState::new(Arc::clone(&pause), Arc::clone(&side_effects), delegate);
        let executor = Executor::new(Box::new(terminal), state, rx);

        let handle = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || executor.run())?;
        let thread_id = handle.thread().id();

        tracing::debug!(
            thread = %config.thread_name,
            buffer_depth = config.buffer_depth,
            "Scheduler started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                slots,
                pause,
                side_effects,
                thread: Mutex::new(Some(handle)),
                thread_id,
            }),
        })
    }

    fn on_executor(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    fn send(&self, message: Message<T>) -> Result<(), SchedulerError> {
        self.inner
            .tx
            .send(message)
            .map_err(|_| SchedulerError::Shutdown)
    }

    /// Submit a batch, blocking the calling thread for a `Normal` slot
    ///
    /// `High` batches never wait. Calling this from the executor thread never
    /// blocks either; use [`ExecutionContext::add_tokens`] there instead.
    pub fn add_tokens(&self, batch: TokenBatch<T>, lane: Lane) -> Result<(), SchedulerError> {
        let slot = if lane == Lane::Normal && !self.on_executor() {
            Some(self.inner.slots.acquire_blocking()?)
        } else {
            None
        };
        tracing::trace!(%lane, bytes = batch.byte_len(), tokens = batch.len(), "Submitting batch");
        self.send(Message::Deliver { batch, lane, slot })
    }

    /// Submit a batch, awaiting a `Normal` slot instead of blocking
    pub async fn add_tokens_async(
        &self,
        batch: TokenBatch<T>,
        lane: Lane,
    ) -> Result<(), SchedulerError> {
        let slot = match lane {
            Lane::Normal => Some(self.inner.slots.acquire().await?),
            Lane::High => None,
        };
        tracing::trace!(%lane, bytes = batch.byte_len(), tokens = batch.len(), "Submitting batch");
        self.send(Message::Deliver { batch, lane, slot })
    }

    /// Ask the executor to drain pending work
    pub fn schedule(&self) -> Result<(), SchedulerError> {
        self.send(Message::Wake)
    }

    /// Run `task` on the executor ahead of further token execution
    ///
    /// The task always travels through the mailbox, even when called on the
    /// executor thread. Tokens and tasks that want it to run synchronously
    /// use [`ExecutionContext::schedule_high_priority_task`] instead.
    pub fn schedule_high_priority_task<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&mut ExecutionContext<'_, T>) + Send + 'static,
    {
        self.send(Message::Task(Box::new(task)))
    }

    /// Run `task` on the executor once work queued before it has drained
    ///
    /// If draining is halted by a pause or by the delegate, the task runs
    /// anyway once the drain pass returns.
    pub fn perform<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&mut ExecutionContext<'_, T>) + Send + 'static,
    {
        self.send(Message::Perform(Box::new(task)))
    }

    /// Run `f` on the calling thread while the executor is parked
    ///
    /// The executor parks at its next token boundary, the same point a
    /// high-priority task would run, and stays parked until `f` returns, so
    /// state shared with the terminal can be read consistently. Called on
    /// the executor thread, `f` runs immediately.
    ///
    /// `f` must not wait for work that needs the executor, such as a
    /// `perform` or a `Normal` slot.
    pub fn while_paused<R>(&self, f: impl FnOnce() -> R) -> Result<R, SchedulerError> {
        if self.on_executor() {
            return Ok(f());
        }

        let (parked_tx, parked_rx) = oneshot::channel::<()>();
        let (resume_tx, resume_rx) = oneshot::channel::<()>();
        self.schedule_high_priority_task(move |_| {
            if parked_tx.send(()).is_ok() {
                tracing::trace!("Executor parked");
                let _ = resume_rx.blocking_recv();
            }
        })?;
        futures::executor::block_on(parked_rx).map_err(|_| SchedulerError::Shutdown)?;

        let result = f();
        let _ = resume_tx.send(());
        Ok(result)
    }

    /// Queue a callback for the controlling thread
    pub fn add_side_effect<F>(&self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .side_effects
            .push(Box::new(effect), FlushUrgency::Immediate);
    }

    /// Queue a callback that can wait for the host's next regular flush
    pub fn add_deferred_side_effect<F>(&self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .side_effects
            .push(Box::new(effect), FlushUrgency::Deferred);
    }

    /// OR `bits` into the pending side-effect flags
    pub fn set_side_effect_flag(&self, bits: u64) {
        self.inner.side_effects.set_flag(bits);
    }

    /// Run queued side effects on the calling thread; returns how many ran
    ///
    /// Call this from the controlling thread only.
    pub fn flush_side_effects(&self) -> usize {
        self.inner.side_effects.flush()
    }

    /// Install the callback run when side effects become pending
    pub fn set_flush_notifier(&self, notifier: Option<FlushNotifier>) {
        self.inner.side_effects.set_notifier(notifier);
    }

    /// Install the callback run when a delivery slot frees up below `Heavy`
    pub fn set_release_handler(&self, handler: Option<ReleaseHandler>) {
        self.inner.slots.set_release_handler(handler);
    }

    /// Current delivery congestion
    #[must_use]
    pub fn backpressure_level(&self) -> BackpressureLevel {
        self.inner.slots.level()
    }

    /// Delivery slots free right now
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available()
    }

    /// Whether a local or global pause token is outstanding
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.pause.is_paused() || pause::is_globally_paused()
    }

    /// Number of outstanding pause tokens
    #[must_use]
    pub fn pause_count(&self) -> usize {
        self.inner.pause.count()
    }

    /// Drop every queued batch without executing it
    pub fn discard_all(&self) -> Result<(), SchedulerError> {
        self.send(Message::DiscardAll)
    }

    /// Stop the executor
    ///
    /// Queued batches are dropped and blocked producers fail with
    /// [`SchedulerError::Shutdown`]. The thread is joined when the last
    /// handle is dropped.
    pub fn shutdown(&self) {
        tracing::debug!("Scheduler shutdown requested");
        let _ = self.send(Message::Shutdown);
        self.inner.slots.close();
    }
}
