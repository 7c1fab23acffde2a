//! Executor Thread
//!
//! The single serial execution context of a scheduler. It owns the lanes,
//! the high-priority task queue, and the terminal; every cross-thread entry
//! point reaches it as a [`Message`] on its mailbox.
//!
//! # Loop
//!
//! ```text
//! blocking_recv ─► handle ─► absorb (try_recv until empty) ─► drain ─► deferred performs
//!      ▲                                                                     │
//!      └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A pending `perform` is a barrier for `Normal` deliveries, later performs,
//! and discards sent after it: those wait in a stash until the perform has
//! run. `High` deliveries and high-priority tasks are still taken at every
//! token boundary.
//!
//! Draining serves `High` before `Normal`, runs pending high-priority tasks
//! before and after every token, and yields a `Normal` batch back to the
//! front of its lane at the first token boundary where `High` has work.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::token::TokenBatch;

use super::backpressure::SlotPermit;
use super::delegate::{SchedulerDelegate, Terminal};
use super::lanes::{Lane, PriorityLanes};
use super::pause::{self, PauseState, PauseToken};
use super::side_effects::{FlushUrgency, SideEffectQueue};

/// A closure run on the execution context
pub type Task<T> = Box<dyn FnOnce(&mut ExecutionContext<'_, T>) + Send>;

/// Work sent to the executor thread
pub(crate) enum Message<T> {
    /// A batch to queue; the slot is released once it is queued
    Deliver {
        batch: TokenBatch<T>,
        lane: Lane,
        slot: Option<SlotPermit>,
    },
    /// High-priority task, run ahead of further tokens
    Task(Task<T>),
    /// Task run after the current drain
    Perform(Task<T>),
    /// Drain pending work
    Wake,
    /// Drop every queued batch
    DiscardAll,
    /// Stop the executor
    Shutdown,
}

/// State owned by the executor and reachable through [`ExecutionContext`]
pub(crate) struct ContextState<T> {
    lanes: PriorityLanes<T>,
    tasks: VecDeque<Task<T>>,
    deferred: VecDeque<Task<T>>,
    /// Nesting depth of drain passes in progress
    executing: usize,
    executing_token: bool,
    /// Cleared by a rollback during token execution
    commit: bool,
    /// Set by a rollback; the current drain stops
    stop_requested: bool,
    shutdown: bool,
    pause: Arc<PauseState>,
    side_effects: Arc<SideEffectQueue>,
    delegate: Arc<dyn SchedulerDelegate>,
}

impl<T> ContextState<T> {
    pub(crate) fn new(
        pause: Arc<PauseState>,
        side_effects: Arc<SideEffectQueue>,
        delegate: Arc<dyn SchedulerDelegate>,
    ) -> Self {
        Self {
            lanes: PriorityLanes::new(),
            tasks: VecDeque::new(),
            deferred: VecDeque::new(),
            executing: 0,
            executing_token: false,
            commit: true,
            stop_requested: false,
            shutdown: false,
            pause,
            side_effects,
            delegate,
        }
    }

    fn enqueue(&mut self, batch: TokenBatch<T>, lane: Lane) {
        if batch.is_empty() && batch.byte_len() == 0 {
            tracing::trace!(%lane, "Ignoring empty batch");
            return;
        }
        self.delegate.will_enqueue(batch.byte_len());
        self.lanes.push_back(lane, batch);
    }

    fn halted(&self) -> bool {
        self.shutdown
            || self.stop_requested
            || self.pause.is_paused()
            || pause::is_globally_paused()
    }
}

/// Handle to the execution context, passed to tokens and tasks
///
/// Holding one proves the caller is running on the executor thread, so
/// operations here apply immediately instead of going through the mailbox.
pub struct ExecutionContext<'a, T> {
    state: &'a mut ContextState<T>,
}

impl<'a, T> ExecutionContext<'a, T> {
    pub(crate) fn new(state: &'a mut ContextState<T>) -> Self {
        Self { state }
    }

    /// Pause draining until the returned token is released
    ///
    /// Pauses nest; draining resumes when every token has been released.
    pub fn pause(&mut self) -> PauseToken {
        PauseToken::new(Arc::clone(&self.state.pause))
    }

    /// Whether a local or global pause token is outstanding
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.pause.is_paused() || pause::is_globally_paused()
    }

    /// Queue a batch without waiting for a delivery slot
    ///
    /// A `High` batch preempts the `Normal` batch being executed at the
    /// next token boundary.
    pub fn add_tokens(&mut self, batch: TokenBatch<T>, lane: Lane) {
        self.state.enqueue(batch, lane);
    }

    /// Run `task` now if nothing is executing, otherwise before the next token
    pub fn schedule_high_priority_task<F>(&mut self, task: F)
    where
        F: FnOnce(&mut ExecutionContext<'_, T>) + Send + 'static,
    {
        if self.state.executing == 0 {
            task(self);
        } else {
            self.state.tasks.push_back(Box::new(task));
        }
    }

    /// Queue a callback for the controlling thread
    pub fn add_side_effect<F>(&self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state
            .side_effects
            .push(Box::new(effect), FlushUrgency::Immediate);
    }

    /// Queue a callback that can wait for the host's next regular flush
    pub fn add_deferred_side_effect<F>(&self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state
            .side_effects
            .push(Box::new(effect), FlushUrgency::Deferred);
    }

    /// OR `bits` into the pending side-effect flags
    pub fn set_side_effect_flag(&self, bits: u64) {
        self.state.side_effects.set_flag(bits);
    }

    /// Leave the token being executed unconsumed
    ///
    /// Draining stops after the token returns; the same token runs again on
    /// the next drain.
    ///
    /// # Panics
    ///
    /// Panics when called outside token execution.
    pub fn roll_back_current_token(&mut self) {
        assert!(
            self.state.executing_token,
            "roll_back_current_token called outside token execution"
        );
        self.state.commit = false;
    }

    /// Whether a token is being executed right now
    #[must_use]
    pub fn is_executing_token(&self) -> bool {
        self.state.executing_token
    }

    /// Number of batches waiting in `lane`
    #[must_use]
    pub fn queued_batches(&self, lane: Lane) -> usize {
        self.state.lanes.len(lane)
    }
}

/// The executor thread body
pub(crate) struct Executor<T> {
    terminal: Box<dyn Terminal<T>>,
    state: ContextState<T>,
    mailbox: mpsc::UnboundedReceiver<Message<T>>,
    /// Messages held back behind a pending `Perform`, in arrival order
    stash: VecDeque<Message<T>>,
}

impl<T: Send + 'static> Executor<T> {
    pub(crate) fn new(
        terminal: Box<dyn Terminal<T>>,
        state: ContextState<T>,
        mailbox: mpsc::UnboundedReceiver<Message<T>>,
    ) -> Self {
        Self {
            terminal,
            state,
            mailbox,
            stash: VecDeque::new(),
        }
    }

    /// Run until shutdown or until every sender is gone
    pub(crate) fn run(mut self) {
        tracing::debug!("Executor started");
        while let Some(message) = self.mailbox.blocking_recv() {
            self.handle(message);
            self.absorb();
            if self.state.shutdown {
                break;
            }
            self.drain();
            self.run_deferred();
            if self.state.shutdown {
                break;
            }
        }
        let dropped = self.state.lanes.clear();
        tracing::debug!(dropped, "Executor stopped");
    }

    fn handle(&mut self, message: Message<T>) {
        match message {
            Message::Deliver { batch, lane, slot } => {
                self.state.enqueue(batch, lane);
                drop(slot);
            }
            Message::Task(task) => self.state.tasks.push_back(task),
            Message::Perform(task) => self.state.deferred.push_back(task),
            Message::Wake => {}
            Message::DiscardAll => {
                let dropped = self.state.lanes.clear();
                tracing::debug!(dropped, "Discarded queued batches");
            }
            Message::Shutdown => self.state.shutdown = true,
        }
    }

    /// Pull in messages that are already waiting
    ///
    /// Behind a pending `Perform`, only messages that may overtake it are
    /// handled; the rest are stashed.
    fn absorb(&mut self) {
        while let Ok(message) = self.mailbox.try_recv() {
            let barrier = !self.state.deferred.is_empty() || !self.stash.is_empty();
            if barrier && !overtakes_perform(&message) {
                self.stash.push_back(message);
            } else {
                self.handle(message);
            }
        }
    }

    /// Hand stashed messages over, up to and including the next `Perform`
    fn release_stash(&mut self) {
        while let Some(message) = self.stash.pop_front() {
            let barrier = matches!(message, Message::Perform(_));
            self.handle(message);
            if barrier {
                break;
            }
        }
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.state.tasks.pop_front() {
            task(&mut ExecutionContext::new(&mut self.state));
        }
    }

    fn run_deferred(&mut self) {
        while let Some(task) = self.state.deferred.pop_front() {
            if self.state.shutdown {
                return;
            }
            task(&mut ExecutionContext::new(&mut self.state));
            if self.state.deferred.is_empty() {
                self.release_stash();
            }
            self.absorb();
            self.drain();
        }
    }

    fn drain(&mut self) {
        self.state.stop_requested = false;
        self.state.executing += 1;
        self.run_tasks();

        if self.state.delegate.should_queue_tokens() {
            tracing::trace!("Delegate asked to queue tokens");
        } else {
            let mut handled = false;
            while !self.state.halted() {
                let Some((lane, batch)) = self.state.lanes.pop_next() else {
                    break;
                };
                handled = true;
                self.execute_batch(lane, batch);
            }
            if handled {
                self.state.delegate.did_handle_input();
            }
        }

        self.state.executing -= 1;
        self.run_tasks();
    }

    /// Execute `batch` until it finishes, halts, or yields to `High`
    fn execute_batch(&mut self, lane: Lane, mut batch: TokenBatch<T>) {
        loop {
            if batch.is_finished() {
                self.state.delegate.did_execute(batch.byte_len());
                return;
            }

            self.run_tasks();
            if self.state.halted() {
                self.state.lanes.push_front(lane, batch);
                return;
            }

            if self.state.delegate.should_discard_tokens(lane) {
                batch.advance();
            } else {
                let Some(token) = batch.current() else {
                    break;
                };
                self.state.commit = true;
                self.state.executing_token = true;
                self.terminal
                    .execute(token, &mut ExecutionContext::new(&mut self.state));
                self.state.executing_token = false;

                if !self.state.commit {
                    tracing::trace!(%lane, remaining = batch.remaining(), "Token rolled back");
                    self.state.stop_requested = true;
                    self.state.lanes.push_front(lane, batch);
                    return;
                }
                batch.advance();
            }

            self.run_tasks();
            self.absorb();

            if lane == Lane::Normal && self.state.lanes.has_high() && !batch.is_finished() {
                tracing::trace!(remaining = batch.remaining(), "Preempting normal batch");
                self.state.lanes.push_front(lane, batch);
                return;
            }
        }
    }
}

/// Whether `message` is handled even while a `Perform` is pending
fn overtakes_perform<T>(message: &Message<T>) -> bool {
    matches!(
        message,
        Message::Deliver {
            lane: Lane::High,
            ..
        } | Message::Task(_)
            | Message::Wake
            | Message::Shutdown
    )
}
