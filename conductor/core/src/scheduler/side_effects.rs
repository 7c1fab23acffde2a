//! Side Effects
//!
//! Work that must run on the controlling thread rather than the executor.
//! Producers on any thread push into an unbounded channel; whoever owns the
//! controlling thread calls [`SideEffectQueue::flush`] after being notified.
//!
//! # Flush order
//!
//! 1. `sync_state` once, before the first effect
//! 2. every queued effect, in submission order
//! 3. accumulated flag bits, if any (syncing first if step 1 did not run)
//!
//! # Notification
//!
//! The flush notifier is told how soon a flush is wanted. Ordinary effects
//! ask for [`FlushUrgency::Immediate`]; deferred effects and flag bits ask
//! for [`FlushUrgency::Deferred`], leaving the host free to batch them with
//! its next periodic flush. The notifier fires once per level: a deferred
//! request followed by an immediate one notifies twice, the reverse once.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::delegate::SchedulerDelegate;

/// A callback destined for the controlling thread
pub type SideEffect = Box<dyn FnOnce() + Send>;

/// How soon the host should flush
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FlushUrgency {
    /// Whenever the host next flushes on its own schedule
    Deferred = 1,
    /// As soon as possible
    Immediate = 2,
}

/// Called when side effects become pending, or more urgent
pub type FlushNotifier = Arc<dyn Fn(FlushUrgency) + Send + Sync>;

/// No flush requested
const NOT_PENDING: u8 = 0;

pub(crate) struct SideEffectQueue {
    tx: mpsc::UnboundedSender<SideEffect>,
    rx: Mutex<mpsc::UnboundedReceiver<SideEffect>>,
    flags: AtomicU64,
    flushing: AtomicBool,
    /// Highest [`FlushUrgency`] requested since the last flush
    pending: AtomicU8,
    notifier: RwLock<Option<FlushNotifier>>,
    delegate: Arc<dyn SchedulerDelegate>,
}

/// Clears the reentrancy flag even if an effect panics
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SideEffectQueue {
    pub(crate) fn new(delegate: Arc<dyn SchedulerDelegate>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            flags: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
            pending: AtomicU8::new(NOT_PENDING),
            notifier: RwLock::new(None),
            delegate,
        }
    }

    pub(crate) fn set_notifier(&self, notifier: Option<FlushNotifier>) {
        *self.notifier.write() = notifier;
    }

    pub(crate) fn push(&self, effect: SideEffect, urgency: FlushUrgency) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(effect);
        self.request_flush(urgency);
    }

    pub(crate) fn set_flag(&self, bits: u64) {
        let prev = self.flags.fetch_or(bits, Ordering::SeqCst);
        if prev & bits != bits {
            self.request_flush(FlushUrgency::Deferred);
        }
    }

    fn request_flush(&self, urgency: FlushUrgency) {
        let prev = self.pending.fetch_max(urgency as u8, Ordering::SeqCst);
        if prev >= urgency as u8 {
            return;
        }
        let notifier = self.notifier.read().clone();
        if let Some(notify) = notifier {
            notify(urgency);
        }
    }

    /// Run every pending effect; returns how many ran
    ///
    /// A flush started from inside a running effect returns 0 immediately.
    pub(crate) fn flush(&self) -> usize {
        if self.flushing.swap(true, Ordering::SeqCst) {
            tracing::trace!("Nested side effect flush ignored");
            return 0;
        }
        let _guard = FlushGuard(&self.flushing);
        self.pending.store(NOT_PENDING, Ordering::SeqCst);

        let mut synced = false;
        let mut count = 0;
        loop {
            let next = self.rx.lock().try_recv();
            let Ok(effect) = next else { break };
            if !synced {
                self.delegate.sync_state();
                synced = true;
            }
            effect();
            count += 1;
        }

        let flags = self.flags.swap(0, Ordering::SeqCst);
        if flags != 0 {
            if !synced {
                self.delegate.sync_state();
            }
            self.delegate.handle_side_effect_flags(flags);
        }

        if count > 0 {
            tracing::trace!(count, flags, "Flushed side effects");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        events: PlMutex<Vec<String>>,
    }

    impl SchedulerDelegate for Recorder {
        fn sync_state(&self) {
            self.events.lock().push("sync".into());
        }

        fn handle_side_effect_flags(&self, flags: u64) {
            self.events.lock().push(format!("flags {flags}"));
        }
    }

    fn queue() -> (SideEffectQueue, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (SideEffectQueue::new(recorder.clone()), recorder)
    }

    #[test]
    fn test_single_sync_per_flush() {
        let (queue, recorder) = queue();
        for i in 0..3 {
            let rec = Arc::clone(&recorder);
            queue.push(
                Box::new(move || rec.events.lock().push(format!("effect {i}"))),
                FlushUrgency::Immediate,
            );
        }
        assert_eq!(queue.flush(), 3);
        assert_eq!(
            *recorder.events.lock(),
            vec!["sync", "effect 0", "effect 1", "effect 2"]
        );
    }

    #[test]
    fn test_flags_alone_sync_once() {
        let (queue, recorder) = queue();
        queue.set_flag(0b01);
        queue.set_flag(0b10);
        assert_eq!(queue.flush(), 0);
        assert_eq!(*recorder.events.lock(), vec!["sync", "flags 3"]);
    }

    #[test]
    fn test_empty_flush_does_nothing() {
        let (queue, recorder) = queue();
        assert_eq!(queue.flush(), 0);
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_notifier_coalesces() {
        let (queue, _) = queue();
        let notified = Arc::new(PlMutex::new(Vec::new()));
        let seen = Arc::clone(&notified);
        queue.set_notifier(Some(Arc::new(move |urgency| seen.lock().push(urgency))));

        queue.push(Box::new(|| {}), FlushUrgency::Immediate);
        queue.push(Box::new(|| {}), FlushUrgency::Immediate);
        assert_eq!(*notified.lock(), vec![FlushUrgency::Immediate]);

        queue.flush();
        queue.push(Box::new(|| {}), FlushUrgency::Immediate);
        assert_eq!(notified.lock().len(), 2);
    }

    #[test]
    fn test_deferred_request_escalates_once() {
        let (queue, _) = queue();
        let notified = Arc::new(PlMutex::new(Vec::new()));
        let seen = Arc::clone(&notified);
        queue.set_notifier(Some(Arc::new(move |urgency| seen.lock().push(urgency))));

        queue.push(Box::new(|| {}), FlushUrgency::Deferred);
        queue.set_flag(0b1);
        queue.push(Box::new(|| {}), FlushUrgency::Immediate);
        queue.push(Box::new(|| {}), FlushUrgency::Deferred);
        assert_eq!(
            *notified.lock(),
            vec![FlushUrgency::Deferred, FlushUrgency::Immediate]
        );
        assert_eq!(queue.flush(), 3);
    }

    #[test]
    fn test_repeated_flag_does_not_renotify() {
        let (queue, _) = queue();
        let notified = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&notified);
        queue.set_notifier(Some(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        queue.set_flag(0b10);
        queue.set_flag(0b10);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}
