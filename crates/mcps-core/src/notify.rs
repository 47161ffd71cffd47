//! Cross-CPU delivery.
//!
//! A producer that makes a remote pantry runnable never drains it. It links
//! the target onto its own core's pending list and raises one
//! [`Event::Notify`] on itself. The notify handler later walks the list
//! and raises [`Event::Drain`] on every linked target, so each drain runs
//! on the core that owns the pantry.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Work delivered to a CPU's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Drain this CPU's pantry.
    Drain,
    /// Walk this CPU's pending list.
    Notify,
    /// Stop the event loop.
    Shutdown,
}

/// Wakes a CPU's event loop.
pub trait Signal: Send + Sync {
    /// Delivers `event` to `cpu`. Must not block.
    fn raise(&self, cpu: usize, event: Event);
}

/// Signal that discards every event. The caller polls pantries itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignal;

impl Signal for NoopSignal {
    fn raise(&self, _cpu: usize, _event: Event) {}
}

/// Signal that records events instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingSignal {
    events: Mutex<Vec<(usize, Event)>>,
}

impl RecordingSignal {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every recorded event, oldest first.
    pub fn take(&self) -> Vec<(usize, Event)> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Signal for RecordingSignal {
    fn raise(&self, cpu: usize, event: Event) {
        self.events.lock().push((cpu, event));
    }
}

/// Per-CPU pending-notification lists.
#[derive(Debug)]
pub struct Notifier {
    pending: Vec<Mutex<Vec<usize>>>,
    linked: Vec<AtomicBool>,
    notify_raised: Vec<AtomicBool>,
}

impl Notifier {
    /// Creates empty lists for `nr_cpus` CPUs.
    #[must_use]
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            pending: (0..nr_cpus).map(|_| Mutex::new(Vec::new())).collect(),
            linked: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
            notify_raised: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Links `target` onto `local`'s pending list.
    ///
    /// Returns false without doing anything if `target` is `local` (the
    /// caller drains locally). Linking an already-linked target is a no-op.
    pub fn queue_remote(&self, local: usize, target: usize, signal: &dyn Signal) -> bool {
        if local == target || local >= self.pending.len() || target >= self.linked.len() {
            return false;
        }
        {
            let mut list = self.pending[local].lock();
            if self.linked[target].swap(true, Ordering::AcqRel) {
                return true;
            }
            list.push(target);
        }
        if !self.notify_raised[local].swap(true, Ordering::AcqRel) {
            signal.raise(local, Event::Notify);
        }
        true
    }

    /// Notify handler for `local`: unlinks every pending target and raises
    /// [`Event::Drain`] on it. Returns the number of targets signalled.
    pub fn send_pending(&self, local: usize, signal: &dyn Signal) -> usize {
        let Some(slot) = self.pending.get(local) else {
            return 0;
        };
        self.notify_raised[local].store(false, Ordering::Release);
        let targets = {
            let mut list = slot.lock();
            for &target in list.iter() {
                self.linked[target].store(false, Ordering::Release);
            }
            std::mem::take(&mut *list)
        };
        for &target in &targets {
            signal.raise(target, Event::Drain);
        }
        targets.len()
    }

    /// Moves `from`'s pending list onto `to`'s, skipping `from` itself.
    /// Returns the number of targets moved.
    pub fn migrate(&self, from: usize, to: usize, signal: &dyn Signal) -> usize {
        if from == to || from >= self.pending.len() || to >= self.pending.len() {
            return 0;
        }
        let moved = std::mem::take(&mut *self.pending[from].lock());
        self.notify_raised[from].store(false, Ordering::Release);
        if moved.is_empty() {
            return 0;
        }

        let mut count = 0;
        {
            let mut list = self.pending[to].lock();
            for target in moved {
                if target == from {
                    self.linked[target].store(false, Ordering::Release);
                    continue;
                }
                list.push(target);
                count += 1;
            }
        }
        if count > 0 && !self.notify_raised[to].swap(true, Ordering::AcqRel) {
            signal.raise(to, Event::Notify);
        }
        count
    }

    /// Targets waiting on `local`'s list.
    #[must_use]
    pub fn pending_len(&self, local: usize) -> usize {
        self.pending.get(local).map_or(0, |list| list.lock().len())
    }

    /// Returns true if `target` sits on some pending list.
    #[must_use]
    pub fn is_linked(&self, target: usize) -> bool {
        self.linked
            .get(target)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_once() {
        let notifier = Notifier::new(4);
        let signal = RecordingSignal::new();

        assert!(notifier.queue_remote(0, 2, &signal));
        assert!(notifier.queue_remote(0, 2, &signal));
        assert_eq!(notifier.pending_len(0), 1);
        assert!(notifier.is_linked(2));
        assert_eq!(signal.take(), vec![(0, Event::Notify)]);
    }

    #[test]
    fn test_local_target_not_linked() {
        let notifier = Notifier::new(4);
        let signal = RecordingSignal::new();
        assert!(!notifier.queue_remote(1, 1, &signal));
        assert_eq!(notifier.pending_len(1), 0);
        assert!(signal.is_empty());
    }

    #[test]
    fn test_send_pending_raises_drain() {
        let notifier = Notifier::new(4);
        let signal = RecordingSignal::new();
        notifier.queue_remote(0, 1, &signal);
        notifier.queue_remote(0, 3, &signal);
        signal.take();

        assert_eq!(notifier.send_pending(0, &signal), 2);
        assert_eq!(signal.take(), vec![(1, Event::Drain), (3, Event::Drain)]);
        assert!(!notifier.is_linked(1));
        assert_eq!(notifier.pending_len(0), 0);

        // Relinking after the walk raises a fresh notify.
        notifier.queue_remote(0, 1, &signal);
        assert_eq!(signal.take(), vec![(0, Event::Notify)]);
    }

    #[test]
    fn test_migrate() {
        let notifier = Notifier::new(4);
        let signal = RecordingSignal::new();
        notifier.queue_remote(2, 1, &signal);
        notifier.queue_remote(2, 3, &signal);
        signal.take();

        assert_eq!(notifier.migrate(2, 0, &signal), 2);
        assert_eq!(notifier.pending_len(2), 0);
        assert_eq!(notifier.pending_len(0), 2);
        assert_eq!(signal.take(), vec![(0, Event::Notify)]);
        assert_eq!(notifier.migrate(2, 0, &signal), 0);
    }

    #[test]
    fn test_out_of_range() {
        let notifier = Notifier::new(2);
        let signal = RecordingSignal::new();
        assert!(!notifier.queue_remote(0, 9, &signal));
        assert_eq!(notifier.send_pending(9, &signal), 0);
        assert!(!notifier.is_linked(9));
    }
}
