//! Steering counters.
//!
//! Per-pantry counters are cache-line aligned so the owning core and the
//! producers on other cores do not false-share. Every counter is
//! monotonic; read them through a snapshot.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::McpsError;

/// Cache line padding to prevent false sharing.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns a reference to the inner value.
    #[inline]
    pub const fn get(&self) -> &T {
        &self.0
    }
}

/// Counters of one pantry.
///
/// At any quiescent point `enqueued == processed + dropped + ignored +
/// queued`. A drop counts as both an enqueue attempt and a drop.
/// `distributed` counts packets this CPU received and steered to another
/// pantry and is outside that identity.
#[derive(Debug, Default)]
pub struct PantryStats {
    /// Packets offered to this pantry, accepted or not.
    pub enqueued: CachePadded<AtomicU64>,
    /// Packets rejected at the queue.
    pub dropped: CachePadded<AtomicU64>,
    /// Packets taken off the process queue.
    pub processed: CachePadded<AtomicU64>,
    /// Packets handed to another pantry at CPU teardown.
    pub ignored: CachePadded<AtomicU64>,
    /// Packets that entered the aggregator.
    pub gro_processed: CachePadded<AtomicU64>,
    /// Packets received here and queued on another CPU.
    pub distributed: CachePadded<AtomicU64>,
}

impl PantryStats {
    /// Records accepted packets.
    #[inline]
    pub fn record_enqueued(&self, n: u64) {
        self.enqueued.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Records rejected packets.
    #[inline]
    pub fn record_dropped(&self, n: u64) {
        self.enqueued.0.fetch_add(n, Ordering::Relaxed);
        self.dropped.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Records packets taken off the process queue.
    #[inline]
    pub fn record_processed(&self, n: u64) {
        self.processed.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Records packets migrated away.
    #[inline]
    pub fn record_ignored(&self, n: u64) {
        self.ignored.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Records packets fed to the aggregator.
    #[inline]
    pub fn record_gro(&self, n: u64) {
        self.gro_processed.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Records packets steered from this CPU to another.
    #[inline]
    pub fn record_distributed(&self, n: u64) {
        self.distributed.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Reads one counter.
    #[must_use]
    pub fn get(&self, kind: CounterKind) -> u64 {
        let counter = match kind {
            CounterKind::Enqueued => &self.enqueued,
            CounterKind::Processed => &self.processed,
            CounterKind::Dropped => &self.dropped,
            CounterKind::Ignored => &self.ignored,
            CounterKind::GroProcessed => &self.gro_processed,
            CounterKind::Distributed => &self.distributed,
        };
        counter.0.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of current counters.
    #[must_use]
    pub fn snapshot(&self) -> PantryCounters {
        PantryCounters {
            enqueued: self.get(CounterKind::Enqueued),
            processed: self.get(CounterKind::Processed),
            dropped: self.get(CounterKind::Dropped),
            ignored: self.get(CounterKind::Ignored),
            gro_processed: self.get(CounterKind::GroProcessed),
            distributed: self.get(CounterKind::Distributed),
        }
    }
}

/// Point-in-time copy of [`PantryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PantryCounters {
    /// Packets offered.
    pub enqueued: u64,
    /// Packets taken off the process queue.
    pub processed: u64,
    /// Packets rejected.
    pub dropped: u64,
    /// Packets migrated away.
    pub ignored: u64,
    /// Packets fed to the aggregator.
    pub gro_processed: u64,
    /// Packets steered to another CPU.
    pub distributed: u64,
}

/// Selects one per-CPU counter for a report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// `enqueued`
    Enqueued,
    /// `processed`
    Processed,
    /// `dropped`
    Dropped,
    /// `ignored`
    Ignored,
    /// `gro_processed`
    GroProcessed,
    /// `distributed`
    Distributed,
}

impl CounterKind {
    /// Every counter, in report order.
    pub const ALL: [Self; 6] = [
        Self::Enqueued,
        Self::Processed,
        Self::Dropped,
        Self::Ignored,
        Self::GroProcessed,
        Self::Distributed,
    ];

    /// Counter name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Processed => "processed",
            Self::Dropped => "dropped",
            Self::Ignored => "ignored",
            Self::GroProcessed => "gro_processed",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterKind {
    type Err = McpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| McpsError::Config(format!("unknown counter: {s}")))
    }
}

/// Engine-wide counters for packets that never reached a pantry.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Packets handed back because steering is disabled.
    pub bypassed: CachePadded<AtomicU64>,
    /// Packets the classification source kept.
    pub pending: CachePadded<AtomicU64>,
    /// Packets steered to a CPU outside the possible range.
    pub invalid_cpu: CachePadded<AtomicU64>,
    /// Packets with no usable destination.
    pub classification_failed: CachePadded<AtomicU64>,
    /// Packets parked while their CPU was being torn down.
    pub parked: CachePadded<AtomicU64>,
}

impl EngineStats {
    /// Returns a snapshot of current counters.
    #[must_use]
    pub fn snapshot(&self) -> EngineCounters {
        EngineCounters {
            bypassed: self.bypassed.0.load(Ordering::Relaxed),
            pending: self.pending.0.load(Ordering::Relaxed),
            invalid_cpu: self.invalid_cpu.0.load(Ordering::Relaxed),
            classification_failed: self.classification_failed.0.load(Ordering::Relaxed),
            parked: self.parked.0.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    /// Packets handed back because steering is disabled.
    pub bypassed: u64,
    /// Packets the classification source kept.
    pub pending: u64,
    /// Packets steered to an invalid CPU.
    pub invalid_cpu: u64,
    /// Packets with no usable destination.
    pub classification_failed: u64,
    /// Packets parked during a CPU teardown.
    pub parked: u64,
}
