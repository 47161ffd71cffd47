//! Per-CPU packet queues.
//!
//! A [`Pantry`] is owned by one logical CPU. Producers on any core append
//! to its input queue under a short queue lock; only the owning core
//! drains it. Draining moves the input queue into a private process queue
//! and feeds each packet through the pantry's [`GroTable`].
//!
//! Lock order is `work` before `queue`, and `work` before `delivery`.
//! Producers only ever take `queue`. Completed packets are collected under
//! `work` and handed to the caller's delivery closure after `work` is
//! released; `delivery` is taken before that release so hand-offs leave in
//! the order they were collected. A delivery closure may inspect or feed
//! the pantry, but must not drain it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::gro::{GroProtocol, GroResult, GroTable};
use crate::packet::Packet;
use crate::stats::{PantryCounters, PantryStats};

/// Outcome of offering packets to a pantry.
#[derive(Debug)]
pub enum Push {
    /// Accepted. `schedule` is true if the caller must arrange a drain.
    Queued {
        /// This push set the scheduled flag.
        schedule: bool,
    },
    /// Rejected at capacity and released.
    Dropped,
    /// The pantry is offline; the packets are handed back untouched.
    Offline(Vec<Packet>),
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Packets taken off the process queue.
    pub work: usize,
    /// Quota ran out with packets still queued; the pantry stays scheduled.
    pub more: bool,
}

/// Per-pass inputs for [`Pantry::drain`].
#[derive(Clone, Copy)]
pub struct DrainContext<'a> {
    /// Maximum packets processed in this pass.
    pub quota: usize,
    /// Current GRO tick.
    pub tick: u64,
    /// Current time.
    pub now_ns: u64,
    /// Time-budget flush interval; zero disables it.
    pub flush_interval_ns: u64,
    /// Merge plug-in.
    pub proto: &'a dyn GroProtocol,
}

/// State and packets taken from a departing pantry.
#[derive(Debug, Default)]
pub struct Detached {
    /// Queued packets, process queue first.
    pub packets: VecDeque<Packet>,
    /// Held GRO units completed before detaching.
    pub gro_flushed: usize,
}

#[derive(Debug, Default)]
struct InputQueue {
    input: VecDeque<Packet>,
    offline: bool,
}

#[derive(Debug, Default)]
struct WorkState {
    process: VecDeque<Packet>,
    gro: GroTable,
    last_flush_ns: u64,
}

/// One CPU's inbound queue, aggregation table and counters.
#[derive(Debug)]
pub struct Pantry {
    cpu: usize,
    capacity: usize,
    queue: Mutex<InputQueue>,
    work: Mutex<WorkState>,
    delivery: Mutex<()>,
    scheduled: AtomicBool,
    stats: PantryStats,
}

impl Pantry {
    /// Creates an empty, online pantry for `cpu`.
    #[must_use]
    pub fn new(cpu: usize, capacity: usize) -> Self {
        Self {
            cpu,
            capacity,
            queue: Mutex::new(InputQueue::default()),
            work: Mutex::new(WorkState::default()),
            delivery: Mutex::new(()),
            scheduled: AtomicBool::new(false),
            stats: PantryStats::default(),
        }
    }

    /// Owning CPU.
    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> usize {
        self.cpu
    }

    /// Input-queue capacity.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live counters.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &PantryStats {
        &self.stats
    }

    /// Counter snapshot.
    #[must_use]
    pub fn counters(&self) -> PantryCounters {
        self.stats.snapshot()
    }

    /// Returns true if the pantry refuses new packets.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.queue.lock().offline
    }

    /// Returns true if a drain is pending.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Sets the scheduled flag. Returns true if it was clear.
    pub fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// Packets in the input queue.
    #[must_use]
    pub fn input_len(&self) -> usize {
        self.queue.lock().input.len()
    }

    /// Packets in both queues.
    #[must_use]
    pub fn queued(&self) -> usize {
        let work = self.work.lock();
        let queue = self.queue.lock();
        work.process.len() + queue.input.len()
    }

    /// Units held by the aggregator.
    #[must_use]
    pub fn gro_held(&self) -> usize {
        self.work.lock().gro.held()
    }

    /// Appends one packet.
    pub fn push(&self, pkt: Packet) -> Push {
        let mut queue = self.queue.lock();
        if queue.offline {
            return Push::Offline(vec![pkt]);
        }
        if queue.input.len() >= self.capacity {
            drop(queue);
            self.stats.record_dropped(1);
            debug!(cpu = self.cpu, "pantry full, packet dropped");
            return Push::Dropped;
        }
        queue.input.push_back(pkt);
        self.stats.record_enqueued(1);
        Push::Queued {
            schedule: self.try_schedule(),
        }
    }

    /// Appends a batch under one lock acquisition.
    ///
    /// The batch is accepted whole if it fits, otherwise dropped whole.
    pub fn push_batch(&self, pkts: Vec<Packet>) -> Push {
        if pkts.is_empty() {
            return Push::Queued { schedule: false };
        }
        let count = pkts.len();
        let mut queue = self.queue.lock();
        if queue.offline {
            return Push::Offline(pkts);
        }
        if queue.input.len() + count > self.capacity {
            drop(queue);
            self.stats.record_dropped(count as u64);
            debug!(cpu = self.cpu, count, "pantry full, batch dropped");
            return Push::Dropped;
        }
        queue.input.extend(pkts);
        self.stats.record_enqueued(count as u64);
        Push::Queued {
            schedule: self.try_schedule(),
        }
    }

    /// Hands collected packets to `deliver` once `work` is released.
    fn hand_off(
        &self,
        work: MutexGuard<'_, WorkState>,
        out: Vec<Packet>,
        deliver: &mut dyn FnMut(Packet),
    ) {
        if out.is_empty() {
            return;
        }
        let _turn = self.delivery.lock();
        drop(work);
        for pkt in out {
            deliver(pkt);
        }
    }

    /// Processes up to `ctx.quota` packets on the owning core.
    ///
    /// The scheduled flag is cleared only once both queues are empty, at
    /// which point every held GRO unit is completed as well. Packets reach
    /// `deliver` after the pantry's work lock is released.
    pub fn drain(&self, ctx: &DrainContext<'_>, deliver: &mut dyn FnMut(Packet)) -> DrainReport {
        let mut work = self.work.lock();
        let mut out = Vec::new();
        let report = self.drain_locked(&mut work, ctx, &mut out);
        self.hand_off(work, out, deliver);
        report
    }

    fn drain_locked(
        &self,
        work: &mut WorkState,
        ctx: &DrainContext<'_>,
        out: &mut Vec<Packet>,
    ) -> DrainReport {
        let collect: &mut dyn FnMut(Packet) = &mut |pkt| out.push(pkt);
        let mut done = 0;

        loop {
            while let Some(pkt) = work.process.pop_front() {
                self.stats.record_processed(1);
                self.feed(work, pkt, ctx, &mut *collect);

                if ctx.flush_interval_ns > 0
                    && ctx.now_ns.saturating_sub(work.last_flush_ns) > ctx.flush_interval_ns
                {
                    work.gro.flush(false, ctx.tick, &mut *collect);
                    work.last_flush_ns = ctx.now_ns;
                }

                done += 1;
                if done >= ctx.quota {
                    return DrainReport { work: done, more: true };
                }
            }

            let mut queue = self.queue.lock();
            if queue.input.is_empty() {
                self.scheduled.store(false, Ordering::Release);
                break;
            }
            std::mem::swap(&mut work.process, &mut queue.input);
        }

        work.gro.flush(false, ctx.tick, &mut *collect);
        work.last_flush_ns = ctx.now_ns;
        DrainReport { work: done, more: false }
    }

    fn feed(
        &self,
        work: &mut WorkState,
        pkt: Packet,
        ctx: &DrainContext<'_>,
        deliver: &mut dyn FnMut(Packet),
    ) -> Option<GroResult> {
        if pkt.has_flag(Packet::FLAG_GRO_SKIP) {
            deliver(pkt);
            return None;
        }

        self.stats.record_gro(1);
        let hash = pkt.flow_hash();
        let flush_session = pkt.has_flag(Packet::FLAG_FLUSH_SESSION);
        let result = work.gro.receive(pkt, ctx.tick, ctx.proto, &mut *deliver);
        if result == GroResult::Normal {
            work.last_flush_ns = ctx.now_ns;
        }
        if flush_session {
            work.gro.flush_flow(hash, &mut *deliver);
        }
        Some(result)
    }

    /// Aggregates a packet on the calling core without queueing it.
    ///
    /// Refused, handing the packet back, if anything is queued: the packet
    /// would otherwise overtake earlier packets of its flow.
    pub fn receive_direct(
        &self,
        pkt: Packet,
        ctx: &DrainContext<'_>,
        deliver: &mut dyn FnMut(Packet),
    ) -> Result<Option<GroResult>, Packet> {
        let mut work = self.work.lock();
        {
            let queue = self.queue.lock();
            if queue.offline || !queue.input.is_empty() || !work.process.is_empty() {
                return Err(pkt);
            }
            self.stats.record_enqueued(1);
        }
        self.stats.record_processed(1);

        let mut out = Vec::new();
        let collect: &mut dyn FnMut(Packet) = &mut |pkt| out.push(pkt);
        let result = self.feed(&mut work, pkt, ctx, &mut *collect);
        if ctx.flush_interval_ns > 0
            && ctx.now_ns.saturating_sub(work.last_flush_ns) > ctx.flush_interval_ns
        {
            work.gro.flush(false, ctx.tick, &mut *collect);
            work.last_flush_ns = ctx.now_ns;
        }
        self.hand_off(work, out, deliver);
        Ok(result)
    }

    /// Completes held GRO units. See [`GroTable::flush`].
    pub fn flush_gro(
        &self,
        flush_old: bool,
        tick: u64,
        now_ns: u64,
        deliver: &mut dyn FnMut(Packet),
    ) -> usize {
        let mut work = self.work.lock();
        let mut out = Vec::new();
        let flushed = work.gro.flush(flush_old, tick, &mut |pkt| out.push(pkt));
        work.last_flush_ns = now_ns;
        self.hand_off(work, out, deliver);
        flushed
    }

    /// Runs the time-budget flush if more than `interval_ns` passed since
    /// the last flush. Returns the number of units completed.
    pub fn flush_expired(
        &self,
        interval_ns: u64,
        tick: u64,
        now_ns: u64,
        deliver: &mut dyn FnMut(Packet),
    ) -> usize {
        if interval_ns == 0 {
            return 0;
        }
        let mut work = self.work.lock();
        if now_ns.saturating_sub(work.last_flush_ns) <= interval_ns {
            return 0;
        }
        work.last_flush_ns = now_ns;
        let mut out = Vec::new();
        let flushed = work.gro.flush(false, tick, &mut |pkt| out.push(pkt));
        self.hand_off(work, out, deliver);
        flushed
    }

    /// Takes the pantry offline: completes held units, then empties both
    /// queues into the returned batch and counts them as ignored.
    pub fn detach(&self, tick: u64, deliver: &mut dyn FnMut(Packet)) -> Detached {
        let mut work = self.work.lock();
        let mut out = Vec::new();
        let gro_flushed = work.gro.flush(false, tick, &mut |pkt| out.push(pkt));

        let packets = {
            let mut queue = self.queue.lock();
            queue.offline = true;
            self.scheduled.store(false, Ordering::Release);

            let mut packets = std::mem::take(&mut work.process);
            packets.append(&mut queue.input);
            packets
        };
        self.stats.record_ignored(packets.len() as u64);
        self.hand_off(work, out, deliver);
        Detached {
            packets,
            gro_flushed,
        }
    }

    /// Appends migrated packets, bypassing the capacity check. Returns true
    /// if the caller must arrange a drain.
    ///
    /// # Errors
    ///
    /// An offline pantry refuses the batch and hands it back untouched.
    pub fn attach(
        &self,
        mut packets: VecDeque<Packet>,
    ) -> std::result::Result<bool, VecDeque<Packet>> {
        let mut queue = self.queue.lock();
        if queue.offline {
            return Err(packets);
        }
        if packets.is_empty() {
            return Ok(false);
        }
        self.stats.record_enqueued(packets.len() as u64);
        queue.input.append(&mut packets);
        Ok(self.try_schedule())
    }

    /// Accepts packets again.
    pub fn set_online(&self) {
        self.queue.lock().offline = false;
    }
}
