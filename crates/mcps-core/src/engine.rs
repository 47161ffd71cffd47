//! Steering engine context.
//!
//! [`Engine`] is the process-wide object that ties the pieces together:
//! the affinity store, the classifier, one [`Pantry`] per possible CPU,
//! the cross-CPU notifier and the hotplug coordinator. It is built once,
//! shared by reference between cores, and torn down in reverse.
//!
//! Producers call [`Engine::submit`] from whichever core received the
//! packet. Every core runs [`Engine::handle`] for the events raised on it;
//! that is the only place a pantry is drained.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::arps::{ArpsStore, Policy, PolicyChange};
use crate::classify::{ArpsClassifier, Classification, ClassificationSource, FlowSelect};
use crate::clock::{Clock, MonotonicClock};
use crate::config::McpsConfig;
use crate::cpumask::CpuMask;
use crate::error::{McpsError, Result};
use crate::gro::{AppendMerge, GroProtocol};
use crate::hotplug::{CpuState, HotplugContext, HotplugCoordinator, HotplugRecord, Redirect};
use crate::notify::{Event, NoopSignal, Notifier, Signal};
use crate::packet::Packet;
use crate::pantry::{DrainContext, DrainReport, Pantry, Push};
use crate::stats::{CounterKind, EngineCounters, EngineStats, PantryCounters};
use crate::tuning::{parse_uint, Tuning};

/// Why a packet was released on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The destination pantry was at capacity.
    QueueFull,
    /// The destination is outside the possible CPU range.
    InvalidCpu,
    /// No destination could be chosen.
    ClassificationFailed,
}

impl DropReason {
    /// Error-taxonomy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "QueueFull",
            Self::InvalidCpu => "InvalidCpu",
            Self::ClassificationFailed => "ClassificationFailed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of offering a packet to the engine.
#[derive(Debug)]
pub enum Verdict {
    /// Queued on, or aggregated directly by, this CPU's pantry.
    Enqueued {
        /// Pantry that owns the packet now.
        cpu: usize,
    },
    /// Handled elsewhere: kept by the classification source or parked
    /// during a CPU teardown. Not an error.
    Pending,
    /// Released.
    Dropped(DropReason),
    /// Steering is disabled; the caller keeps the packet.
    Bypassed(Packet),
}

impl Verdict {
    /// Returns true unless the packet was dropped.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        !matches!(self, Self::Dropped(_))
    }
}

/// Receives packets leaving the engine.
pub trait PacketSink: Send + Sync {
    /// Hands a completed packet, delivered by `cpu`, to the stack above.
    fn deliver(&self, cpu: usize, pkt: Packet);
}

/// Sink that releases everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl PacketSink for DiscardSink {
    fn deliver(&self, _cpu: usize, _pkt: Packet) {}
}

/// Sink that counts packets, segments and bytes per delivering CPU.
#[derive(Debug)]
pub struct CountingSink {
    packets: Vec<AtomicU64>,
    segments: Vec<AtomicU64>,
    bytes: Vec<AtomicU64>,
}

impl CountingSink {
    /// Creates zeroed counters for `nr_cpus` CPUs.
    #[must_use]
    pub fn new(nr_cpus: usize) -> Self {
        let zeroed = || (0..nr_cpus).map(|_| AtomicU64::new(0)).collect();
        Self {
            packets: zeroed(),
            segments: zeroed(),
            bytes: zeroed(),
        }
    }

    /// Packets delivered by `cpu`.
    #[must_use]
    pub fn packets(&self, cpu: usize) -> u64 {
        self.packets.get(cpu).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Wire segments delivered by `cpu`, counting each merged segment.
    #[must_use]
    pub fn segments(&self, cpu: usize) -> u64 {
        self.segments.get(cpu).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Bytes delivered by `cpu`.
    #[must_use]
    pub fn bytes(&self, cpu: usize) -> u64 {
        self.bytes.get(cpu).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Segments delivered by every CPU.
    #[must_use]
    pub fn total_segments(&self) -> u64 {
        self.segments.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

impl PacketSink for CountingSink {
    fn deliver(&self, cpu: usize, pkt: Packet) {
        let Some(packets) = self.packets.get(cpu) else {
            return;
        };
        packets.fetch_add(1, Ordering::Relaxed);
        self.segments[cpu].fetch_add(u64::from(pkt.gro().count.max(1)), Ordering::Relaxed);
        self.bytes[cpu].fetch_add(pkt.len() as u64, Ordering::Relaxed);
    }
}

/// Sink that keeps every delivered packet.
#[derive(Debug, Default)]
pub struct CollectingSink {
    delivered: Mutex<Vec<(usize, Packet)>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything delivered so far.
    pub fn take(&self) -> Vec<(usize, Packet)> {
        std::mem::take(&mut *self.delivered.lock())
    }

    /// Number of packets held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delivered.lock().is_empty()
    }
}

impl PacketSink for CollectingSink {
    fn deliver(&self, cpu: usize, pkt: Packet) {
        self.delivered.lock().push((cpu, pkt));
    }
}

/// Per-CPU part of [`EngineSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct CpuSnapshot {
    /// CPU index.
    pub cpu: usize,
    /// Hotplug state.
    pub state: CpuState,
    /// Packets in both queues.
    pub queued: usize,
    /// Units held by the aggregator.
    pub gro_held: usize,
    /// Counters.
    #[serde(flatten)]
    pub counters: PantryCounters,
}

/// Serializable view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Global switch.
    pub enabled: bool,
    /// One entry per possible CPU.
    pub cpus: Vec<CpuSnapshot>,
    /// Engine-wide counters.
    pub engine: EngineCounters,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: McpsConfig,
    store: Option<Arc<ArpsStore>>,
    classifier: Option<Arc<dyn ClassificationSource>>,
    merger: Option<Arc<dyn GroProtocol>>,
    sink: Arc<dyn PacketSink>,
    signal: Arc<dyn Signal>,
    clock: Arc<dyn Clock>,
    direct_gro: bool,
}

impl EngineBuilder {
    /// Starts from a configuration.
    #[must_use]
    pub fn new(config: McpsConfig) -> Self {
        Self {
            config,
            store: None,
            classifier: None,
            merger: None,
            sink: Arc::new(DiscardSink),
            signal: Arc::new(NoopSignal),
            clock: Arc::new(MonotonicClock::new()),
            direct_gro: false,
        }
    }

    /// Configuration the engine will be built from.
    #[must_use]
    pub const fn config(&self) -> &McpsConfig {
        &self.config
    }

    /// Uses an existing affinity store instead of building one from the
    /// configuration.
    #[must_use]
    pub fn store(mut self, store: Arc<ArpsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default [`ArpsClassifier`].
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn ClassificationSource>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Replaces the default [`AppendMerge`] step.
    #[must_use]
    pub fn merger(mut self, merger: Arc<dyn GroProtocol>) -> Self {
        self.merger = Some(merger);
        self
    }

    /// Where delivered packets go.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.sink = sink;
        self
    }

    /// How cores are woken.
    #[must_use]
    pub fn signal(mut self, signal: Arc<dyn Signal>) -> Self {
        self.signal = signal;
        self
    }

    /// Time source for GRO ticks and flush budgets.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lets the default classifier aggregate locally steered flows in
    /// place.
    #[must_use]
    pub fn direct_gro(mut self, enabled: bool) -> Self {
        self.direct_gro = enabled;
        self
    }

    /// Builds the engine: masks, then snapshots, then pantries.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or an initial policy is
    /// invalid.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(ArpsStore::from_config(&self.config)?),
        };
        let nr_cpus = store.nr_cpus();
        let classifier: Arc<dyn ClassificationSource> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(
                ArpsClassifier::new(Arc::clone(&store)).with_direct_gro(self.direct_gro),
            ),
        };
        let merger: Arc<dyn GroProtocol> = match self.merger {
            Some(merger) => merger,
            None => Arc::new(AppendMerge::new(self.config.max_merge_bytes)),
        };
        let pantries = (0..nr_cpus)
            .map(|cpu| Pantry::new(cpu, self.config.pantry_capacity))
            .collect();

        info!(
            nr_cpus,
            capacity = self.config.pantry_capacity,
            quota = self.config.quota,
            enabled = self.config.enabled,
            "steering engine initialized"
        );
        Ok(Engine {
            enabled: AtomicBool::new(self.config.enabled),
            hotplug: HotplugCoordinator::new(nr_cpus, self.config.fallback_cpu),
            notifier: Notifier::new(nr_cpus),
            config: self.config,
            store,
            classifier,
            merger,
            sink: self.sink,
            signal: self.signal,
            clock: self.clock,
            pantries,
            stats: EngineStats::default(),
            tuning: Tuning::default(),
        })
    }
}

/// Process-wide steering context.
pub struct Engine {
    config: McpsConfig,
    store: Arc<ArpsStore>,
    classifier: Arc<dyn ClassificationSource>,
    merger: Arc<dyn GroProtocol>,
    sink: Arc<dyn PacketSink>,
    signal: Arc<dyn Signal>,
    clock: Arc<dyn Clock>,
    pantries: Vec<Pantry>,
    notifier: Notifier,
    hotplug: HotplugCoordinator,
    stats: EngineStats,
    tuning: Tuning,
    enabled: AtomicBool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("nr_cpus", &self.pantries.len())
            .field("enabled", &self.is_enabled())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds an engine with default collaborators.
    ///
    /// # Errors
    ///
    /// See [`EngineBuilder::build`].
    pub fn new(config: McpsConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(config: McpsConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Number of possible CPUs.
    #[inline]
    #[must_use]
    pub fn nr_cpus(&self) -> usize {
        self.pantries.len()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &McpsConfig {
        &self.config
    }

    /// Affinity store.
    #[must_use]
    pub fn store(&self) -> &Arc<ArpsStore> {
        &self.store
    }

    /// Pantry of `cpu`.
    #[must_use]
    pub fn pantry(&self, cpu: usize) -> Option<&Pantry> {
        self.pantries.get(cpu)
    }

    /// Cross-CPU notifier.
    #[must_use]
    pub const fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Engine-wide counters.
    #[must_use]
    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Mode and affinity weights.
    #[must_use]
    pub const fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Returns true if steering is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turns steering on or off. While off, [`submit`](Self::submit) hands
    /// every packet back.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!(enabled, "steering switch changed");
        }
    }

    /// Current GRO tick and time.
    fn now(&self) -> (u64, u64) {
        let now_ns = self.clock.now_ns();
        (now_ns / self.config.tick_ns.max(1), now_ns)
    }

    fn drain_context(&self) -> DrainContext<'_> {
        let (tick, now_ns) = self.now();
        DrainContext {
            quota: self.config.quota,
            tick,
            now_ns,
            flush_interval_ns: self.config.gro_flush_interval_ns,
            proto: &*self.merger,
        }
    }

    fn deliver_from(&self, cpu: usize) -> impl FnMut(Packet) + '_ {
        move |pkt| self.sink.deliver(cpu, pkt)
    }

    /// Classifies a packet that arrived on `local_cpu` and steers it.
    pub fn submit(&self, local_cpu: usize, pkt: Packet) -> Verdict {
        if !self.is_enabled() {
            self.stats.bypassed.0.fetch_add(1, Ordering::Relaxed);
            return Verdict::Bypassed(pkt);
        }

        match self.classifier.classify(local_cpu, pkt) {
            Classification::Cpu(cpu, pkt) => self.enqueue_on(local_cpu, pkt, cpu),
            Classification::GroBypass(cpu, pkt) => {
                self.enqueue_on(local_cpu, pkt.with_flag(Packet::FLAG_GRO_SKIP), cpu)
            }
            Classification::DirectGro(pkt) => self.receive_direct(local_cpu, pkt),
            Classification::Pending => {
                self.stats.pending.0.fetch_add(1, Ordering::Relaxed);
                Verdict::Pending
            }
            Classification::Failed(pkt) => {
                self.stats
                    .classification_failed
                    .0
                    .fetch_add(1, Ordering::Relaxed);
                debug!(hash = pkt.flow_hash(), "no destination, packet dropped");
                Verdict::Dropped(DropReason::ClassificationFailed)
            }
        }
    }

    fn receive_direct(&self, local_cpu: usize, pkt: Packet) -> Verdict {
        let Some(pantry) = self.pantries.get(local_cpu) else {
            return self.drop_invalid(local_cpu, 1);
        };
        let ctx = self.drain_context();
        match pantry.receive_direct(pkt, &ctx, &mut self.deliver_from(local_cpu)) {
            Ok(_) => Verdict::Enqueued { cpu: local_cpu },
            Err(pkt) => self.enqueue_on(local_cpu, pkt, local_cpu),
        }
    }

    fn drop_invalid(&self, cpu: usize, count: u64) -> Verdict {
        self.stats.invalid_cpu.0.fetch_add(count, Ordering::Relaxed);
        debug!(cpu, count, "invalid destination cpu, dropped");
        Verdict::Dropped(DropReason::InvalidCpu)
    }

    /// Queues a packet on `cpu`, signalling the owning core directly if a
    /// drain must be arranged.
    pub fn enqueue(&self, pkt: Packet, cpu: usize) -> Verdict {
        self.enqueue_on(cpu, pkt, cpu)
    }

    /// Queues a packet on `cpu` from `local_cpu`.
    ///
    /// An offline destination is resolved through the hotplug coordinator:
    /// the packet is either parked or retried on the substitute.
    pub fn enqueue_on(&self, local_cpu: usize, pkt: Packet, cpu: usize) -> Verdict {
        let mut target = cpu;
        let mut pkt = pkt;
        // A chain of substitutes is at most one hop per CPU.
        for _ in 0..=self.nr_cpus() {
            let Some(pantry) = self.pantries.get(target) else {
                return self.drop_invalid(target, 1);
            };
            match pantry.push(pkt) {
                Push::Queued { schedule } => {
                    self.record_distributed(local_cpu, target, 1);
                    if schedule {
                        self.arrange_drain(local_cpu, target);
                    }
                    return Verdict::Enqueued { cpu: target };
                }
                Push::Dropped => return Verdict::Dropped(DropReason::QueueFull),
                Push::Offline(mut back) => {
                    let Some(returned) = back.pop() else {
                        return Verdict::Pending;
                    };
                    match self.hotplug.redirect(target, returned) {
                        Redirect::Parked => {
                            self.stats.parked.0.fetch_add(1, Ordering::Relaxed);
                            return Verdict::Pending;
                        }
                        Redirect::To(next, returned) => {
                            target = next;
                            pkt = returned;
                        }
                    }
                }
            }
        }
        self.drop_invalid(target, 1)
    }

    /// Queues a batch on `cpu` under one lock acquisition. The batch is
    /// accepted or dropped whole.
    pub fn splice_batch(&self, local_cpu: usize, pkts: Vec<Packet>, cpu: usize) -> Verdict {
        let mut target = cpu;
        let mut pkts = pkts;
        for _ in 0..=self.nr_cpus() {
            let Some(pantry) = self.pantries.get(target) else {
                return self.drop_invalid(target, pkts.len() as u64);
            };
            let count = pkts.len();
            match pantry.push_batch(pkts) {
                Push::Queued { schedule } => {
                    self.record_distributed(local_cpu, target, count as u64);
                    if schedule {
                        self.arrange_drain(local_cpu, target);
                    }
                    return Verdict::Enqueued { cpu: target };
                }
                Push::Dropped => return Verdict::Dropped(DropReason::QueueFull),
                Push::Offline(back) => {
                    let from = target;
                    pkts = Vec::with_capacity(back.len());
                    for pkt in back {
                        if let Redirect::To(next, pkt) = self.hotplug.redirect(from, pkt) {
                            target = next;
                            pkts.push(pkt);
                        }
                    }
                    let parked = count - pkts.len();
                    if parked > 0 {
                        self.stats.parked.0.fetch_add(parked as u64, Ordering::Relaxed);
                    }
                    if pkts.is_empty() {
                        return Verdict::Pending;
                    }
                }
            }
        }
        self.drop_invalid(target, pkts.len() as u64)
    }

    fn record_distributed(&self, local_cpu: usize, target: usize, count: u64) {
        if local_cpu != target {
            if let Some(local) = self.pantries.get(local_cpu) {
                local.stats().record_distributed(count);
            }
        }
    }

    /// Sets `cpu`'s scheduled flag if it is clear and arranges a drain.
    /// Returns true if this call did the scheduling.
    pub fn schedule_if_needed(&self, local_cpu: usize, cpu: usize) -> bool {
        let Some(pantry) = self.pantries.get(cpu) else {
            return false;
        };
        if !pantry.try_schedule() {
            return false;
        }
        self.arrange_drain(local_cpu, cpu);
        true
    }

    fn arrange_drain(&self, local_cpu: usize, cpu: usize) {
        if local_cpu == cpu || !self.notifier.queue_remote(local_cpu, cpu, &*self.signal) {
            self.signal.raise(cpu, Event::Drain);
        }
    }

    /// Drains `cpu`'s pantry for one quota. Must run on the owning core.
    ///
    /// If the quota ran out, another drain is raised on the same core.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::InvalidCpu`] for an out-of-range CPU.
    pub fn drain(&self, cpu: usize) -> Result<DrainReport> {
        let pantry = self.pantries.get(cpu).ok_or(McpsError::InvalidCpu(cpu))?;
        let ctx = self.drain_context();
        let report = pantry.drain(&ctx, &mut self.deliver_from(cpu));
        if report.more {
            self.signal.raise(cpu, Event::Drain);
        }
        Ok(report)
    }

    /// Drains `cpu` until both its queues are empty. Returns the packets
    /// processed.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::InvalidCpu`] for an out-of-range CPU.
    pub fn drain_until_idle(&self, cpu: usize) -> Result<usize> {
        let pantry = self.pantries.get(cpu).ok_or(McpsError::InvalidCpu(cpu))?;
        let mut total = 0;
        loop {
            let ctx = self.drain_context();
            let report = pantry.drain(&ctx, &mut self.deliver_from(cpu));
            total += report.work;
            if !report.more {
                return Ok(total);
            }
        }
    }

    /// Runs one event on `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::InvalidCpu`] for an out-of-range CPU.
    pub fn handle(&self, cpu: usize, event: Event) -> Result<()> {
        if cpu >= self.nr_cpus() {
            return Err(McpsError::InvalidCpu(cpu));
        }
        match event {
            Event::Drain => {
                self.drain(cpu)?;
            }
            Event::Notify => {
                self.notifier.send_pending(cpu, &*self.signal);
            }
            Event::Shutdown => {}
        }
        Ok(())
    }

    /// Completes `cpu`'s held GRO units. With `flush_old`, units touched in
    /// the current tick stay held.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::InvalidCpu`] for an out-of-range CPU.
    pub fn flush(&self, cpu: usize, flush_old: bool) -> Result<usize> {
        let pantry = self.pantries.get(cpu).ok_or(McpsError::InvalidCpu(cpu))?;
        let (tick, now_ns) = self.now();
        Ok(pantry.flush_gro(flush_old, tick, now_ns, &mut self.deliver_from(cpu)))
    }

    /// Runs the time-budget flush on `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::InvalidCpu`] for an out-of-range CPU.
    pub fn flush_expired(&self, cpu: usize) -> Result<usize> {
        let pantry = self.pantries.get(cpu).ok_or(McpsError::InvalidCpu(cpu))?;
        let (tick, now_ns) = self.now();
        Ok(pantry.flush_expired(
            self.config.gro_flush_interval_ns,
            tick,
            now_ns,
            &mut self.deliver_from(cpu),
        ))
    }

    fn hotplug_context(&self) -> HotplugContext<'_> {
        HotplugContext {
            pantries: &self.pantries,
            notifier: &self.notifier,
            classifier: &*self.classifier,
            signal: &*self.signal,
            tick: self.now().0,
        }
    }

    /// Takes `cpu` offline and moves its work to a substitute.
    ///
    /// # Errors
    ///
    /// See [`HotplugCoordinator::teardown`].
    pub fn cpu_teardown(&self, cpu: usize) -> Result<HotplugRecord> {
        let ctx = self.hotplug_context();
        self.hotplug
            .teardown(cpu, &ctx, &mut self.deliver_from(cpu))
    }

    /// Brings `cpu` back.
    ///
    /// # Errors
    ///
    /// See [`HotplugCoordinator::bringup`].
    pub fn cpu_bringup(&self, cpu: usize) -> Result<()> {
        self.hotplug.bringup(cpu, &self.hotplug_context())
    }

    /// Hotplug state of `cpu`.
    #[must_use]
    pub fn cpu_state(&self, cpu: usize) -> Option<CpuState> {
        self.hotplug.state(cpu)
    }

    /// Re-pins flows placed on `from` to `to`.
    ///
    /// Only future packets follow the new placement; packets already
    /// queued on `from` are delivered there.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::InvalidCpu`] for an out-of-range CPU and
    /// [`McpsError::Hotplug`] if `to` is not online.
    pub fn migrate_flows(&self, from: usize, to: usize, select: FlowSelect) -> Result<usize> {
        self.check_move_target(from, to)?;
        let moved = self.classifier.migrate_flows(from, to, select);
        info!(from, to, ?select, moved, "flows migrated");
        Ok(moved)
    }

    /// Re-pins one flow to `to`. Returns false if the flow is unknown.
    ///
    /// # Errors
    ///
    /// See [`Engine::migrate_flows`].
    pub fn migrate_flow(&self, hash: u32, to: usize) -> Result<bool> {
        self.check_move_target(to, to)?;
        Ok(self.classifier.migrate_flow(hash, to))
    }

    fn check_move_target(&self, from: usize, to: usize) -> Result<()> {
        for cpu in [from, to] {
            if cpu >= self.nr_cpus() {
                return Err(McpsError::InvalidCpu(cpu));
            }
        }
        match self.hotplug.state(to) {
            Some(CpuState::Online) => Ok(()),
            state => Err(McpsError::Hotplug(format!(
                "cannot move flows to cpu {to} ({state:?})"
            ))),
        }
    }

    /// Applies a `"<from> <to> <option>"` move request. The three fields
    /// are unsigned integers in C notation; the option selects all flows
    /// (0), the heaviest (1) or the lightest (2).
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] for a malformed request and
    /// the errors of [`Engine::migrate_flows`] otherwise.
    pub fn move_command(&self, value: &str) -> Result<usize> {
        let fields = value
            .split(' ')
            .take(3)
            .map(parse_uint)
            .collect::<Result<Vec<u32>>>()?;
        let [from, to, option] = fields[..] else {
            return Err(McpsError::rejected(format!(
                "move needs '<from> <to> <option>', got '{}'",
                value.trim_end()
            )));
        };
        let select = FlowSelect::from_option(option)?;
        self.migrate_flows(from as usize, to as usize, select)
    }

    /// Packet count of each CPU's heaviest or lightest flow, `-1` where a
    /// CPU has none. Each value is followed by a space, then a newline.
    #[must_use]
    pub fn flow_report(&self, select: FlowSelect) -> String {
        let mut line: String = (0..self.nr_cpus())
            .map(|cpu| match self.classifier.flow_packets(cpu, select) {
                Some(packets) => format!("{packets} "),
                None => "-1 ".to_string(),
            })
            .collect();
        line.push('\n');
        line
    }

    /// Replaces a policy slot by name.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::UnknownPolicy`] or [`McpsError::ConfigRejected`].
    pub fn update_policy(&self, name: &str, value: &str) -> Result<PolicyChange> {
        let policy: Policy = name.parse()?;
        self.store.update(policy, value)
    }

    /// Formats a policy slot by name.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::UnknownPolicy`].
    pub fn get_policy(&self, name: &str) -> Result<String> {
        let policy: Policy = name.parse()?;
        Ok(self.store.get(policy))
    }

    /// Replaces the reserved IRQ mask and refreshes every live snapshot.
    pub fn set_reserved_irq_mask(&self, value: &str) -> CpuMask {
        self.store.set_reserved_irq_mask(value)
    }

    /// Per-CPU counter line: each value followed by a space, then a
    /// newline.
    #[must_use]
    pub fn counter_report(&self, kind: CounterKind) -> String {
        let mut line: String = self
            .pantries
            .iter()
            .map(|p| format!("{} ", p.stats().get(kind)))
            .collect();
        line.push('\n');
        line
    }

    /// Snapshot of every pantry and engine counter.
    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let states = self.hotplug.states();
        let cpus = self
            .pantries
            .iter()
            .zip(states)
            .map(|(pantry, state)| CpuSnapshot {
                cpu: pantry.cpu(),
                state,
                queued: pantry.queued(),
                gro_held: pantry.gro_held(),
                counters: pantry.counters(),
            })
            .collect();
        EngineSnapshot {
            enabled: self.is_enabled(),
            cpus,
            engine: self.stats.snapshot(),
        }
    }

    /// Completes every held unit and releases every snapshot. Queued
    /// packets stay where they are.
    pub fn shutdown(&self) {
        let (tick, now_ns) = self.now();
        let flushed: usize = self
            .pantries
            .iter()
            .map(|p| p.flush_gro(false, tick, now_ns, &mut self.deliver_from(p.cpu())))
            .sum();
        self.store.release_all();
        info!(flushed, "steering engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::RecordingSignal;

    fn pkt(hash: u32) -> Packet {
        Packet::from_parts(&[0u8; 64][..], hash)
    }

    fn engine(nr: usize, policy: &str) -> (Engine, Arc<RecordingSignal>, Arc<CollectingSink>) {
        let signal = Arc::new(RecordingSignal::new());
        let sink = Arc::new(CollectingSink::new());
        let mut config = McpsConfig::with_cpus(nr);
        config.topology.reserved_irq = "0".to_string();
        config.policies.static_mask = Some(policy.to_string());
        let engine = Engine::builder(config)
            .signal(signal.clone())
            .sink(sink.clone())
            .clock(Arc::new(ManualClock::new(0)))
            .build()
            .unwrap();
        (engine, signal, sink)
    }

    #[test]
    fn test_disabled_bypasses() {
        let (engine, _, _) = engine(2, "3");
        engine.set_enabled(false);
        assert!(matches!(engine.submit(0, pkt(5)), Verdict::Bypassed(_)));
        assert_eq!(engine.stats().snapshot().bypassed, 1);
    }

    #[test]
    fn test_local_enqueue_raises_drain() {
        let (engine, signal, sink) = engine(2, "1");
        assert!(matches!(engine.submit(0, pkt(5)), Verdict::Enqueued { cpu: 0 }));
        assert_eq!(signal.take(), vec![(0, Event::Drain)]);
        engine.handle(0, Event::Drain).unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_remote_enqueue_goes_through_notify() {
        let (engine, signal, sink) = engine(2, "2");
        assert!(matches!(engine.submit(0, pkt(5)), Verdict::Enqueued { cpu: 1 }));
        assert!(matches!(engine.submit(0, pkt(6)), Verdict::Enqueued { cpu: 1 }));
        assert_eq!(signal.take(), vec![(0, Event::Notify)]);

        engine.handle(0, Event::Notify).unwrap();
        assert_eq!(signal.take(), vec![(1, Event::Drain)]);
        engine.handle(1, Event::Drain).unwrap();
        assert!(sink.take().iter().all(|(cpu, _)| *cpu == 1));
    }

    #[test]
    fn test_no_policy_drops() {
        let (engine, _, _) = engine(2, "0");
        assert!(matches!(
            engine.submit(0, pkt(5)),
            Verdict::Dropped(DropReason::ClassificationFailed)
        ));
        assert_eq!(engine.stats().snapshot().classification_failed, 1);
    }

    #[test]
    fn test_invalid_cpu() {
        let (engine, _, _) = engine(2, "3");
        assert!(matches!(
            engine.enqueue(pkt(1), 9),
            Verdict::Dropped(DropReason::InvalidCpu)
        ));
        assert!(engine.drain(9).is_err());
        assert_eq!(engine.stats().snapshot().invalid_cpu, 1);
    }

    #[test]
    fn test_counter_report_format() {
        let (engine, _, _) = engine(3, "2");
        engine.enqueue(pkt(1), 1);
        engine.enqueue(pkt(2), 1);
        assert_eq!(engine.counter_report(CounterKind::Enqueued), "0 2 0 \n");
    }

    #[test]
    fn test_enqueue_to_offline_follows_substitute() {
        let (engine, _, _) = engine(3, "7");
        let record = engine.cpu_teardown(2).unwrap();
        match engine.enqueue(pkt(1), 2) {
            Verdict::Enqueued { cpu } => assert_eq!(cpu, record.substitute),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_drop_reason_names() {
        assert_eq!(DropReason::QueueFull.to_string(), "QueueFull");
        assert!(!Verdict::Dropped(DropReason::InvalidCpu).is_accepted());
        assert!(Verdict::Pending.is_accepted());
    }

    #[test]
    fn test_parked_arrivals_counted() {
        let (engine, _, _) = engine(2, "3");
        // Freeze cpu1 mid-teardown: draining, pantry already detached.
        engine.hotplug.begin_teardown(1).unwrap();
        engine.pantries[1].detach(0, &mut |_| {});

        assert!(matches!(engine.enqueue(pkt(1), 1), Verdict::Pending));
        assert_eq!(engine.stats().snapshot().parked, 1);
        assert!(matches!(
            engine.splice_batch(0, vec![pkt(2), pkt(3)], 1),
            Verdict::Pending
        ));
        assert_eq!(engine.stats().snapshot().parked, 3);
        assert_eq!(engine.stats().snapshot().pending, 0);
    }

    #[test]
    fn test_distributed_counts_remote_steering() {
        let (engine, _, _) = engine(3, "2");
        assert!(matches!(engine.submit(0, pkt(5)), Verdict::Enqueued { cpu: 1 }));
        assert!(matches!(engine.submit(1, pkt(5)), Verdict::Enqueued { cpu: 1 }));
        engine.splice_batch(2, vec![pkt(6), pkt(7)], 1);
        assert_eq!(engine.counter_report(CounterKind::Distributed), "1 0 2 \n");
        assert_eq!(engine.pantry(1).unwrap().counters().enqueued, 4);
    }

    #[test]
    fn test_move_command_and_flow_report() {
        // cpu0 is reserved, so every new flow lands on cpu1.
        let (engine, _, _) = engine(2, "3");
        for _ in 0..3 {
            assert!(matches!(engine.submit(0, pkt(7)), Verdict::Enqueued { cpu: 1 }));
        }
        engine.submit(0, pkt(8));
        assert_eq!(engine.flow_report(FlowSelect::Heaviest), "-1 3 \n");
        assert_eq!(engine.flow_report(FlowSelect::Lightest), "-1 1 \n");

        assert_eq!(engine.move_command("1 0 1\n").unwrap(), 1);
        assert!(matches!(engine.submit(1, pkt(7)), Verdict::Enqueued { cpu: 0 }));
        assert_eq!(engine.flow_report(FlowSelect::Heaviest), "4 1 \n");

        assert!(engine.move_command("1 0").unwrap_err().is_rejected());
        assert!(engine.move_command("1 0 7").unwrap_err().is_rejected());
        assert!(engine.move_command("one 0 0").unwrap_err().is_rejected());
        assert!(matches!(engine.move_command("1 5 0"), Err(McpsError::InvalidCpu(5))));

        engine.cpu_teardown(0).unwrap();
        assert!(matches!(engine.move_command("1 0 0"), Err(McpsError::Hotplug(_))));
        assert!(matches!(engine.migrate_flow(8, 0), Err(McpsError::Hotplug(_))));
        assert!(engine.migrate_flow(8, 1).unwrap());
        assert!(!engine.migrate_flow(99, 1).unwrap());
    }

    #[test]
    fn test_tuning_knobs() {
        let (engine, _, _) = engine(2, "3");
        assert_eq!(engine.tuning().mode_report(), "0\n");
        engine.tuning().set_mode("2\n").unwrap();
        assert_eq!(engine.tuning().mode(), 2);
        engine.tuning().set_weights("10 20 30 40").unwrap();
        assert_eq!(engine.tuning().weights_report(), "10 20 30 40 \n");
    }
}
