//! CPU hotplug coordination.
//!
//! ```text
//! Online -> Draining -> Offline { substitute } -> (bring-up) -> Online
//! ```
//!
//! Teardown completes the departing pantry's held GRO units, empties both
//! of its queues and hands every packet to a substitute CPU. Packets that
//! arrive for the departing CPU while it is draining are parked and follow
//! the migrated queue, so nothing queued at teardown time is lost and the
//! substitute sees them in arrival order.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::ClassificationSource;
use crate::error::{McpsError, Result};
use crate::notify::{Event, Notifier, Signal};
use crate::packet::Packet;
use crate::pantry::Pantry;

/// Lifecycle state of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuState {
    /// Accepting work.
    Online,
    /// Teardown in progress; arrivals are parked.
    Draining,
    /// Gone; arrivals go to `substitute`.
    Offline {
        /// CPU that took over the queue.
        substitute: usize,
    },
}

/// Where a packet for an offline pantry goes instead.
#[derive(Debug)]
pub enum Redirect {
    /// Parked until teardown completes.
    Parked,
    /// Retry on this CPU.
    To(usize, Packet),
}

/// Summary of one teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HotplugRecord {
    /// CPU that went offline.
    pub departed: usize,
    /// CPU that took over its queue.
    pub substitute: usize,
    /// Queued packets moved to the substitute.
    pub migrated: usize,
    /// Packets parked during the transition and moved after the queue.
    pub parked: usize,
    /// Held GRO units completed before migration.
    pub gro_flushed: usize,
    /// Pending cross-CPU notifications moved to the substitute.
    pub notifications_moved: usize,
}

/// Everything a transition touches.
#[derive(Clone, Copy)]
pub struct HotplugContext<'a> {
    /// One pantry per possible CPU.
    pub pantries: &'a [Pantry],
    /// Cross-CPU pending lists.
    pub notifier: &'a Notifier,
    /// Classifier to tell about eligibility changes.
    pub classifier: &'a dyn ClassificationSource,
    /// Wake-up path.
    pub signal: &'a dyn Signal,
    /// Current GRO tick.
    pub tick: u64,
}

#[derive(Debug)]
struct Inner {
    states: Vec<CpuState>,
    parked: Vec<VecDeque<Packet>>,
}

/// Serializes CPU transitions and redirects traffic for offline CPUs.
#[derive(Debug)]
pub struct HotplugCoordinator {
    inner: Mutex<Inner>,
    transition: Mutex<()>,
    fallback_cpu: usize,
}

impl HotplugCoordinator {
    /// Creates a coordinator with every CPU online.
    #[must_use]
    pub fn new(nr_cpus: usize, fallback_cpu: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                states: vec![CpuState::Online; nr_cpus],
                parked: (0..nr_cpus).map(|_| VecDeque::new()).collect(),
            }),
            transition: Mutex::new(()),
            fallback_cpu,
        }
    }

    /// State of `cpu`.
    #[must_use]
    pub fn state(&self, cpu: usize) -> Option<CpuState> {
        self.inner.lock().states.get(cpu).copied()
    }

    /// Every CPU's state.
    #[must_use]
    pub fn states(&self) -> Vec<CpuState> {
        self.inner.lock().states.clone()
    }

    /// Routes a packet that found `cpu`'s pantry offline.
    ///
    /// If the CPU has come back online in the meantime the packet is sent
    /// back to it.
    pub fn redirect(&self, cpu: usize, pkt: Packet) -> Redirect {
        let mut inner = self.inner.lock();
        match inner.states.get(cpu).copied() {
            Some(CpuState::Draining) => {
                inner.parked[cpu].push_back(pkt);
                Redirect::Parked
            }
            Some(CpuState::Offline { substitute }) => Redirect::To(substitute, pkt),
            Some(CpuState::Online) | None => Redirect::To(cpu, pkt),
        }
    }

    /// Online CPU with the shortest input queue, excluding `departing`.
    /// Falls back to the configured default when that one is online.
    fn select_substitute(&self, departing: usize, pantries: &[Pantry]) -> Result<usize> {
        let states = self.states();
        let pick = states
            .iter()
            .enumerate()
            .filter(|&(cpu, state)| cpu != departing && *state == CpuState::Online)
            .filter_map(|(cpu, _)| pantries.get(cpu).map(|p| (cpu, p.input_len())))
            .min_by_key(|&(_, load)| load)
            .map(|(cpu, _)| cpu);

        match pick {
            Some(cpu) => Ok(cpu),
            None if self.fallback_cpu != departing
                && states.get(self.fallback_cpu) == Some(&CpuState::Online) =>
            {
                Ok(self.fallback_cpu)
            }
            None => Err(McpsError::Hotplug(format!(
                "no online substitute for cpu {departing}"
            ))),
        }
    }

    /// Marks an online `cpu` as draining so new arrivals park.
    pub(crate) fn begin_teardown(&self, cpu: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.states.get(cpu) {
            Some(CpuState::Online) => {
                inner.states[cpu] = CpuState::Draining;
                Ok(())
            }
            Some(state) => Err(McpsError::Hotplug(format!(
                "cpu {cpu} is not online ({state:?})"
            ))),
            None => Err(McpsError::InvalidCpu(cpu)),
        }
    }

    /// Returns a draining `cpu` to service. `packets` go back on its queue
    /// ahead of anything parked during the attempt.
    fn abort_teardown(&self, cpu: usize, mut packets: VecDeque<Packet>, ctx: &HotplugContext<'_>) {
        let pantry = &ctx.pantries[cpu];
        let mut inner = self.inner.lock();
        packets.append(&mut inner.parked[cpu]);
        pantry.set_online();
        let schedule = match pantry.attach(packets) {
            Ok(schedule) => schedule,
            Err(lost) => {
                warn!(cpu, lost = lost.len(), "pantry refused its own queue");
                false
            }
        };
        inner.states[cpu] = CpuState::Online;
        drop(inner);
        if schedule {
            ctx.signal.raise(cpu, Event::Drain);
        }
    }

    /// Takes `cpu` offline and migrates its work.
    ///
    /// Held GRO units are completed through `deliver` first.
    ///
    /// # Errors
    ///
    /// Returns an error if `cpu` is out of range or not online, or if no
    /// online substitute exists. A refused teardown leaves `cpu` online
    /// with its queue intact.
    pub fn teardown(
        &self,
        cpu: usize,
        ctx: &HotplugContext<'_>,
        deliver: &mut dyn FnMut(Packet),
    ) -> Result<HotplugRecord> {
        let _transition = self.transition.lock();
        let departing = ctx.pantries.get(cpu).ok_or(McpsError::InvalidCpu(cpu))?;
        self.begin_teardown(cpu)?;

        let substitute = match self.select_substitute(cpu, ctx.pantries) {
            Ok(substitute) => substitute,
            Err(e) => {
                self.abort_teardown(cpu, VecDeque::new(), ctx);
                return Err(e);
            }
        };
        ctx.classifier.cpu_offline(cpu);

        let detached = departing.detach(ctx.tick, deliver);
        let migrated = detached.packets.len();

        let (parked, schedule) = {
            let mut inner = self.inner.lock();
            let parked = std::mem::take(&mut inner.parked[cpu]);
            let parked_len = parked.len();
            let mut packets = detached.packets;
            packets.extend(parked);
            match ctx.pantries[substitute].attach(packets) {
                Ok(schedule) => {
                    inner.states[cpu] = CpuState::Offline { substitute };
                    (parked_len, schedule)
                }
                Err(packets) => {
                    drop(inner);
                    // Substitute went away underneath us: keep the work here.
                    self.abort_teardown(cpu, packets, ctx);
                    ctx.classifier.cpu_online(cpu);
                    warn!(cpu, substitute, "substitute offline, teardown rolled back");
                    return Err(McpsError::Hotplug(format!(
                        "substitute cpu {substitute} for cpu {cpu} is offline"
                    )));
                }
            }
        };
        let notifications_moved = ctx.notifier.migrate(cpu, substitute, ctx.signal);
        if schedule {
            ctx.signal.raise(substitute, Event::Drain);
        }

        let record = HotplugRecord {
            departed: cpu,
            substitute,
            migrated,
            parked,
            gro_flushed: detached.gro_flushed,
            notifications_moved,
        };
        info!(
            cpu,
            substitute,
            migrated,
            parked,
            gro_flushed = record.gro_flushed,
            "cpu torn down"
        );
        Ok(record)
    }

    /// Brings `cpu` back online.
    ///
    /// # Errors
    ///
    /// Returns an error if `cpu` is out of range or mid-teardown.
    pub fn bringup(&self, cpu: usize, ctx: &HotplugContext<'_>) -> Result<()> {
        let _transition = self.transition.lock();
        let pantry = ctx.pantries.get(cpu).ok_or(McpsError::InvalidCpu(cpu))?;

        match self.state(cpu) {
            Some(CpuState::Online) => {
                debug!(cpu, "cpu already online");
                return Ok(());
            }
            Some(CpuState::Draining) => {
                return Err(McpsError::Hotplug(format!("cpu {cpu} is mid-teardown")));
            }
            Some(CpuState::Offline { .. }) => {}
            None => return Err(McpsError::InvalidCpu(cpu)),
        }

        pantry.set_online();
        self.inner.lock().states[cpu] = CpuState::Online;
        ctx.classifier.cpu_online(cpu);
        info!(cpu, "cpu brought up");
        Ok(())
    }
}
