//! Flow-to-CPU classification.
//!
//! A [`ClassificationSource`] turns a packet into a steering decision. The
//! default [`ArpsClassifier`] reads the affinity snapshots in
//! [`ArpsStore`] and keeps a sharded flow table so established flows stay
//! on the CPU they were first placed on until that placement goes stale
//! or the flow is moved on purpose.

use std::sync::Arc;

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::arps::{ArpsMeta, ArpsStore, Cluster, CpuMap};
use crate::cpumask::CpuMask;
use crate::error::{McpsError, Result};
use crate::packet::Packet;

/// Default flow-table size.
pub const DEFAULT_MAX_FLOWS: usize = 4096;

/// Independent locks over the flow table.
const FLOW_SHARDS: usize = 16;

/// Steering decision for one packet.
#[derive(Debug)]
pub enum Classification {
    /// Queue on this CPU's pantry.
    Cpu(usize, Packet),
    /// Aggregate on the calling core without queueing.
    DirectGro(Packet),
    /// Queue on this CPU's pantry and deliver without aggregation.
    GroBypass(usize, Packet),
    /// The source took the packet; nothing left to do.
    Pending,
    /// No destination could be chosen.
    Failed(Packet),
}

/// Which of a CPU's flows an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSelect {
    /// Every flow.
    All,
    /// The flow with the most packets.
    Heaviest,
    /// The flow with the fewest packets.
    Lightest,
}

impl FlowSelect {
    /// Decodes the numeric option of a move request: 0 all, 1 heaviest,
    /// 2 lightest.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] for any other value.
    pub fn from_option(option: u32) -> Result<Self> {
        match option {
            0 => Ok(Self::All),
            1 => Ok(Self::Heaviest),
            2 => Ok(Self::Lightest),
            other => Err(McpsError::rejected(format!("unknown move option {other}"))),
        }
    }
}

/// Supplies steering decisions.
pub trait ClassificationSource: Send + Sync {
    /// Picks a destination for `pkt`, arriving on `local_cpu`.
    fn classify(&self, local_cpu: usize, pkt: Packet) -> Classification;

    /// `cpu` stopped accepting work.
    fn cpu_offline(&self, _cpu: usize) {}

    /// `cpu` accepts work again.
    fn cpu_online(&self, _cpu: usize) {}

    /// Re-pins flows placed on `from` to `to`. Returns how many moved.
    ///
    /// Sources without a flow table move nothing.
    fn migrate_flows(&self, _from: usize, _to: usize, _select: FlowSelect) -> usize {
        0
    }

    /// Re-pins one flow to `to`. Returns false if the flow is unknown.
    fn migrate_flow(&self, _hash: u32, _to: usize) -> bool {
        false
    }

    /// Packet count of the heaviest or lightest flow placed on `cpu`.
    fn flow_packets(&self, _cpu: usize, _select: FlowSelect) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct FlowEntry {
    cpu: usize,
    generation: u64,
    packets: u64,
}

type FlowShard = HashMap<u32, FlowEntry>;

/// Classifier backed by the affinity snapshots.
///
/// New flows are placed through the NEWFLOW order using the maps with
/// reserved IRQ CPUs removed. A known flow keeps its CPU while that CPU is
/// online and the snapshot that placed it is still live; otherwise it is
/// re-placed through the established order. Offline CPUs are skipped.
///
/// The flow table is split into shards by hash, and one packet takes
/// exactly one shard lock. The online set is read without locking.
pub struct ArpsClassifier {
    store: Arc<ArpsStore>,
    shards: Box<[Mutex<FlowShard>]>,
    online: ArcSwap<CpuMask>,
    shard_capacity: usize,
    direct_gro: bool,
}

impl std::fmt::Debug for ArpsClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArpsClassifier")
            .field("flows", &self.flow_count())
            .field("online", &self.online())
            .field("direct_gro", &self.direct_gro)
            .finish_non_exhaustive()
    }
}

impl ArpsClassifier {
    /// Creates a classifier with every possible CPU online.
    #[must_use]
    pub fn new(store: Arc<ArpsStore>) -> Self {
        let online = CpuMask::first_n(store.nr_cpus());
        Self {
            store,
            shards: (0..FLOW_SHARDS).map(|_| Mutex::new(FlowShard::new())).collect(),
            online: ArcSwap::from_pointee(online),
            shard_capacity: DEFAULT_MAX_FLOWS.div_ceil(FLOW_SHARDS),
            direct_gro: false,
        }
    }

    /// Caps the flow table. A shard is cleared when it fills, so the table
    /// never holds more than `max_flows` rounded up to a whole number of
    /// shards.
    #[must_use]
    pub fn with_max_flows(mut self, max_flows: usize) -> Self {
        self.shard_capacity = max_flows.div_ceil(FLOW_SHARDS).max(1);
        self
    }

    /// Aggregate flows steered to the calling CPU in place instead of
    /// queueing them.
    #[must_use]
    pub fn with_direct_gro(mut self, enabled: bool) -> Self {
        self.direct_gro = enabled;
        self
    }

    /// Number of remembered flows.
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// CPUs currently eligible.
    #[must_use]
    pub fn online(&self) -> CpuMask {
        **self.online.load()
    }

    #[inline]
    fn shard(&self, hash: u32) -> &Mutex<FlowShard> {
        &self.shards[hash as usize % FLOW_SHARDS]
    }

    /// True while the snapshot that placed a flow is still installed.
    fn is_live(&self, generation: u64) -> bool {
        let live = |meta: Option<Arc<ArpsMeta>>| meta.is_some_and(|m| m.generation() == generation);
        live(self.store.newflow()) || live(self.store.established())
    }

    /// Picks an online CPU from `map` for `hash`, walking forward from the
    /// hash slot.
    fn pick(map: &CpuMap, hash: u32, online: &CpuMask) -> Option<usize> {
        let start = map.slot_for(hash)?;
        (0..map.len())
            .filter_map(|i| map.get((start + i) % map.len()))
            .find(|&cpu| online.test(cpu))
    }

    fn place(
        meta: &ArpsMeta,
        cluster: Cluster,
        hash: u32,
        filtered: bool,
        online: &CpuMask,
    ) -> Option<usize> {
        let maps: [&CpuMap; 2] = if filtered {
            [meta.map_filtered(cluster), meta.map(cluster)]
        } else {
            [meta.map(cluster), meta.map_filtered(cluster)]
        };
        let candidates: Vec<&CpuMap> = maps
            .into_iter()
            .chain([meta.map(Cluster::All)])
            .filter(|map| !map.is_empty())
            .collect();
        // With every candidate offline, the hash slot still names a CPU;
        // enqueue then follows that CPU's hotplug substitute.
        candidates
            .iter()
            .find_map(|map| Self::pick(map, hash, online))
            .or_else(|| {
                let map = candidates.first()?;
                map.get(map.slot_for(hash)?)
            })
    }

    /// Resolves a CPU for a flow hash without a packet.
    ///
    /// Counts one packet against the flow.
    #[must_use]
    pub fn resolve(&self, hash: u32, cluster: Cluster) -> Option<usize> {
        if hash == 0 {
            return None;
        }
        let online = self.online.load();
        let mut shard = self.shard(hash).lock();

        let known = match shard.get_mut(&hash) {
            Some(entry) if online.test(entry.cpu) && self.is_live(entry.generation) => {
                entry.packets += 1;
                return Some(entry.cpu);
            }
            Some(_) => true,
            None => false,
        };

        let (meta, filtered) = if known {
            (self.store.established()?, false)
        } else {
            (self.store.newflow()?, true)
        };
        let cpu = Self::place(&meta, cluster, hash, filtered, &online)?;
        let generation = meta.generation();

        if !known && shard.len() >= self.shard_capacity {
            debug!(flows = shard.len(), "flow shard full, clearing");
            shard.clear();
        }
        shard
            .entry(hash)
            .and_modify(|entry| {
                entry.cpu = cpu;
                entry.generation = generation;
                entry.packets += 1;
            })
            .or_insert(FlowEntry {
                cpu,
                generation,
                packets: 1,
            });
        Some(cpu)
    }

    /// Hash and packet count of the heaviest or lightest flow on `cpu`.
    fn select_on(&self, cpu: usize, select: FlowSelect) -> Option<(u32, u64)> {
        let mut best: Option<(u32, u64)> = None;
        for shard in self.shards.iter() {
            let shard = shard.lock();
            for (&hash, entry) in shard.iter().filter(|(_, e)| e.cpu == cpu) {
                let better = match (select, best) {
                    (_, None) => true,
                    (FlowSelect::Lightest, Some((_, p))) => entry.packets < p,
                    (_, Some((_, p))) => entry.packets > p,
                };
                if better {
                    best = Some((hash, entry.packets));
                }
            }
        }
        best
    }
}

impl ClassificationSource for ArpsClassifier {
    fn classify(&self, local_cpu: usize, pkt: Packet) -> Classification {
        let Some(cpu) = self.resolve(pkt.flow_hash(), pkt.cluster()) else {
            return Classification::Failed(pkt);
        };
        if pkt.has_flag(Packet::FLAG_GRO_SKIP) {
            Classification::GroBypass(cpu, pkt)
        } else if self.direct_gro && cpu == local_cpu {
            Classification::DirectGro(pkt)
        } else {
            Classification::Cpu(cpu, pkt)
        }
    }

    fn cpu_offline(&self, cpu: usize) {
        self.online.rcu(|mask| {
            let mut mask = **mask;
            mask.clear(cpu);
            mask
        });
        let mut evicted = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, entry| entry.cpu != cpu);
            evicted += before - shard.len();
        }
        debug!(cpu, evicted, "cpu ineligible for steering");
    }

    fn cpu_online(&self, cpu: usize) {
        self.online.rcu(|mask| {
            let mut mask = **mask;
            mask.set(cpu);
            mask
        });
        debug!(cpu, "cpu eligible for steering");
    }

    fn migrate_flows(&self, from: usize, to: usize, select: FlowSelect) -> usize {
        if from == to {
            return 0;
        }
        let moved = match select {
            FlowSelect::All => {
                let mut moved = 0;
                for shard in self.shards.iter() {
                    for entry in shard.lock().values_mut().filter(|e| e.cpu == from) {
                        entry.cpu = to;
                        moved += 1;
                    }
                }
                moved
            }
            FlowSelect::Heaviest | FlowSelect::Lightest => self
                .select_on(from, select)
                .map_or(0, |(hash, _)| usize::from(self.migrate_flow(hash, to))),
        };
        debug!(from, to, ?select, moved, "flows moved");
        moved
    }

    fn migrate_flow(&self, hash: u32, to: usize) -> bool {
        match self.shard(hash).lock().get_mut(&hash) {
            Some(entry) => {
                entry.cpu = to;
                true
            }
            None => false,
        }
    }

    fn flow_packets(&self, cpu: usize, select: FlowSelect) -> Option<u64> {
        self.select_on(cpu, select).map(|(_, packets)| packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arps::{Policy, Topology};

    fn classifier(nr_cpus: usize) -> (Arc<ArpsStore>, ArpsClassifier) {
        let store = Arc::new(ArpsStore::new(Topology::flat(nr_cpus)));
        let classifier = ArpsClassifier::new(Arc::clone(&store));
        (store, classifier)
    }

    fn pkt(hash: u32) -> Packet {
        Packet::from_parts(&[0u8; 64][..], hash)
    }

    #[test]
    fn test_no_policy_fails() {
        let (_store, c) = classifier(4);
        assert!(matches!(c.classify(0, pkt(5)), Classification::Failed(_)));
    }

    #[test]
    fn test_zero_hash_fails() {
        let (store, c) = classifier(4);
        store.update(Policy::Static, "f").unwrap();
        assert!(matches!(c.classify(0, pkt(0)), Classification::Failed(_)));
    }

    #[test]
    fn test_static_routes_inside_mask() {
        let (store, c) = classifier(8);
        store.update(Policy::Static, "3").unwrap();
        for hash in (1..2000u32).map(|h| h.wrapping_mul(2_654_435_761)) {
            match c.classify(5, pkt(hash)) {
                Classification::Cpu(cpu, _) => assert!(cpu <= 1, "cpu {cpu}"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_established_flow_is_sticky() {
        let (store, c) = classifier(8);
        store.update(Policy::Static, "ff").unwrap();
        let first = c.resolve(0xdead_beef, Cluster::All).unwrap();
        for _ in 0..10 {
            assert_eq!(c.resolve(0xdead_beef, Cluster::All), Some(first));
        }
        assert_eq!(c.flow_count(), 1);
    }

    #[test]
    fn test_newflow_then_policy_change_resteers() {
        let (store, c) = classifier(8);
        store.update(Policy::Static, "1").unwrap();
        store.update(Policy::NewFlow, "80").unwrap();
        assert_eq!(c.resolve(77, Cluster::All), Some(7));
        assert_eq!(c.resolve(77, Cluster::All), Some(7));

        // The placing snapshot is gone; the flow follows the established order.
        store.clear(Policy::NewFlow);
        assert_eq!(c.resolve(77, Cluster::All), Some(0));
    }

    #[test]
    fn test_offline_cpu_skipped_and_evicted() {
        let (store, c) = classifier(4);
        store.update(Policy::Static, "3").unwrap();
        let cpu = c.resolve(99, Cluster::All).unwrap();
        c.cpu_offline(cpu);
        assert_eq!(c.flow_count(), 0);
        let moved = c.resolve(99, Cluster::All).unwrap();
        assert_ne!(moved, cpu);
        assert!(moved <= 1);

        // Nothing online: the slot is returned and enqueue redirects.
        c.cpu_offline(moved);
        assert!(c.resolve(99, Cluster::All).is_some_and(|cpu| cpu <= 1));
        c.cpu_online(cpu);
        assert_eq!(c.resolve(99, Cluster::All), Some(cpu));
    }

    #[test]
    fn test_cluster_preference() {
        let config = crate::config::McpsConfig::with_cpus(8);
        let store = Arc::new(ArpsStore::new(Topology::from_config(&config).unwrap()));
        let c = ArpsClassifier::new(Arc::clone(&store));
        store.update(Policy::Static, "ff").unwrap();
        for hash in 1..200u32 {
            let cpu = c.resolve(hash << 20, Cluster::Big).unwrap();
            assert!((4..8).contains(&cpu));
        }
    }

    #[test]
    fn test_hints() {
        let (store, c) = classifier(4);
        store.update(Policy::Static, "1").unwrap();
        let skip = pkt(3).with_flag(Packet::FLAG_GRO_SKIP);
        assert!(matches!(c.classify(0, skip), Classification::GroBypass(0, _)));

        let c = c.with_direct_gro(true);
        assert!(matches!(c.classify(0, pkt(3)), Classification::DirectGro(_)));
        assert!(matches!(c.classify(1, pkt(3)), Classification::Cpu(0, _)));
    }

    #[test]
    fn test_flow_table_bounded() {
        let (store, c) = classifier(4);
        store.update(Policy::Static, "f").unwrap();
        let c = c.with_max_flows(64);
        for hash in 1..=1000u32 {
            let _ = c.resolve(hash, Cluster::All);
        }
        assert!(c.flow_count() <= 64);
        assert!(c.flow_count() > 0);
    }

    #[test]
    fn test_migrate_flows() {
        let (store, c) = classifier(4);
        store.update(Policy::Static, "f").unwrap();
        let on_zero: Vec<u32> = (1..400u32)
            .filter(|&h| c.resolve(h, Cluster::All) == Some(0))
            .collect();
        assert!(on_zero.len() > 2);

        assert_eq!(c.migrate_flows(0, 3, FlowSelect::All), on_zero.len());
        for &hash in &on_zero {
            assert_eq!(c.resolve(hash, Cluster::All), Some(3));
        }
        assert_eq!(c.migrate_flows(0, 3, FlowSelect::All), 0);
        assert_eq!(c.migrate_flows(3, 3, FlowSelect::All), 0);

        assert!(c.migrate_flow(on_zero[0], 1));
        assert_eq!(c.resolve(on_zero[0], Cluster::All), Some(1));
        assert!(!c.migrate_flow(0xffff_ffff, 1));
    }

    #[test]
    fn test_heavy_and_light_flows() {
        let (store, c) = classifier(2);
        store.update(Policy::Static, "1").unwrap();
        for _ in 0..5 {
            let _ = c.resolve(10, Cluster::All);
        }
        let _ = c.resolve(20, Cluster::All);
        for _ in 0..3 {
            let _ = c.resolve(30, Cluster::All);
        }

        assert_eq!(c.flow_packets(0, FlowSelect::Heaviest), Some(5));
        assert_eq!(c.flow_packets(0, FlowSelect::Lightest), Some(1));
        assert_eq!(c.flow_packets(1, FlowSelect::Heaviest), None);

        // Only the heaviest flow moves.
        assert_eq!(c.migrate_flows(0, 1, FlowSelect::Heaviest), 1);
        assert_eq!(c.resolve(10, Cluster::All), Some(1));
        assert_eq!(c.resolve(30, Cluster::All), Some(0));
        assert_eq!(c.flow_packets(1, FlowSelect::Heaviest), Some(6));

        assert_eq!(c.migrate_flows(0, 1, FlowSelect::Lightest), 1);
        assert_eq!(c.resolve(20, Cluster::All), Some(1));
    }

    #[test]
    fn test_move_option_decoding() {
        assert_eq!(FlowSelect::from_option(0).unwrap(), FlowSelect::All);
        assert_eq!(FlowSelect::from_option(2).unwrap(), FlowSelect::Lightest);
        assert!(FlowSelect::from_option(3).unwrap_err().is_rejected());
    }

    #[test]
    fn test_concurrent_resolve_is_consistent() {
        let (store, c) = classifier(8);
        store.update(Policy::Static, "ff").unwrap();
        let c = Arc::new(c);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    (1..=500u32)
                        .map(|h| c.resolve(h, Cluster::All))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<Option<usize>>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Every thread saw the same placement for every flow.
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(c.flow_count(), 500);
        let cpu = results[0][0].unwrap();
        assert!(c.flow_packets(cpu, FlowSelect::Heaviest).is_some_and(|p| p >= 4));
    }
}
