//! Affinity configuration store.
//!
//! Three policy slots (STATIC, DYNAMIC, NEWFLOW) each hold at most one
//! immutable [`ArpsMeta`] snapshot. Readers load a slot without taking a
//! lock; the single writer builds a fresh snapshot, swaps it in under a
//! short write lock, and waits out a grace period before releasing the
//! previous one.
//!
//! ## Read order
//!
//! - Established flows: DYNAMIC, then STATIC.
//! - New flows: NEWFLOW, then DYNAMIC, then STATIC.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::McpsConfig;
use crate::cpumask::CpuMask;
use crate::error::{McpsError, Result};

/// Number of cluster maps per snapshot.
pub const NR_CLUSTERS: usize = 4;

/// Upper bound on the grace-period wait. Past it, the retired snapshot is
/// left to its last reader to release.
const GRACE_PERIOD_TIMEOUT: Duration = Duration::from_millis(200);

/// First and largest sleep between grace-period checks.
const GRACE_BACKOFF_INITIAL: Duration = Duration::from_micros(10);
const GRACE_BACKOFF_MAX: Duration = Duration::from_millis(2);

/// Polls before the grace-period wait starts sleeping.
const GRACE_SPIN_LIMIT: u32 = 16;

/// Report for an empty slot.
const EMPTY_REPORT: &str = "0\n[0|0|0|0]\n0\n[0|0|0|0]\n";

/// CPU cluster a flow prefers.
///
/// Discriminants follow the `[all|lit|big|mid]` report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cluster {
    /// Any CPU in the snapshot.
    #[default]
    All = 0,
    /// Little cores.
    Lit = 1,
    /// Big cores.
    Big = 2,
    /// Mid cores.
    Mid = 3,
}

impl Cluster {
    /// All clusters in report order.
    pub const ALL: [Self; NR_CLUSTERS] = [Self::All, Self::Lit, Self::Big, Self::Mid];

    /// Cluster name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Lit => "lit",
            Self::Big => "big",
            Self::Mid => "mid",
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Policy slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Administrator-pinned baseline.
    Static,
    /// Runtime-tuned override for established flows.
    Dynamic,
    /// Placement for flows not seen before.
    NewFlow,
}

impl Policy {
    /// All slots.
    pub const ALL: [Self; 3] = [Self::Static, Self::Dynamic, Self::NewFlow];

    #[inline]
    const fn index(self) -> usize {
        match self {
            Self::Static => 0,
            Self::Dynamic => 1,
            Self::NewFlow => 2,
        }
    }

    /// Slot name as accepted by [`FromStr`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::NewFlow => "newflow",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = McpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "newflow" | "new_flow" | "new-flow" => Ok(Self::NewFlow),
            other => Err(McpsError::UnknownPolicy(other.to_string())),
        }
    }
}

/// CPU layout the snapshots are built against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Number of possible CPUs.
    pub nr_cpus: usize,
    /// Little cluster.
    pub little: CpuMask,
    /// Mid cluster.
    pub mid: CpuMask,
    /// Big cluster.
    pub big: CpuMask,
    /// CPUs reserved for IRQ handling.
    pub reserved_irq: CpuMask,
}

impl Topology {
    /// Creates a topology with no cluster split and no reserved CPUs.
    #[must_use]
    pub fn flat(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            little: CpuMask::first_n(nr_cpus),
            mid: CpuMask::empty(),
            big: CpuMask::empty(),
            reserved_irq: CpuMask::empty(),
        }
    }

    /// Builds the topology described by a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a cluster mask does not parse.
    pub fn from_config(config: &McpsConfig) -> Result<Self> {
        let (little, mid, big, reserved_irq) = config.topology_masks()?;
        Ok(Self {
            nr_cpus: config.nr_cpus,
            little,
            mid,
            big,
            reserved_irq,
        })
    }

    /// Possible CPUs.
    #[must_use]
    pub fn possible(&self) -> CpuMask {
        CpuMask::first_n(self.nr_cpus)
    }

    fn cluster_mask(&self, cluster: Cluster) -> CpuMask {
        match cluster {
            Cluster::All => self.possible(),
            Cluster::Lit => self.little,
            Cluster::Big => self.big,
            Cluster::Mid => self.mid,
        }
    }
}

/// Ordered CPU list for hash-indexed selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuMap {
    cpus: Vec<u16>,
}

impl CpuMap {
    fn build(mask: &CpuMask, reference: &CpuMask) -> Self {
        Self {
            cpus: mask
                .and(reference)
                .iter()
                .filter_map(|cpu| u16::try_from(cpu).ok())
                .collect(),
        }
    }

    /// Number of CPUs in the map.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Returns true if the map is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// CPU at position `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<usize> {
        self.cpus.get(index).map(|&cpu| usize::from(cpu))
    }

    /// Iterates CPUs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().map(|&cpu| usize::from(cpu))
    }

    /// Scales a 32-bit hash into `0..len` without a division.
    #[inline]
    #[must_use]
    pub fn slot_for(&self, hash: u32) -> Option<usize> {
        if self.cpus.is_empty() {
            return None;
        }
        Some(((u64::from(hash) * self.cpus.len() as u64) >> 32) as usize)
    }
}

/// Immutable affinity snapshot.
#[derive(Debug)]
pub struct ArpsMeta {
    policy: Policy,
    generation: u64,
    nr_cpus: usize,
    mask: CpuMask,
    mask_filtered: CpuMask,
    maps: [CpuMap; NR_CLUSTERS],
    maps_filtered: [CpuMap; NR_CLUSTERS],
}

impl ArpsMeta {
    /// Builds a snapshot of `mask` against `topology`.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] if the mask, or the mask with
    /// reserved CPUs removed, has no possible CPU left.
    pub fn build(policy: Policy, mask: CpuMask, topology: &Topology, generation: u64) -> Result<Self> {
        let possible = topology.possible();
        let mask = mask.and(&possible);
        let mask_filtered = mask.and_not(&topology.reserved_irq);
        if mask.is_empty() {
            return Err(McpsError::rejected(format!("{policy}: no eligible cpu")));
        }
        if mask_filtered.is_empty() {
            return Err(McpsError::rejected(format!(
                "{policy}: every cpu in {mask} is reserved for irq"
            )));
        }

        let maps = Cluster::ALL.map(|c| CpuMap::build(&mask, &topology.cluster_mask(c)));
        let maps_filtered =
            Cluster::ALL.map(|c| CpuMap::build(&mask_filtered, &topology.cluster_mask(c)));

        Ok(Self {
            policy,
            generation,
            nr_cpus: topology.nr_cpus,
            mask,
            mask_filtered,
            maps,
            maps_filtered,
        })
    }

    /// Slot this snapshot was built for.
    #[must_use]
    pub const fn policy(&self) -> Policy {
        self.policy
    }

    /// Monotonic build counter across the store.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Configured CPU set.
    #[must_use]
    pub const fn mask(&self) -> &CpuMask {
        &self.mask
    }

    /// Configured CPU set minus reserved IRQ CPUs.
    #[must_use]
    pub const fn mask_filtered(&self) -> &CpuMask {
        &self.mask_filtered
    }

    /// Cluster map over the full mask.
    #[must_use]
    pub fn map(&self, cluster: Cluster) -> &CpuMap {
        &self.maps[cluster.index()]
    }

    /// Cluster map over the filtered mask.
    #[must_use]
    pub fn map_filtered(&self, cluster: Cluster) -> &CpuMap {
        &self.maps_filtered[cluster.index()]
    }

    /// Four-line report: mask, map lengths, filtered mask, filtered map
    /// lengths.
    #[must_use]
    pub fn report(&self) -> String {
        let lens = |maps: &[CpuMap; NR_CLUSTERS]| {
            format!(
                "[{}|{}|{}|{}]",
                maps[0].len(),
                maps[1].len(),
                maps[2].len(),
                maps[3].len()
            )
        };
        format!(
            "{}\n{}\n{}\n{}\n",
            self.mask.to_hex(self.nr_cpus),
            lens(&self.maps),
            self.mask_filtered.to_hex(self.nr_cpus),
            lens(&self.maps_filtered),
        )
    }
}

/// Outcome of a successful [`ArpsStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyChange {
    /// A new snapshot is live.
    Installed {
        /// Generation of the new snapshot.
        generation: u64,
    },
    /// An all-zero mask cleared the slot.
    Removed,
}

/// Versioned policy store.
pub struct ArpsStore {
    topology: RwLock<Topology>,
    slots: [ArcSwapOption<ArpsMeta>; 3],
    write_lock: Mutex<()>,
    generation: AtomicU64,
}

impl fmt::Debug for ArpsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArpsStore")
            .field("topology", &*self.topology.read())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ArpsStore {
    /// Creates a store with every slot empty.
    #[must_use]
    pub fn new(topology: Topology) -> Self {
        Self {
            topology: RwLock::new(topology),
            slots: [
                ArcSwapOption::empty(),
                ArcSwapOption::empty(),
                ArcSwapOption::empty(),
            ],
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a store from a configuration and installs its initial
    /// policies.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology or an initial policy is invalid.
    pub fn from_config(config: &McpsConfig) -> Result<Self> {
        let store = Self::new(Topology::from_config(config)?);
        let initial = [
            (Policy::Static, &config.policies.static_mask),
            (Policy::Dynamic, &config.policies.dynamic),
            (Policy::NewFlow, &config.policies.newflow),
        ];
        for (policy, value) in initial {
            if let Some(value) = value {
                store.update(policy, value)?;
            }
        }
        Ok(store)
    }

    /// Current topology.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology.read().clone()
    }

    /// Number of possible CPUs.
    #[must_use]
    pub fn nr_cpus(&self) -> usize {
        self.topology.read().nr_cpus
    }

    /// Replaces a slot from a hex CPU-set string.
    ///
    /// A well-formed all-zero mask clears the slot. Anything rejected leaves
    /// the current snapshot in place.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] for an empty or malformed
    /// string, or one that selects no eligible CPU.
    pub fn update(&self, policy: Policy, input: &str) -> Result<PolicyChange> {
        let nr_cpus = self.nr_cpus();
        let mask = CpuMask::parse(input, nr_cpus).map_err(|e| {
            warn!(%policy, input = input.trim(), error = %e, "policy update rejected");
            e
        })?;

        if mask.is_empty() {
            self.clear(policy);
            return Ok(PolicyChange::Removed);
        }

        let _writer = self.write_lock.lock();
        let meta = self.build(policy, mask).map_err(|e| {
            warn!(%policy, error = %e, "policy update rejected");
            e
        })?;
        let generation = meta.generation;
        let old = self.slots[policy.index()].swap(Some(Arc::new(meta)));
        drop(_writer);

        info!(%policy, mask = %mask, generation, "policy installed");
        if let Some(old) = old {
            retire(old);
        }
        Ok(PolicyChange::Installed { generation })
    }

    fn build(&self, policy: Policy, mask: CpuMask) -> Result<ArpsMeta> {
        let topology = self.topology.read();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        ArpsMeta::build(policy, mask, &topology, generation)
    }

    /// Empties a slot. Returns true if it held a snapshot.
    pub fn clear(&self, policy: Policy) -> bool {
        let old = {
            let _writer = self.write_lock.lock();
            self.slots[policy.index()].swap(None)
        };
        match old {
            Some(old) => {
                info!(%policy, "policy removed");
                retire(old);
                true
            }
            None => false,
        }
    }

    /// Formatted report for a slot.
    #[must_use]
    pub fn get(&self, policy: Policy) -> String {
        self.slots[policy.index()]
            .load()
            .as_ref()
            .map_or_else(|| EMPTY_REPORT.to_string(), |meta| meta.report())
    }

    /// Snapshot in a slot.
    #[must_use]
    pub fn load(&self, policy: Policy) -> Option<Arc<ArpsMeta>> {
        self.slots[policy.index()].load_full()
    }

    /// Snapshot for established flows: DYNAMIC, then STATIC.
    #[must_use]
    pub fn established(&self) -> Option<Arc<ArpsMeta>> {
        self.load(Policy::Dynamic)
            .or_else(|| self.load(Policy::Static))
    }

    /// Snapshot for new flows: NEWFLOW, then the established order.
    #[must_use]
    pub fn newflow(&self) -> Option<Arc<ArpsMeta>> {
        self.load(Policy::NewFlow).or_else(|| self.established())
    }

    /// Rebuilds a slot from its own mask against the current topology.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] if the slot is empty or the
    /// rebuilt snapshot would have no eligible CPU; the slot is unchanged.
    pub fn refresh(&self, policy: Policy) -> Result<()> {
        let _writer = self.write_lock.lock();
        let Some(current) = self.slots[policy.index()].load_full() else {
            return Err(McpsError::rejected(format!("{policy}: slot is empty")));
        };
        let meta = self.build(policy, current.mask)?;
        let generation = meta.generation;
        let old = self.slots[policy.index()].swap(Some(Arc::new(meta)));
        drop(_writer);
        drop(current);

        debug!(%policy, generation, "policy refreshed");
        if let Some(old) = old {
            retire(old);
        }
        Ok(())
    }

    /// Sets the reserved IRQ CPU set and refreshes every live slot.
    ///
    /// An empty string changes nothing. A malformed string resets the
    /// reservation to the empty set. Returns the reservation in effect.
    pub fn set_reserved_irq_mask(&self, input: &str) -> CpuMask {
        if input.trim().is_empty() {
            return self.reserved_irq_mask();
        }
        let nr_cpus = self.nr_cpus();
        let mask = CpuMask::parse(input, nr_cpus).unwrap_or_else(|e| {
            warn!(input = input.trim(), error = %e, "invalid reserved irq mask, clearing");
            CpuMask::empty()
        });
        self.topology.write().reserved_irq = mask;
        info!(mask = %mask, "reserved irq mask updated");

        for policy in Policy::ALL {
            if self.load(policy).is_none() {
                continue;
            }
            if let Err(e) = self.refresh(policy) {
                warn!(%policy, error = %e, "keeping previous snapshot");
            }
        }
        mask
    }

    /// Reserved IRQ CPU set.
    #[must_use]
    pub fn reserved_irq_mask(&self) -> CpuMask {
        self.topology.read().reserved_irq
    }

    /// Reserved IRQ CPU set in report form.
    #[must_use]
    pub fn reserved_irq_report(&self) -> String {
        let topology = self.topology.read();
        format!("{}\n", topology.reserved_irq.to_hex(topology.nr_cpus))
    }

    /// Empties every slot, newest-read first.
    pub fn release_all(&self) {
        for policy in Policy::ALL.into_iter().rev() {
            self.clear(policy);
        }
    }
}

/// Waits until no reader holds `old`, then releases it.
///
/// Callers must have already unpublished `old`. A store on the slot settles
/// any outstanding lock-free read guards into strong references, so the
/// strong count covers every reader still inside its critical section.
///
/// Polls with a short spin, then sleeps with exponential backoff.
fn retire(old: Arc<ArpsMeta>) {
    let start = Instant::now();
    let mut spins = 0;
    let mut delay = GRACE_BACKOFF_INITIAL;
    while Arc::strong_count(&old) > 1 {
        let elapsed = start.elapsed();
        if elapsed > GRACE_PERIOD_TIMEOUT {
            debug!(
                generation = old.generation,
                readers = Arc::strong_count(&old) - 1,
                "grace period timed out, last reader releases snapshot"
            );
            return;
        }
        if spins < GRACE_SPIN_LIMIT {
            spins += 1;
            std::thread::yield_now();
            continue;
        }
        std::thread::sleep(delay.min(GRACE_PERIOD_TIMEOUT.saturating_sub(elapsed)));
        delay = (delay * 2).min(GRACE_BACKOFF_MAX);
    }
    drop(old);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology8() -> Topology {
        Topology::from_config(&McpsConfig::with_cpus(8)).unwrap()
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("static".parse::<Policy>().unwrap(), Policy::Static);
        assert_eq!("DYNAMIC".parse::<Policy>().unwrap(), Policy::Dynamic);
        assert_eq!("newflow\n".parse::<Policy>().unwrap(), Policy::NewFlow);
        assert!(matches!(
            "bogus".parse::<Policy>(),
            Err(McpsError::UnknownPolicy(_))
        ));
        assert_eq!(Policy::NewFlow.to_string(), "newflow");
    }

    #[test]
    fn test_build_maps() {
        let topo = topology8();
        let meta = ArpsMeta::build(Policy::Static, CpuMask::parse("f0", 8).unwrap(), &topo, 1)
            .unwrap();
        assert_eq!(meta.map(Cluster::All).len(), 4);
        assert_eq!(meta.map(Cluster::Lit).len(), 0);
        assert_eq!(meta.map(Cluster::Big).len(), 4);
        // Mid is 0x70: cpus 4, 5, 6.
        assert_eq!(meta.map(Cluster::Mid).len(), 3);
        assert_eq!(meta.map(Cluster::Big).iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        // Reserved "04" (cpu 2) is not in f0.
        assert_eq!(meta.mask_filtered(), meta.mask());
    }

    #[test]
    fn test_report_format() {
        let store = ArpsStore::new(topology8());
        assert_eq!(store.get(Policy::Static), "0\n[0|0|0|0]\n0\n[0|0|0|0]\n");

        store.update(Policy::Static, "f0").unwrap();
        assert_eq!(store.get(Policy::Static), "f0\n[4|0|4|3]\nf0\n[4|0|4|3]\n");

        store.update(Policy::Static, "0f").unwrap();
        // cpu 2 is reserved for irq.
        assert_eq!(store.get(Policy::Static), "0f\n[4|4|0|0]\n0b\n[3|3|0|0]\n");
    }

    #[test]
    fn test_update_rejects_keep_previous() {
        let store = ArpsStore::new(topology8());
        store.update(Policy::Static, "3").unwrap();
        let before = store.get(Policy::Static);

        assert!(store.update(Policy::Static, "").unwrap_err().is_rejected());
        assert!(store.update(Policy::Static, "xyz").unwrap_err().is_rejected());
        assert!(store.update(Policy::Static, "100").unwrap_err().is_rejected());
        // Only the reserved cpu: nothing eligible once filtered.
        assert!(store.update(Policy::Static, "4").unwrap_err().is_rejected());

        assert_eq!(store.get(Policy::Static), before);
    }

    #[test]
    fn test_zero_mask_removes() {
        let store = ArpsStore::new(topology8());
        store.update(Policy::Dynamic, "ff").unwrap();
        assert_eq!(store.update(Policy::Dynamic, "0").unwrap(), PolicyChange::Removed);
        assert!(store.load(Policy::Dynamic).is_none());
        assert!(!store.clear(Policy::Dynamic));
    }

    #[test]
    fn test_fallback_order() {
        let store = ArpsStore::new(topology8());
        assert!(store.established().is_none());
        assert!(store.newflow().is_none());

        store.update(Policy::Static, "3").unwrap();
        assert_eq!(store.established().unwrap().policy(), Policy::Static);
        assert_eq!(store.newflow().unwrap().policy(), Policy::Static);

        store.update(Policy::Dynamic, "c").unwrap();
        assert_eq!(store.established().unwrap().policy(), Policy::Dynamic);
        assert_eq!(store.newflow().unwrap().policy(), Policy::Dynamic);

        store.update(Policy::NewFlow, "f0").unwrap();
        assert_eq!(store.established().unwrap().policy(), Policy::Dynamic);
        assert_eq!(store.newflow().unwrap().policy(), Policy::NewFlow);
    }

    #[test]
    fn test_reserved_mask_refreshes_slots() {
        let store = ArpsStore::new(topology8());
        store.update(Policy::Static, "0f").unwrap();
        let gen = store.load(Policy::Static).unwrap().generation();

        let applied = store.set_reserved_irq_mask("01");
        assert_eq!(applied, CpuMask::from_cpus([0]));
        let meta = store.load(Policy::Static).unwrap();
        assert!(meta.generation() > gen);
        assert_eq!(meta.mask_filtered(), &CpuMask::from_cpus([1, 2, 3]));
        assert_eq!(store.reserved_irq_report(), "01\n");

        // Malformed resets the reservation.
        assert!(store.set_reserved_irq_mask("nope").is_empty());
        assert_eq!(store.load(Policy::Static).unwrap().mask_filtered().weight(), 4);

        // Empty leaves it alone.
        store.set_reserved_irq_mask("02");
        assert_eq!(store.set_reserved_irq_mask("\n"), CpuMask::from_cpus([1]));
    }

    #[test]
    fn test_refresh_empty_slot() {
        let store = ArpsStore::new(topology8());
        assert!(store.refresh(Policy::NewFlow).unwrap_err().is_rejected());
    }

    #[test]
    fn test_retire_waits_for_reader() {
        let store = Arc::new(ArpsStore::new(topology8()));
        store.update(Policy::Static, "1").unwrap();
        let reader = store.load(Policy::Static).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.update(Policy::Static, "2").unwrap())
        };
        std::thread::sleep(Duration::from_millis(10));
        // The old snapshot stays valid while held.
        assert_eq!(reader.mask(), &CpuMask::from_cpus([0]));
        drop(reader);
        writer.join().unwrap();
        assert_eq!(store.load(Policy::Static).unwrap().mask(), &CpuMask::from_cpus([1]));
    }

    #[test]
    fn test_retire_backs_off_until_released() {
        let old = Arc::new(
            ArpsMeta::build(Policy::Static, CpuMask::from_cpus([0]), &topology8(), 1).unwrap(),
        );
        let reader = Arc::clone(&old);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(reader);
        });

        let start = Instant::now();
        retire(old);
        assert!(start.elapsed() >= Duration::from_millis(20));
        releaser.join().unwrap();
    }

    #[test]
    fn test_slot_for_scaling() {
        let map = CpuMap::build(&CpuMask::from_cpus([0, 1]), &CpuMask::first_n(8));
        assert_eq!(map.slot_for(0), Some(0));
        assert_eq!(map.slot_for(u32::MAX), Some(1));
        assert_eq!(CpuMap::default().slot_for(7), None);
    }
}
