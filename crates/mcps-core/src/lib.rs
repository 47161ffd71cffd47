//! # mcps-core
//!
//! Receive-side multi-core packet steering.
//!
//! Packets arriving on one core are classified by flow and handed to a
//! per-CPU queue (a *pantry*) on the core that should process them. Each
//! pantry aggregates same-flow packets (GRO) before delivering them up
//! the stack.
//!
//! - **Affinity store**: three versioned policy snapshots (STATIC,
//!   DYNAMIC, NEWFLOW) read without locks
//! - **Classifier**: flow hash plus snapshot to destination CPU
//! - **Pantries**: bounded per-CPU queues with drop accounting
//! - **GRO**: eight buckets of at most eight held flows each
//! - **Cross-CPU delivery**: remote pantries are woken, never drained
//!   by the producer
//! - **Hotplug**: queued work follows a departing CPU to a substitute
//! - **Flow moves**: established flows can be re-pinned by hand, all at
//!   once or the heaviest/lightest per CPU
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                      Engine                       │
//! │  submit ──► Classifier ──► enqueue ──► Pantry[n]  │
//! │                 │                        │        │
//! │            ArpsStore                 GroTable     │
//! │   (STATIC/DYNAMIC/NEWFLOW)               │        │
//! │                                     PacketSink    │
//! │  ┌───────────┐  ┌──────────────────────────────┐  │
//! │  │ Notifier  │  │      HotplugCoordinator      │  │
//! │  └───────────┘  └──────────────────────────────┘  │
//! └───────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod arps;
pub mod classify;
pub mod clock;
pub mod config;
pub mod cpumask;
pub mod engine;
pub mod error;
pub mod gro;
pub mod hotplug;
pub mod notify;
pub mod packet;
pub mod pantry;
pub mod runtime;
pub mod stats;
pub mod tuning;

pub use arps::{ArpsMeta, ArpsStore, Cluster, Policy, PolicyChange, Topology};
pub use classify::{ArpsClassifier, Classification, ClassificationSource, FlowSelect};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::McpsConfig;
pub use cpumask::CpuMask;
pub use engine::{
    CollectingSink, CountingSink, DiscardSink, DropReason, Engine, EngineBuilder, EngineSnapshot,
    PacketSink, Verdict,
};
pub use error::{McpsError, Result};
pub use gro::{AppendMerge, GroProtocol, GroResult, MergeOutcome};
pub use hotplug::{CpuState, HotplugRecord};
pub use notify::{Event, Signal};
pub use packet::Packet;
pub use pantry::Pantry;
pub use runtime::Runtime;
pub use stats::{CounterKind, PantryCounters};
pub use tuning::{ArpsWeights, Tuning};
