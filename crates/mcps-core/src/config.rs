//! Engine configuration.
//!
//! Loaded from TOML. Every field has a default so an empty file is a valid
//! configuration for the local machine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cpumask::{CpuMask, MAX_CPUS};
use crate::error::{McpsError, Result};

/// Default per-pantry queue capacity.
pub const DEFAULT_PANTRY_CAPACITY: usize = 30_000;

/// Default number of packets processed per drain pass.
pub const DEFAULT_QUOTA: usize = 128;

/// Default GRO age granularity (4 ms, one tick at HZ=250).
pub const DEFAULT_TICK_NS: u64 = 4_000_000;

/// Default upper bound on a coalesced unit.
pub const DEFAULT_MAX_MERGE_BYTES: usize = 65_535;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpsConfig {
    /// Number of possible CPUs; one pantry is created per CPU.
    pub nr_cpus: usize,
    /// Maximum input-queue length per pantry.
    pub pantry_capacity: usize,
    /// Packets processed per drain pass.
    pub quota: usize,
    /// Time-budget GRO flush interval. Zero leaves flushing to the caller.
    pub gro_flush_interval_ns: u64,
    /// GRO age granularity.
    pub tick_ns: u64,
    /// Largest frame the default merge step will build.
    pub max_merge_bytes: usize,
    /// CPU cluster layout.
    pub topology: TopologyConfig,
    /// Initial policy strings.
    pub policies: PolicyConfig,
    /// Substitute of last resort during CPU teardown.
    pub fallback_cpu: usize,
    /// Global steering switch.
    pub enabled: bool,
}

/// CPU cluster masks, in hex CPU-set form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Little (efficiency) cores.
    pub little: String,
    /// Mid cores.
    pub mid: String,
    /// Big (performance) cores.
    pub big: String,
    /// CPUs reserved for IRQ handling, excluded from filtered maps.
    pub reserved_irq: String,
}

/// Initial policy slot contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// STATIC slot.
    #[serde(rename = "static")]
    pub static_mask: Option<String>,
    /// DYNAMIC slot.
    pub dynamic: Option<String>,
    /// NEWFLOW slot.
    pub newflow: Option<String>,
}

impl Default for McpsConfig {
    fn default() -> Self {
        let nr_cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(MAX_CPUS);
        Self {
            nr_cpus,
            topology: TopologyConfig::for_cpus(nr_cpus),
            pantry_capacity: DEFAULT_PANTRY_CAPACITY,
            quota: DEFAULT_QUOTA,
            gro_flush_interval_ns: 0,
            tick_ns: DEFAULT_TICK_NS,
            max_merge_bytes: DEFAULT_MAX_MERGE_BYTES,
            policies: PolicyConfig::default(),
            fallback_cpu: 0,
            enabled: true,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            little: "f".to_string(),
            mid: "70".to_string(),
            big: "f0".to_string(),
            reserved_irq: "04".to_string(),
        }
    }
}

impl TopologyConfig {
    /// Single cluster of `nr_cpus` little cores, nothing reserved.
    #[must_use]
    pub fn flat(nr_cpus: usize) -> Self {
        Self {
            little: CpuMask::first_n(nr_cpus).to_hex(nr_cpus),
            mid: "0".to_string(),
            big: "0".to_string(),
            reserved_irq: "0".to_string(),
        }
    }

    /// The default 4/3/1 layout when it fits, a flat one otherwise.
    #[must_use]
    pub fn for_cpus(nr_cpus: usize) -> Self {
        if nr_cpus >= 8 {
            Self::default()
        } else {
            Self::flat(nr_cpus)
        }
    }
}

impl McpsConfig {
    /// Creates a default configuration for `nr_cpus` CPUs.
    #[must_use]
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            topology: TopologyConfig::for_cpus(nr_cpus),
            ..Self::default()
        }
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails
    /// validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| McpsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and that every mask parses against `nr_cpus`.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(McpsError::Config(format!(
                "nr_cpus must be in 1..={MAX_CPUS}, got {}",
                self.nr_cpus
            )));
        }
        if self.pantry_capacity == 0 {
            return Err(McpsError::Config("pantry_capacity must be non-zero".into()));
        }
        if self.quota == 0 {
            return Err(McpsError::Config("quota must be non-zero".into()));
        }
        if self.tick_ns == 0 {
            return Err(McpsError::Config("tick_ns must be non-zero".into()));
        }
        if self.max_merge_bytes == 0 {
            return Err(McpsError::Config("max_merge_bytes must be non-zero".into()));
        }
        if self.fallback_cpu >= self.nr_cpus {
            return Err(McpsError::Config(format!(
                "fallback_cpu {} out of range (nr_cpus = {})",
                self.fallback_cpu, self.nr_cpus
            )));
        }

        let topo = &self.topology;
        for (name, value) in [
            ("topology.little", &topo.little),
            ("topology.mid", &topo.mid),
            ("topology.big", &topo.big),
            ("topology.reserved_irq", &topo.reserved_irq),
        ] {
            CpuMask::parse(value, self.nr_cpus)
                .map_err(|e| McpsError::Config(format!("{name}: {e}")))?;
        }
        Ok(())
    }

    /// Parsed cluster masks `(little, mid, big, reserved_irq)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a mask does not parse.
    pub fn topology_masks(&self) -> Result<(CpuMask, CpuMask, CpuMask, CpuMask)> {
        let topo = &self.topology;
        Ok((
            CpuMask::parse(&topo.little, self.nr_cpus)?,
            CpuMask::parse(&topo.mid, self.nr_cpus)?,
            CpuMask::parse(&topo.big, self.nr_cpus)?,
            CpuMask::parse(&topo.reserved_irq, self.nr_cpus)?,
        ))
    }
}
