//! Error types for the steering engine.

use thiserror::Error;

/// Result type alias for steering engine operations.
pub type Result<T> = std::result::Result<T, McpsError>;

/// Errors returned to administrative callers.
///
/// Packet-path failures are never reported through this type: they are
/// terminal [`Verdict`](crate::Verdict)s counted against a pantry or the
/// engine, and the packet is released on the spot.
#[derive(Debug, Error)]
pub enum McpsError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed, empty or unsatisfiable CPU-set string. The previous
    /// policy is retained.
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    /// CPU index outside the possible range.
    #[error("invalid cpu: {0}")]
    InvalidCpu(usize),

    /// Unknown policy slot name.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Hotplug transition error.
    #[error("hotplug error: {0}")]
    Hotplug(String),
}

impl McpsError {
    /// Creates a new configuration-rejected error.
    #[must_use]
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::ConfigRejected(msg.into())
    }

    /// Returns true if this error left the previous policy in place.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::ConfigRejected(_))
    }
}
