//! Runtime tuning knobs.
//!
//! Two small values other components read on their own schedule: the
//! operating mode, a single decimal digit, and the affinity scoring
//! weights, [`ARPS_FACTORS`] unsigned integers. Both are replaced whole
//! and read without locking.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::error::{McpsError, Result};

/// Number of affinity scoring weights.
pub const ARPS_FACTORS: usize = 4;

/// Mode in effect until one is written.
pub const MODE_NONE: u8 = 0;

/// Affinity scoring weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArpsWeights(pub [u32; ARPS_FACTORS]);

impl ArpsWeights {
    /// Parses space-separated integers in C notation (`0x` hex, leading-`0`
    /// octal, otherwise decimal).
    ///
    /// Weights past [`ARPS_FACTORS`] are ignored and missing ones are zero.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] if any considered token is not
    /// an unsigned 32-bit integer.
    pub fn parse(input: &str) -> Result<Self> {
        let mut weights = [0u32; ARPS_FACTORS];
        for (slot, token) in weights.iter_mut().zip(input.split(' ')) {
            *slot = parse_uint(token)?;
        }
        Ok(Self(weights))
    }

    /// Each weight followed by a space, then a newline.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = String::new();
        for weight in self.0 {
            let _ = write!(out, "{weight} ");
        }
        out.push('\n');
        out
    }
}

/// Parses one unsigned integer the way the kernel's `kstrtouint(s, 0)`
/// does. A single trailing newline is allowed.
///
/// # Errors
///
/// Returns [`McpsError::ConfigRejected`] on anything else.
pub fn parse_uint(token: &str) -> Result<u32> {
    let token = token.strip_suffix('\n').unwrap_or(token);
    let (digits, radix) = if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        (hex, 16)
    } else if token.len() > 1 && token.starts_with('0') {
        (&token[1..], 8)
    } else {
        (token, 10)
    };
    if digits.is_empty() || digits.starts_with('+') {
        return Err(McpsError::rejected(format!("not an unsigned integer: '{token}'")));
    }
    u32::from_str_radix(digits, radix)
        .map_err(|e| McpsError::rejected(format!("not an unsigned integer: '{token}': {e}")))
}

/// Mode and weights.
#[derive(Debug)]
pub struct Tuning {
    mode: AtomicU8,
    weights: ArcSwap<ArpsWeights>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            mode: AtomicU8::new(MODE_NONE),
            weights: ArcSwap::from_pointee(ArpsWeights::default()),
        }
    }
}

impl Tuning {
    /// Current mode.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> u8 {
        self.mode.load(Ordering::Acquire)
    }

    /// Sets the mode from the first character of `value`. Anything other
    /// than a decimal digit leaves the mode unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] if `value` does not start with
    /// a digit.
    pub fn set_mode(&self, value: &str) -> Result<u8> {
        let digit = value
            .chars()
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| McpsError::rejected(format!("mode must be a digit: '{value}'")))?;
        let mode = digit as u8;
        let old = self.mode.swap(mode, Ordering::AcqRel);
        if old != mode {
            info!(old, mode, "mode changed");
        }
        Ok(mode)
    }

    /// `"<mode>\n"`.
    #[must_use]
    pub fn mode_report(&self) -> String {
        format!("{}\n", self.mode())
    }

    /// Current weights.
    #[must_use]
    pub fn weights(&self) -> Arc<ArpsWeights> {
        self.weights.load_full()
    }

    /// Replaces the weights. On error the previous weights stay in place.
    ///
    /// # Errors
    ///
    /// See [`ArpsWeights::parse`].
    pub fn set_weights(&self, value: &str) -> Result<ArpsWeights> {
        let weights = ArpsWeights::parse(value)?;
        self.weights.store(Arc::new(weights));
        debug!(?weights, "affinity weights replaced");
        Ok(weights)
    }

    /// Weights report, see [`ArpsWeights::report`].
    #[must_use]
    pub fn weights_report(&self) -> String {
        self.weights.load().report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uint_notations() {
        assert_eq!(parse_uint("12").unwrap(), 12);
        assert_eq!(parse_uint("0x1f").unwrap(), 31);
        assert_eq!(parse_uint("017").unwrap(), 15);
        assert_eq!(parse_uint("0").unwrap(), 0);
        assert_eq!(parse_uint("7\n").unwrap(), 7);
        assert!(parse_uint("").is_err());
        assert!(parse_uint("0x").is_err());
        assert!(parse_uint("-1").is_err());
        assert!(parse_uint("+1").is_err());
        assert!(parse_uint("09").is_err());
        assert!(parse_uint("4294967296").is_err());
    }

    #[test]
    fn test_mode_first_digit_only() {
        let tuning = Tuning::default();
        assert_eq!(tuning.mode_report(), "0\n");
        assert_eq!(tuning.set_mode("37").unwrap(), 3);
        assert_eq!(tuning.mode(), 3);
        assert!(tuning.set_mode("x").unwrap_err().is_rejected());
        assert!(tuning.set_mode("").is_err());
        assert_eq!(tuning.mode_report(), "3\n");
    }

    #[test]
    fn test_weights_partial_and_rejected() {
        let tuning = Tuning::default();
        assert_eq!(tuning.weights_report(), "0 0 0 0 \n");

        tuning.set_weights("5 0x10").unwrap();
        assert_eq!(*tuning.weights(), ArpsWeights([5, 16, 0, 0]));

        // Extra weights are ignored.
        tuning.set_weights("1 2 3 4 5 6").unwrap();
        assert_eq!(tuning.weights_report(), "1 2 3 4 \n");

        // A bad token leaves the previous weights in place.
        assert!(tuning.set_weights("9 nine").unwrap_err().is_rejected());
        assert!(tuning.set_weights("9  9").is_err());
        assert_eq!(tuning.weights_report(), "1 2 3 4 \n");
    }
}
