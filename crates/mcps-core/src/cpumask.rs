//! Fixed-size CPU bitsets.
//!
//! Masks are written and read in the kernel `bitmap_parse` / `%*pb` hex
//! format: hex digits, most significant first, optionally grouped into
//! comma-separated 32-bit chunks (`"f0"`, `"1,00000000"`).

use std::fmt;

use crate::error::{McpsError, Result};

/// Maximum number of CPUs a mask can describe.
pub const MAX_CPUS: usize = 256;

const WORD_BITS: usize = 64;
const WORDS: usize = MAX_CPUS / WORD_BITS;

/// A set of logical CPU indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    /// Creates an empty mask.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Creates a mask with CPUs `0..nr_cpus` set.
    #[must_use]
    pub fn first_n(nr_cpus: usize) -> Self {
        let mut mask = Self::empty();
        for cpu in 0..nr_cpus.min(MAX_CPUS) {
            mask.set(cpu);
        }
        mask
    }

    /// Creates a mask from a list of CPU indices. Indices past
    /// [`MAX_CPUS`] are ignored.
    #[must_use]
    pub fn from_cpus(cpus: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::empty();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    /// Parses a hex CPU-set string, rejecting bits at or above `nr_bits`.
    ///
    /// Surrounding whitespace (including the trailing newline written by
    /// shell tools) and a leading `0x` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`McpsError::ConfigRejected`] if the string is empty, contains
    /// a non-hex character, has an oversized comma chunk, or sets a bit at
    /// or beyond `nr_bits`.
    pub fn parse(input: &str, nr_bits: usize) -> Result<Self> {
        let trimmed = input.trim();
        let input = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if input.is_empty() {
            return Err(McpsError::rejected("empty cpu set"));
        }

        let chunks: Vec<&str> = input.split(',').collect();
        let mut digits: Vec<u8> = Vec::with_capacity(input.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.is_empty() {
                return Err(McpsError::rejected(format!("empty chunk in '{input}'")));
            }
            if chunks.len() > 1 && chunk.len() > 8 {
                return Err(McpsError::rejected(format!(
                    "chunk '{chunk}' exceeds 32 bits"
                )));
            }
            // Every chunk after the first is a full 32-bit group.
            if i > 0 {
                digits.extend(std::iter::repeat(0).take(8 - chunk.len()));
            }
            for c in chunk.chars() {
                let d = c.to_digit(16).ok_or_else(|| {
                    McpsError::rejected(format!("invalid hex digit '{c}' in '{input}'"))
                })?;
                digits.push(d as u8);
            }
        }

        let limit = nr_bits.min(MAX_CPUS);
        let mut mask = Self::empty();
        for (nibble, &d) in digits.iter().rev().enumerate() {
            if d == 0 {
                continue;
            }
            for bit in 0..4 {
                if d & (1 << bit) == 0 {
                    continue;
                }
                let cpu = nibble * 4 + bit;
                if cpu >= limit {
                    return Err(McpsError::rejected(format!(
                        "cpu {cpu} out of range in '{input}' (nr_cpus = {limit})"
                    )));
                }
                mask.set(cpu);
            }
        }
        Ok(mask)
    }

    /// Formats the mask as `%*pb` would for a `nr_bits`-wide bitmap.
    #[must_use]
    pub fn to_hex(&self, nr_bits: usize) -> String {
        let nr_bits = nr_bits.clamp(1, MAX_CPUS);
        let nr_chunks = nr_bits.div_ceil(32);
        let mut out = String::with_capacity(nr_chunks * 9);

        for chunk in (0..nr_chunks).rev() {
            let value = self.chunk32(chunk);
            if chunk == nr_chunks - 1 {
                let bits_in_chunk = (nr_bits - 1) % 32 + 1;
                let width = bits_in_chunk.div_ceil(4);
                out.push_str(&format!("{value:0width$x}"));
            } else {
                out.push_str(&format!(",{value:08x}"));
            }
        }
        out
    }

    fn chunk32(&self, chunk: usize) -> u32 {
        let bit = chunk * 32;
        (self.bits[bit / WORD_BITS] >> (bit % WORD_BITS)) as u32
    }

    /// Adds a CPU to the set.
    #[inline]
    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / WORD_BITS] |= 1 << (cpu % WORD_BITS);
        }
    }

    /// Removes a CPU from the set.
    #[inline]
    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / WORD_BITS] &= !(1 << (cpu % WORD_BITS));
        }
    }

    /// Returns true if the CPU is in the set.
    #[inline]
    #[must_use]
    pub const fn test(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / WORD_BITS] & (1 << (cpu % WORD_BITS)) != 0
    }

    /// Intersection.
    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.bits.iter_mut().zip(other.bits.iter()) {
            *w &= *o;
        }
        out
    }

    /// Difference: CPUs in `self` but not in `other`.
    #[must_use]
    pub fn and_not(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.bits.iter_mut().zip(other.bits.iter()) {
            *w &= !*o;
        }
        out
    }

    /// Union.
    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.bits.iter_mut().zip(other.bits.iter()) {
            *w |= *o;
        }
        out
    }

    /// Number of CPUs in the set.
    #[inline]
    #[must_use]
    pub fn weight(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if no CPU is set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Lowest CPU in the set.
    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Iterates set CPUs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for CpuMask {
    /// Minimal-width hex form; use [`CpuMask::to_hex`] for a fixed width.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let top = self.iter().last().map_or(1, |cpu| cpu + 1);
        f.write_str(&self.to_hex(top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_f0_roundtrip() {
        let mask = CpuMask::parse("f0", 8).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert_eq!(mask.to_hex(8), "f0");
    }

    #[test]
    fn test_parse_trailing_newline() {
        let mask = CpuMask::parse("3\n", 8).unwrap();
        assert_eq!(mask, CpuMask::from_cpus([0, 1]));
    }

    #[test]
    fn test_parse_comma_chunks() {
        let mask = CpuMask::parse("1,00000001", 64).unwrap();
        assert!(mask.test(0));
        assert!(mask.test(32));
        assert_eq!(mask.weight(), 2);

        // A short chunk after the first is still a full 32-bit group.
        let mask = CpuMask::parse("1,1", 64).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 32]);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(CpuMask::parse("", 8).unwrap_err().is_rejected());
        assert!(CpuMask::parse("  ", 8).unwrap_err().is_rejected());
        assert!(CpuMask::parse("zz", 8).unwrap_err().is_rejected());
        assert!(CpuMask::parse("1,,1", 64).unwrap_err().is_rejected());
        assert!(CpuMask::parse("1,123456789", 64).unwrap_err().is_rejected());
        // Bit 8 does not exist on an 8-CPU system.
        assert!(CpuMask::parse("100", 8).unwrap_err().is_rejected());
    }

    #[test]
    fn test_parse_hex_prefix() {
        assert_eq!(CpuMask::parse("0xf0", 8).unwrap(), CpuMask::parse("f0", 8).unwrap());
        assert_eq!(CpuMask::parse("0X3\n", 8).unwrap(), CpuMask::from_cpus([0, 1]));
        assert!(CpuMask::parse("0x", 8).unwrap_err().is_rejected());
        assert!(CpuMask::parse("x3", 8).unwrap_err().is_rejected());
    }

    #[test]
    fn test_parse_leading_zeros_allowed() {
        let mask = CpuMask::parse("000f", 8).unwrap();
        assert_eq!(mask.weight(), 4);
    }

    #[test]
    fn test_to_hex_widths() {
        let mask = CpuMask::from_cpus([0]);
        assert_eq!(mask.to_hex(4), "1");
        assert_eq!(mask.to_hex(8), "01");
        assert_eq!(mask.to_hex(32), "00000001");
        assert_eq!(mask.to_hex(36), "0,00000001");

        let mask = CpuMask::from_cpus([33, 4]);
        assert_eq!(mask.to_hex(64), "00000002,00000010");
    }

    #[test]
    fn test_set_ops() {
        let a = CpuMask::from_cpus([0, 1, 2, 3]);
        let b = CpuMask::from_cpus([2, 3, 4]);
        assert_eq!(a.and(&b), CpuMask::from_cpus([2, 3]));
        assert_eq!(a.and_not(&b), CpuMask::from_cpus([0, 1]));
        assert_eq!(a.or(&b).weight(), 5);
        assert!(a.and_not(&a).is_empty());
        assert_eq!(b.first(), Some(2));
    }

    #[test]
    fn test_high_cpus() {
        let mut mask = CpuMask::empty();
        mask.set(200);
        mask.set(MAX_CPUS);
        assert_eq!(mask.weight(), 1);
        assert!(mask.test(200));
        mask.clear(200);
        assert!(mask.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(CpuMask::from_cpus([4, 5, 6, 7]).to_string(), "f0");
        assert_eq!(CpuMask::empty().to_string(), "0");
    }
}
