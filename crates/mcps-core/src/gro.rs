//! Generic receive offload.
//!
//! Each pantry owns one [`GroTable`]: [`N_BUCKETS`] hash buckets, each
//! holding at most [`MAX_HELD_PER_BUCKET`] partially coalesced units. A
//! bucket keeps its newest unit at the front, so flushing walks from the
//! back and sees units oldest first.
//!
//! ```text
//! Empty -> Held(count) -> Flushed -> Empty
//! ```
//!
//! The protocol-specific merge is a [`GroProtocol`] plug-in. Completed
//! units leave the table through a caller-supplied delivery closure, so
//! the table never decides where a packet goes next.

use std::collections::VecDeque;

use crate::packet::{Packet, Protocol, ETH_HLEN};

/// Number of hash buckets per table.
pub const N_BUCKETS: usize = 8;

/// Maximum units held in one bucket.
pub const MAX_HELD_PER_BUCKET: usize = 8;

/// TCP flags that end a coalesced unit: FIN, SYN, RST, URG, CWR.
const TCP_FLUSH_FLAGS: u8 = 0x01 | 0x02 | 0x04 | 0x20 | 0x80;

const TCP_FLAG_PSH: u8 = 0x08;

/// TCP header length without options.
const TCP_HDR_LEN: usize = 20;

/// What a merge step did with the incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming packet was absorbed into the held unit.
    Consumed,
    /// The held unit is complete; the incoming packet starts a new one.
    ReplacesHead,
    /// The held unit is complete and the incoming packet goes out as-is.
    NotMergeable,
}

/// Protocol merge plug-in.
pub trait GroProtocol: Send + Sync {
    /// Tries to merge `incoming` into `held`, both of the same flow.
    fn merge(&self, held: &mut Packet, incoming: &mut Packet) -> MergeOutcome;
}

/// Result of feeding one packet into a [`GroTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroResult {
    /// Delivered without being held.
    Normal,
    /// Held as a new unit.
    Held,
    /// Absorbed into a held unit; its buffer is still referenced.
    Merged,
    /// Absorbed into a held unit; its buffer was released.
    MergedFree,
}

/// Default merge step: appends TCP payload bytes to the held unit.
///
/// A segment merges only when it continues the held sequence, carries the
/// same acknowledgment number and no control flag, and its TCP header
/// (options included) matches the held one apart from PSH. Anything that
/// is not TCP is never merged. Units are capped at `max_bytes`.
#[derive(Debug, Clone, Copy)]
pub struct AppendMerge {
    max_bytes: usize,
}

impl AppendMerge {
    /// Creates a merge step capping units at `max_bytes`.
    #[must_use]
    pub const fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for AppendMerge {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_MERGE_BYTES)
    }
}

impl GroProtocol for AppendMerge {
    fn merge(&self, held: &mut Packet, incoming: &mut Packet) -> MergeOutcome {
        let held_meta = *held.metadata();
        let in_meta = *incoming.metadata();

        if held_meta.protocol != Protocol::Tcp || in_meta.protocol != Protocol::Tcp {
            return MergeOutcome::NotMergeable;
        }
        if in_meta.tcp_flags & TCP_FLUSH_FLAGS != 0 {
            return MergeOutcome::NotMergeable;
        }
        if in_meta.tcp_ack != held_meta.tcp_ack
            || !tcp_headers_match(held.transport_header(), incoming.transport_header())
        {
            return MergeOutcome::NotMergeable;
        }
        let expected = held_meta.tcp_seq.wrapping_add(held.payload().len() as u32);
        if in_meta.tcp_seq != expected {
            return MergeOutcome::ReplacesHead;
        }

        let payload = incoming.payload();
        if payload.is_empty() {
            return MergeOutcome::NotMergeable;
        }
        if held.len() + payload.len() > self.max_bytes {
            return MergeOutcome::ReplacesHead;
        }

        held.extend_payload(payload);
        let gro = held.gro_mut();
        gro.count = gro.count.saturating_add(1);
        incoming.add_flag(Packet::FLAG_FREE);
        MergeOutcome::Consumed
    }
}

/// Data offset, window and options must be identical; flags may differ
/// only in PSH.
fn tcp_headers_match(held: &[u8], incoming: &[u8]) -> bool {
    if held.len() != incoming.len() || held.len() < TCP_HDR_LEN {
        return false;
    }
    held[12] == incoming[12]
        && (held[13] ^ incoming[13]) & !TCP_FLAG_PSH == 0
        && held[14..16] == incoming[14..16]
        && held[TCP_HDR_LEN..] == incoming[TCP_HDR_LEN..]
}

/// Per-pantry aggregation table.
#[derive(Debug)]
pub struct GroTable {
    buckets: [VecDeque<Packet>; N_BUCKETS],
    bitmask: u8,
    held: usize,
}

impl Default for GroTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GroTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::with_capacity(MAX_HELD_PER_BUCKET)),
            bitmask: 0,
            held: 0,
        }
    }

    #[inline]
    const fn bucket_index(hash: u32) -> usize {
        hash as usize & (N_BUCKETS - 1)
    }

    /// Units currently held.
    #[inline]
    #[must_use]
    pub const fn held(&self) -> usize {
        self.held
    }

    /// Returns true if nothing is held.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.held == 0
    }

    /// Units held in bucket `index`.
    #[must_use]
    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, VecDeque::len)
    }

    /// Feeds one packet through the table.
    ///
    /// Units that complete as a side effect are passed to `deliver` in flow
    /// order, before the incoming packet if it is also delivered.
    pub fn receive<F>(
        &mut self,
        mut pkt: Packet,
        tick: u64,
        proto: &dyn GroProtocol,
        deliver: &mut F,
    ) -> GroResult
    where
        F: FnMut(Packet) + ?Sized,
    {
        if pkt.has_flag(Packet::FLAG_GRO_SKIP) {
            deliver(pkt);
            return GroResult::Normal;
        }

        let index = Self::bucket_index(pkt.flow_hash());
        let candidate = self.prepare(index, &pkt);

        if pkt.has_flag(Packet::FLAG_FLUSH) {
            if let Some(pos) = candidate {
                self.complete_at(index, pos, deliver);
            }
            deliver(pkt);
            return GroResult::Normal;
        }

        if let Some(pos) = candidate {
            let held = &mut self.buckets[index][pos];
            match proto.merge(held, &mut pkt) {
                MergeOutcome::Consumed => {
                    return if pkt.has_flag(Packet::FLAG_FREE) {
                        GroResult::MergedFree
                    } else {
                        GroResult::Merged
                    };
                }
                MergeOutcome::NotMergeable => {
                    self.complete_at(index, pos, deliver);
                    deliver(pkt);
                    return GroResult::Normal;
                }
                MergeOutcome::ReplacesHead => {
                    self.complete_at(index, pos, deliver);
                }
            }
        }

        if self.buckets[index].len() >= MAX_HELD_PER_BUCKET {
            self.flush_oldest(index, deliver);
        }

        let segment = pkt.payload().len() as u32;
        let gro = pkt.gro_mut();
        gro.count = 1;
        gro.age = tick;
        gro.coalesced_len = segment;
        pkt.clear_flag(Packet::FLAG_SAME_FLOW);
        self.buckets[index].push_front(pkt);
        self.bitmask |= 1 << index;
        self.held += 1;
        GroResult::Held
    }

    /// Marks every unit in the bucket with its same-flow verdict against
    /// `pkt` and returns the position of the newest match.
    fn prepare(&mut self, index: usize, pkt: &Packet) -> Option<usize> {
        let mut found = None;
        for (pos, held) in self.buckets[index].iter_mut().enumerate() {
            if same_flow(held, pkt) {
                held.add_flag(Packet::FLAG_SAME_FLOW);
                found.get_or_insert(pos);
            } else {
                held.clear_flag(Packet::FLAG_SAME_FLOW);
            }
        }
        found
    }

    fn complete_at<F: FnMut(Packet) + ?Sized>(&mut self, index: usize, pos: usize, deliver: &mut F) {
        if let Some(unit) = self.buckets[index].remove(pos) {
            self.held -= 1;
            deliver(complete(unit));
        }
        self.update_bit(index);
    }

    /// Completes the oldest unit of a full bucket to make room.
    fn flush_oldest<F: FnMut(Packet) + ?Sized>(&mut self, index: usize, deliver: &mut F) {
        if let Some(oldest) = self.buckets[index].pop_back() {
            self.held -= 1;
            deliver(complete(oldest));
        }
    }

    #[inline]
    fn update_bit(&mut self, index: usize) {
        if self.buckets[index].is_empty() {
            self.bitmask &= !(1 << index);
        }
    }

    /// Completes held units, oldest first.
    ///
    /// With `flush_old`, a bucket is left alone from the first unit whose
    /// age equals `tick`. Returns the number of units completed.
    pub fn flush<F: FnMut(Packet) + ?Sized>(&mut self, flush_old: bool, tick: u64, deliver: &mut F) -> usize {
        let mut flushed = 0;
        let mut bitmask = self.bitmask;
        while bitmask != 0 {
            let index = bitmask.trailing_zeros() as usize;
            bitmask &= bitmask - 1;

            let bucket = &mut self.buckets[index];
            while let Some(oldest) = bucket.back() {
                if flush_old && oldest.gro().age == tick {
                    break;
                }
                if let Some(unit) = bucket.pop_back() {
                    deliver(complete(unit));
                    flushed += 1;
                }
            }
            self.update_bit(index);
        }
        self.held -= flushed;
        flushed
    }

    /// Completes every held unit of one flow. Returns the number of units
    /// completed.
    pub fn flush_flow<F: FnMut(Packet) + ?Sized>(&mut self, hash: u32, deliver: &mut F) -> usize {
        let index = Self::bucket_index(hash);
        if self.bitmask & (1 << index) == 0 {
            return 0;
        }

        let bucket = &mut self.buckets[index];
        let mut flushed = 0;
        let mut pos = bucket.len();
        while pos > 0 {
            pos -= 1;
            if bucket[pos].flow_hash() != hash {
                continue;
            }
            if let Some(unit) = bucket.remove(pos) {
                deliver(complete(unit));
                flushed += 1;
            }
        }
        self.held -= flushed;
        self.update_bit(index);
        flushed
    }
}

/// Finishes a unit before it leaves the table.
fn complete(mut unit: Packet) -> Packet {
    unit.clear_flag(Packet::FLAG_SAME_FLOW);
    if unit.gro().count == 1 {
        unit.gro_mut().coalesced_len = 0;
    }
    unit
}

/// Same hash, device and VLAN tag, and identical MAC headers.
fn same_flow(held: &Packet, pkt: &Packet) -> bool {
    if held.flow_hash() != pkt.flow_hash()
        || held.dev() != pkt.dev()
        || held.vlan_tci() != pkt.vlan_tci()
    {
        return false;
    }
    let (a, b) = (held.mac_header(), pkt.mac_header());
    if a.len() == ETH_HLEN && b.len() == ETH_HLEN {
        return compare_ether_header(a, b);
    }
    a == b
}

/// Compares two 14-byte Ethernet headers as three machine words.
#[inline]
fn compare_ether_header(a: &[u8], b: &[u8]) -> bool {
    let word = |h: &[u8], at: usize| {
        u32::from_ne_bytes([h[at], h[at + 1], h[at + 2], h[at + 3]])
    };
    let half = |h: &[u8], at: usize| u16::from_ne_bytes([h[at], h[at + 1]]);

    ((word(a, 0) ^ word(b, 0))
        | (word(a, 4) ^ word(b, 4))
        | (word(a, 8) ^ word(b, 8))
        | u32::from(half(a, 12) ^ half(b, 12)))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{tcp_frame, tcp_frame_ack, udp_frame};

    fn tcp(src_port: u16, seq: u32, payload: &[u8]) -> Packet {
        Packet::parse(tcp_frame(src_port, 80, seq, payload).as_slice(), 1)
    }

    fn udp(src_port: u16, payload: &[u8]) -> Packet {
        Packet::parse(udp_frame(src_port, 53, payload).as_slice(), 1)
    }

    /// Absorbs every same-flow packet but leaves its buffer referenced.
    struct ShareMerge;

    impl GroProtocol for ShareMerge {
        fn merge(&self, held: &mut Packet, _incoming: &mut Packet) -> MergeOutcome {
            let gro = held.gro_mut();
            gro.count = gro.count.saturating_add(1);
            MergeOutcome::Consumed
        }
    }

    fn raw(hash: u32) -> Packet {
        Packet::from_parts(&[0u8; 64][..], hash)
    }

    #[test]
    fn test_hold_then_merge_in_sequence() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        assert_eq!(table.receive(tcp(1000, 1, b"abcd"), 0, &proto, &mut deliver), GroResult::Held);
        assert_eq!(
            table.receive(tcp(1000, 5, b"efgh"), 0, &proto, &mut deliver),
            GroResult::MergedFree
        );
        assert_eq!(table.held(), 1);

        assert_eq!(table.flush(false, 0, &mut deliver), 1);
        assert!(table.is_empty());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload(), b"abcdefgh");
        assert_eq!(out[0].gro().count, 2);
        assert_eq!(out[0].gro().coalesced_len, 4);
    }

    #[test]
    fn test_out_of_sequence_replaces_head() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        table.receive(tcp(1000, 1, b"abcd"), 0, &proto, &mut deliver);
        assert_eq!(table.receive(tcp(1000, 100, b"zz"), 0, &proto, &mut deliver), GroResult::Held);
        assert_eq!(table.held(), 1);
        drop(deliver);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload(), b"abcd");
    }

    #[test]
    fn test_single_segment_clears_coalesced_len() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        table.receive(tcp(1000, 1, b"abcd"), 0, &proto, &mut deliver);
        table.flush(false, 0, &mut deliver);
        assert_eq!(out[0].gro().count, 1);
        assert_eq!(out[0].gro().coalesced_len, 0);
    }

    #[test]
    fn test_ninth_flow_flushes_oldest() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        // Same bucket, distinct flows.
        for i in 0..8u32 {
            table.receive(raw(3 + i * 8), 0, &proto, &mut deliver);
        }
        assert_eq!(table.bucket_len(3), 8);
        assert_eq!(table.receive(raw(3 + 8 * 8), 0, &proto, &mut deliver), GroResult::Held);
        assert_eq!(table.bucket_len(3), 8);
        drop(deliver);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flow_hash(), 3);
    }

    #[test]
    fn test_flush_old_skips_current_tick() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        table.receive(raw(1), 4, &proto, &mut deliver);
        table.receive(raw(9), 5, &proto, &mut deliver);
        assert_eq!(table.flush(true, 5, &mut deliver), 1);
        assert_eq!(table.held(), 1);
        assert_eq!(table.flush(true, 5, &mut deliver), 0);
        assert_eq!(table.flush(true, 6, &mut deliver), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_flush_flag_bypasses_merge() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        table.receive(tcp(1000, 1, b"abcd"), 0, &proto, &mut deliver);
        let urgent = tcp(1000, 5, b"efgh").with_flag(Packet::FLAG_FLUSH);
        assert_eq!(table.receive(urgent, 0, &proto, &mut deliver), GroResult::Normal);
        assert!(table.is_empty());
        drop(deliver);
        // Held unit leaves first.
        assert_eq!(out[0].payload(), b"abcd");
        assert_eq!(out[1].payload(), b"efgh");
    }

    #[test]
    fn test_skip_flag_never_held() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        let pkt = raw(2).with_flag(Packet::FLAG_GRO_SKIP);
        assert_eq!(table.receive(pkt, 0, &proto, &mut deliver), GroResult::Normal);
        assert!(table.is_empty());
    }

    #[test]
    fn test_flush_flow() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        table.receive(raw(2), 0, &proto, &mut deliver);
        table.receive(raw(10), 0, &proto, &mut deliver);
        assert_eq!(table.flush_flow(10, &mut deliver), 1);
        assert_eq!(table.flush_flow(7, &mut deliver), 0);
        assert_eq!(table.held(), 1);
        drop(deliver);
        assert_eq!(out[0].flow_hash(), 10);
    }

    #[test]
    fn test_different_device_not_same_flow() {
        let a = tcp(1000, 1, b"a");
        let b = tcp(1000, 2, b"b").with_dev(9);
        assert!(!same_flow(&a, &b));
        let c = tcp(1000, 2, b"b").with_vlan(Some(5));
        assert!(!same_flow(&a, &c));
        assert!(same_flow(&a, &tcp(1000, 2, b"b")));
    }

    #[test]
    fn test_merge_cap() {
        let proto = AppendMerge::new(60);
        let mut held = tcp(1000, 1, b"abcd");
        let mut next = tcp(1000, 5, b"efgh");
        assert_eq!(proto.merge(&mut held, &mut next), MergeOutcome::ReplacesHead);
    }

    #[test]
    fn test_udp_datagrams_not_merged() {
        let mut table = GroTable::new();
        let proto = AppendMerge::default();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        assert_eq!(table.receive(udp(4000, b"one"), 0, &proto, &mut deliver), GroResult::Held);
        assert_eq!(table.receive(udp(4000, b"two"), 0, &proto, &mut deliver), GroResult::Normal);
        assert!(table.is_empty());
        drop(deliver);
        // Datagram boundaries survive and order is kept.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload(), b"one");
        assert_eq!(out[1].payload(), b"two");
        assert_eq!(out[0].gro().count, 1);
    }

    #[test]
    fn test_ack_mismatch_not_merged() {
        let proto = AppendMerge::default();
        let mut held = Packet::parse(tcp_frame_ack(1000, 80, 1, 7, b"abcd").as_slice(), 1);
        let mut next = Packet::parse(tcp_frame_ack(1000, 80, 5, 8, b"efgh").as_slice(), 1);
        assert_eq!(proto.merge(&mut held, &mut next), MergeOutcome::NotMergeable);
        assert_eq!(held.payload(), b"abcd");
        assert!(!next.has_flag(Packet::FLAG_FREE));

        let mut next = Packet::parse(tcp_frame_ack(1000, 80, 5, 7, b"efgh").as_slice(), 1);
        assert_eq!(proto.merge(&mut held, &mut next), MergeOutcome::Consumed);
    }

    #[test]
    fn test_header_mismatch_not_merged() {
        let proto = AppendMerge::default();
        let mut held = tcp(1000, 1, b"abcd");

        // PSH alone does not split a unit.
        let mut frame = tcp_frame(1000, 80, 5, b"efgh");
        frame[ETH_HLEN + 20 + 13] |= TCP_FLAG_PSH;
        let mut pushed = Packet::parse(frame.as_slice(), 1);
        assert_eq!(proto.merge(&mut held, &mut pushed), MergeOutcome::Consumed);

        // ECE does.
        let mut frame = tcp_frame(1000, 80, 9, b"ijkl");
        frame[ETH_HLEN + 20 + 13] |= 0x40;
        let mut ece = Packet::parse(frame.as_slice(), 1);
        assert_eq!(proto.merge(&mut held, &mut ece), MergeOutcome::NotMergeable);

        // So does a different window.
        let mut frame = tcp_frame(1000, 80, 9, b"ijkl");
        frame[ETH_HLEN + 20 + 14] = 0x7f;
        let mut window = Packet::parse(frame.as_slice(), 1);
        assert_eq!(proto.merge(&mut held, &mut window), MergeOutcome::NotMergeable);
    }

    #[test]
    fn test_consumed_without_release_reports_merged() {
        let mut table = GroTable::new();
        let mut out = Vec::new();
        let mut deliver = |p: Packet| out.push(p);

        assert_eq!(table.receive(raw(6), 0, &ShareMerge, &mut deliver), GroResult::Held);
        assert_eq!(table.receive(raw(6), 0, &ShareMerge, &mut deliver), GroResult::Merged);
        assert_eq!(table.held(), 1);
        assert_eq!(table.flush(false, 0, &mut deliver), 1);
        drop(deliver);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].gro().count, 2);
    }
}
