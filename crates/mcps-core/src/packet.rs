//! Owned receive buffers.
//!
//! A [`Packet`] owns its frame bytes and the parsed offsets the steering
//! and aggregation paths need, so nothing on the hot path re-parses
//! headers. Ownership moves exactly once per hand-off: into a pantry queue,
//! into a GRO bucket, or out to the delivery sink.

use bytes::{Bytes, BytesMut};

use crate::arps::Cluster;

/// Standard Ethernet header length.
pub const ETH_HLEN: usize = 14;

/// 802.1Q tagged Ethernet header length.
pub const VLAN_ETH_HLEN: usize = 18;

const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_P_8021Q: u16 = 0x8100;

/// Network protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Protocol {
    /// Unknown or unsupported protocol.
    #[default]
    Unknown = 0,
    /// Internet Control Message Protocol.
    Icmp = 1,
    /// Transmission Control Protocol.
    Tcp = 6,
    /// User Datagram Protocol.
    Udp = 17,
    /// ICMPv6.
    Icmpv6 = 58,
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::Icmpv6,
            _ => Self::Unknown,
        }
    }
}

/// Pre-parsed header layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMetadata {
    /// Length of the MAC header (14, or 18 with an inline VLAN tag).
    pub mac_len: u16,
    /// Offset to the L3 header.
    pub network_offset: u16,
    /// Offset to the L4 header.
    pub transport_offset: u16,
    /// Offset to the first byte after the L4 header.
    pub payload_offset: u16,
    /// L3 ethertype.
    pub ether_type: u16,
    /// L4 protocol.
    pub protocol: Protocol,
    /// Source port (TCP/UDP).
    pub src_port: u16,
    /// Destination port (TCP/UDP).
    pub dst_port: u16,
    /// TCP sequence number, when the packet is TCP.
    pub tcp_seq: u32,
    /// TCP acknowledgment number.
    pub tcp_ack: u32,
    /// TCP flags byte.
    pub tcp_flags: u8,
}

/// Per-packet aggregation state, valid while the packet is held in a GRO
/// bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroState {
    /// Number of wire packets coalesced into this unit.
    pub count: u16,
    /// Tick at which the unit entered its bucket.
    pub age: u64,
    /// Segment size of the coalesced unit; cleared on completion if
    /// nothing merged into it.
    pub coalesced_len: u32,
}

/// An owned receive buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    data: BytesMut,
    metadata: PacketMetadata,
    flow_hash: u32,
    dev: u32,
    vlan_tci: Option<u16>,
    cluster: Cluster,
    flags: u16,
    gro: GroState,
}

impl Packet {
    /// Aggregation must not hold this packet; deliver it as-is.
    pub const FLAG_FLUSH: u16 = 1 << 0;
    /// Set by the bucket scan when a held unit matches the incoming flow.
    pub const FLAG_SAME_FLOW: u16 = 1 << 1;
    /// Set by a merge step when the incoming buffer was absorbed and must
    /// be released.
    pub const FLAG_FREE: u16 = 1 << 2;
    /// Bypass the aggregator entirely.
    pub const FLAG_GRO_SKIP: u16 = 1 << 3;
    /// Flush this packet's flow once it has been aggregated (end of burst).
    pub const FLAG_FLUSH_SESSION: u16 = 1 << 4;

    /// Creates a packet from raw frame bytes and a precomputed flow hash,
    /// without parsing. The whole buffer is treated as payload behind a
    /// standard Ethernet header.
    #[must_use]
    pub fn from_parts(data: impl Into<BytesMut>, flow_hash: u32) -> Self {
        let data = data.into();
        let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
        let hdr = (ETH_HLEN as u16).min(len);
        Self {
            data,
            metadata: PacketMetadata {
                mac_len: hdr,
                network_offset: hdr,
                transport_offset: hdr,
                payload_offset: hdr,
                ..PacketMetadata::default()
            },
            flow_hash,
            dev: 0,
            vlan_tci: None,
            cluster: Cluster::All,
            flags: 0,
            gro: GroState::default(),
        }
    }

    /// Parses an Ethernet frame received on `dev` and computes its flow
    /// hash from the 5-tuple.
    #[must_use]
    pub fn parse(data: impl Into<BytesMut>, dev: u32) -> Self {
        let mut pkt = Self::from_parts(data, 0);
        pkt.dev = dev;
        pkt.parse_headers();
        pkt.flow_hash = pkt.calculate_flow_hash();
        pkt
    }

    fn parse_headers(&mut self) {
        let data = &self.data[..];
        if data.len() < ETH_HLEN {
            return;
        }

        let mut ether_type = u16::from_be_bytes([data[12], data[13]]);
        let mut mac_len = ETH_HLEN;
        if ether_type == ETH_P_8021Q && data.len() >= VLAN_ETH_HLEN {
            self.vlan_tci = Some(u16::from_be_bytes([data[14], data[15]]) & 0x0FFF);
            ether_type = u16::from_be_bytes([data[16], data[17]]);
            mac_len = VLAN_ETH_HLEN;
        }
        self.metadata.mac_len = mac_len as u16;
        self.metadata.network_offset = mac_len as u16;
        self.metadata.ether_type = ether_type;

        let l4 = match ether_type {
            ETH_P_IPV4 => self.parse_ipv4(mac_len),
            ETH_P_IPV6 => self.parse_ipv6(mac_len),
            _ => None,
        };
        let Some(l4) = l4 else {
            let end = self.data.len() as u16;
            self.metadata.transport_offset = end;
            self.metadata.payload_offset = end;
            return;
        };
        self.metadata.transport_offset = l4 as u16;
        self.parse_l4(l4);
    }

    fn parse_ipv4(&mut self, offset: usize) -> Option<usize> {
        let data = &self.data[..];
        if data.len() < offset + 20 {
            return None;
        }
        let ihl = (data[offset] & 0x0F) as usize * 4;
        self.metadata.protocol = Protocol::from(data[offset + 9]);

        // More-fragments flag or a non-zero fragment offset.
        let frag = u16::from_be_bytes([data[offset + 6], data[offset + 7]]);
        if frag & 0x3FFF != 0 {
            self.flags |= Self::FLAG_FLUSH;
        }
        Some(offset + ihl)
    }

    fn parse_ipv6(&mut self, offset: usize) -> Option<usize> {
        let data = &self.data[..];
        if data.len() < offset + 40 {
            return None;
        }
        self.metadata.protocol = Protocol::from(data[offset + 6]);
        Some(offset + 40)
    }

    fn parse_l4(&mut self, l4: usize) {
        let data = &self.data[..];
        let mut payload = data.len();
        match self.metadata.protocol {
            Protocol::Tcp if data.len() >= l4 + 20 => {
                self.metadata.src_port = u16::from_be_bytes([data[l4], data[l4 + 1]]);
                self.metadata.dst_port = u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]);
                self.metadata.tcp_seq =
                    u32::from_be_bytes([data[l4 + 4], data[l4 + 5], data[l4 + 6], data[l4 + 7]]);
                self.metadata.tcp_ack =
                    u32::from_be_bytes([data[l4 + 8], data[l4 + 9], data[l4 + 10], data[l4 + 11]]);
                self.metadata.tcp_flags = data[l4 + 13];
                let doff = (data[l4 + 12] >> 4) as usize * 4;
                payload = (l4 + doff).min(data.len());
            }
            Protocol::Udp if data.len() >= l4 + 8 => {
                self.metadata.src_port = u16::from_be_bytes([data[l4], data[l4 + 1]]);
                self.metadata.dst_port = u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]);
                payload = l4 + 8;
            }
            _ => {}
        }
        self.metadata.payload_offset = payload as u16;
    }

    /// FNV-1a over the 5-tuple, folded to 32 bits.
    fn calculate_flow_hash(&self) -> u32 {
        let data = &self.data[..];
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |byte: u8| {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        };

        let l3 = self.metadata.network_offset as usize;
        let addrs = match self.metadata.ether_type {
            ETH_P_IPV4 if data.len() >= l3 + 20 => Some(&data[l3 + 12..l3 + 20]),
            ETH_P_IPV6 if data.len() >= l3 + 40 => Some(&data[l3 + 8..l3 + 40]),
            _ => None,
        };
        let Some(addrs) = addrs else {
            return 0;
        };
        addrs.iter().copied().for_each(&mut mix);
        mix(self.metadata.protocol as u8);
        self.metadata.src_port.to_be_bytes().into_iter().for_each(&mut mix);
        self.metadata.dst_port.to_be_bytes().into_iter().for_each(&mut mix);

        let folded = (hash ^ (hash >> 32)) as u32;
        // Zero is reserved for "no hash".
        folded.max(1)
    }

    /// Flow hash; zero means the hash is unavailable.
    #[inline]
    #[must_use]
    pub const fn flow_hash(&self) -> u32 {
        self.flow_hash
    }

    /// Overrides the flow hash.
    #[inline]
    pub fn set_flow_hash(&mut self, hash: u32) {
        self.flow_hash = hash;
    }

    /// Ingress device index.
    #[inline]
    #[must_use]
    pub const fn dev(&self) -> u32 {
        self.dev
    }

    /// Sets the ingress device index.
    #[inline]
    #[must_use]
    pub fn with_dev(mut self, dev: u32) -> Self {
        self.dev = dev;
        self
    }

    /// VLAN tag, if present.
    #[inline]
    #[must_use]
    pub const fn vlan_tci(&self) -> Option<u16> {
        self.vlan_tci
    }

    /// Sets the VLAN tag.
    #[inline]
    #[must_use]
    pub fn with_vlan(mut self, tci: Option<u16>) -> Self {
        self.vlan_tci = tci;
        self
    }

    /// Cluster the flow naturally belongs to.
    #[inline]
    #[must_use]
    pub const fn cluster(&self) -> Cluster {
        self.cluster
    }

    /// Sets the cluster hint.
    #[inline]
    #[must_use]
    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = cluster;
        self
    }

    /// Parsed header layout.
    #[inline]
    #[must_use]
    pub const fn metadata(&self) -> &PacketMetadata {
        &self.metadata
    }

    /// Frame length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the frame is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whole frame.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// MAC header bytes.
    #[must_use]
    pub fn mac_header(&self) -> &[u8] {
        let end = (self.metadata.mac_len as usize).min(self.data.len());
        &self.data[..end]
    }

    /// L4 header bytes, options included.
    #[must_use]
    pub fn transport_header(&self) -> &[u8] {
        let end = (self.metadata.payload_offset as usize).min(self.data.len());
        let start = (self.metadata.transport_offset as usize).min(end);
        &self.data[start..end]
    }

    /// Bytes after the L4 header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let start = (self.metadata.payload_offset as usize).min(self.data.len());
        &self.data[start..]
    }

    /// Appends `bytes` to the frame (merge step).
    pub fn extend_payload(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Freezes the frame for hand-off to an immutable consumer.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Packet flags.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> u16 {
        self.flags
    }

    /// Returns true if the flag is set.
    #[inline]
    #[must_use]
    pub const fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Sets a flag.
    #[inline]
    pub fn add_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    /// Clears a flag.
    #[inline]
    pub fn clear_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    /// Builder form of [`Packet::add_flag`].
    #[inline]
    #[must_use]
    pub fn with_flag(mut self, flag: u16) -> Self {
        self.flags |= flag;
        self
    }

    /// Aggregation state.
    #[inline]
    #[must_use]
    pub const fn gro(&self) -> &GroState {
        &self.gro
    }

    /// Mutable aggregation state.
    #[inline]
    pub fn gro_mut(&mut self) -> &mut GroState {
        &mut self.gro
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn ipv4_frame(protocol: u8, l4_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN + 20 + l4_len];
        frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        frame[12..14].copy_from_slice(&ETH_P_IPV4.to_be_bytes());

        let ip = ETH_HLEN;
        frame[ip] = 0x45;
        frame[ip + 9] = protocol;
        frame[ip + 12..ip + 16].copy_from_slice(&[10, 0, 0, 1]);
        frame[ip + 16..ip + 20].copy_from_slice(&[10, 0, 0, 2]);
        frame
    }

    /// Builds an Ethernet/IPv4/TCP frame with `payload` bytes of data.
    pub(crate) fn tcp_frame(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        tcp_frame_ack(src_port, dst_port, seq, 0, payload)
    }

    /// Same as [`tcp_frame`] with an explicit acknowledgment number.
    pub(crate) fn tcp_frame_ack(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frame = ipv4_frame(6, 20);
        let tcp = ETH_HLEN + 20;
        frame[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
        frame[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
        frame[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
        frame[tcp + 8..tcp + 12].copy_from_slice(&ack.to_be_bytes());
        frame[tcp + 12] = 5 << 4;
        frame[tcp + 13] = 0x10;
        frame.extend_from_slice(payload);
        frame
    }

    /// Builds an Ethernet/IPv4/UDP datagram.
    pub(crate) fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = ipv4_frame(17, 8);
        let udp = ETH_HLEN + 20;
        frame[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
        frame[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
        let len = (8 + payload.len()) as u16;
        frame[udp + 4..udp + 6].copy_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_protocol_from() {
        assert_eq!(Protocol::from(6), Protocol::Tcp);
        assert_eq!(Protocol::from(17), Protocol::Udp);
        assert_eq!(Protocol::from(255), Protocol::Unknown);
    }

    #[test]
    fn test_parse_tcp() {
        let pkt = Packet::parse(tcp_frame(1234, 80, 1000, b"hello").as_slice(), 3);
        let meta = pkt.metadata();
        assert_eq!(meta.protocol, Protocol::Tcp);
        assert_eq!(meta.mac_len, 14);
        assert_eq!(meta.transport_offset, 34);
        assert_eq!(meta.payload_offset, 54);
        assert_eq!(meta.src_port, 1234);
        assert_eq!(meta.tcp_seq, 1000);
        assert_eq!(meta.tcp_ack, 0);
        assert_eq!(pkt.transport_header().len(), 20);
        assert_eq!(pkt.payload(), b"hello");
        assert_eq!(pkt.dev(), 3);
        assert_ne!(pkt.flow_hash(), 0);
        assert!(!pkt.has_flag(Packet::FLAG_FLUSH));
    }

    #[test]
    fn test_parse_ack_and_udp() {
        let pkt = Packet::parse(tcp_frame_ack(1, 2, 5, 0xdead_beef, b"").as_slice(), 0);
        assert_eq!(pkt.metadata().tcp_ack, 0xdead_beef);

        let pkt = Packet::parse(udp_frame(53, 5353, b"query").as_slice(), 0);
        assert_eq!(pkt.metadata().protocol, Protocol::Udp);
        assert_eq!(pkt.metadata().dst_port, 5353);
        assert_eq!(pkt.transport_header().len(), 8);
        assert_eq!(pkt.payload(), b"query");
    }

    #[test]
    fn test_flow_hash_stable_per_tuple() {
        let a = Packet::parse(tcp_frame(1, 2, 0, b"x").as_slice(), 0);
        let b = Packet::parse(tcp_frame(1, 2, 99, b"yyyy").as_slice(), 0);
        let c = Packet::parse(tcp_frame(1, 3, 0, b"x").as_slice(), 0);
        assert_eq!(a.flow_hash(), b.flow_hash());
        assert_ne!(a.flow_hash(), c.flow_hash());
    }

    #[test]
    fn test_fragment_requires_flush() {
        let mut frame = tcp_frame(1, 2, 0, b"x");
        frame[ETH_HLEN + 6] = 0x20; // MF
        let pkt = Packet::parse(frame.as_slice(), 0);
        assert!(pkt.has_flag(Packet::FLAG_FLUSH));
    }

    #[test]
    fn test_vlan_parse() {
        let inner = tcp_frame(1, 2, 0, b"");
        let mut frame = inner[..12].to_vec();
        frame.extend_from_slice(&ETH_P_8021Q.to_be_bytes());
        frame.extend_from_slice(&0x0064u16.to_be_bytes());
        frame.extend_from_slice(&inner[12..]);
        let pkt = Packet::parse(frame.as_slice(), 0);
        assert_eq!(pkt.vlan_tci(), Some(100));
        assert_eq!(pkt.metadata().mac_len as usize, VLAN_ETH_HLEN);
        assert_eq!(pkt.metadata().protocol, Protocol::Tcp);
    }

    #[test]
    fn test_non_ip_has_no_hash() {
        let pkt = Packet::parse(vec![0u8; 60].as_slice(), 0);
        assert_eq!(pkt.flow_hash(), 0);
    }

    #[test]
    fn test_flags() {
        let mut pkt = Packet::from_parts(&[0u8; 20][..], 7);
        assert!(!pkt.has_flag(Packet::FLAG_GRO_SKIP));
        pkt.add_flag(Packet::FLAG_GRO_SKIP);
        assert!(pkt.has_flag(Packet::FLAG_GRO_SKIP));
        pkt.clear_flag(Packet::FLAG_GRO_SKIP);
        assert_eq!(pkt.flags(), 0);
    }
}
