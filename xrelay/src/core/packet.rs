//! Packet-level data structures.
//!
//! A packet is one opaque IP datagram. The relay never looks inside it
//! except to pick the protocol tag handed to the interface and, for logging,
//! to summarise an IPv4 header.

use std::net::Ipv4Addr;

use bytes::Bytes;

/// Network-layer protocol of a packet, as reported to the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// IPv4 datagram.
    Ipv4,
    /// IPv6 datagram.
    Ipv6,
}

impl Protocol {
    /// Infers the protocol from the IP version nibble.
    ///
    /// Anything that is not recognisably IPv6 is tagged as IPv4.
    pub fn of_packet(packet: &[u8]) -> Self {
        match packet.first().map(|b| b >> 4) {
            Some(6) => Protocol::Ipv6,
            _ => Protocol::Ipv4,
        }
    }
}

/// A group of packets moved across the interface together.
///
/// `packets[i]` is tagged with `protocols[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBatch {
    packets: Vec<Bytes>,
    protocols: Vec<Protocol>,
}

impl PacketBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch, tagging each packet from its version nibble.
    pub fn from_packets<I, B>(packets: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut batch = Self::new();
        for packet in packets {
            let packet = packet.into();
            let protocol = Protocol::of_packet(&packet);
            batch.push(packet, protocol);
        }
        batch
    }

    /// Appends one packet.
    pub fn push(&mut self, packet: Bytes, protocol: Protocol) {
        self.packets.push(packet);
        self.protocols.push(protocol);
    }

    /// Number of packets in the batch.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Returns true if the batch holds no packets.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Total payload bytes in the batch.
    pub fn byte_len(&self) -> usize {
        self.packets.iter().map(Bytes::len).sum()
    }

    /// The packets, in order.
    pub fn packets(&self) -> &[Bytes] {
        &self.packets
    }

    /// The protocol tags, in order.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Iterates over packets with their tags.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, Protocol)> {
        self.packets.iter().zip(self.protocols.iter().copied())
    }

    /// Splits the batch into packets and tags.
    pub fn into_parts(self) -> (Vec<Bytes>, Vec<Protocol>) {
        (self.packets, self.protocols)
    }
}

/// Minimal IPv4 header summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4).
    pub header_len: usize,
    /// Total datagram length from the header.
    pub total_len: u16,
    /// Time to live.
    pub ttl: u8,
    /// Transport protocol number (6 = TCP, 17 = UDP, ...).
    pub protocol: u8,
    /// Source address.
    pub source: Ipv4Addr,
    /// Destination address.
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Minimum IPv4 header size.
    pub const MIN_LEN: usize = 20;

    /// Parses the fixed part of an IPv4 header.
    ///
    /// Returns `None` for short buffers and non-IPv4 packets.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < Self::MIN_LEN {
            return None;
        }

        let version = packet[0] >> 4;
        if version != 4 {
            return None;
        }

        let header_len = usize::from(packet[0] & 0x0F) * 4;
        if header_len < Self::MIN_LEN {
            return None;
        }

        Some(Self {
            header_len,
            total_len: u16::from_be_bytes([packet[2], packet[3]]),
            ttl: packet[8],
            protocol: packet[9],
            source: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            destination: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_udp() -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&28u16.to_be_bytes());
        p[8] = 64;
        p[9] = 17;
        p[12..16].copy_from_slice(&[10, 8, 0, 2]);
        p[16..20].copy_from_slice(&[8, 8, 8, 8]);
        p
    }

    #[test]
    fn test_parse_ipv4_header() {
        let header = Ipv4Header::parse(&ipv4_udp()).unwrap();
        assert_eq!(header.header_len, 20);
        assert_eq!(header.total_len, 28);
        assert_eq!(header.protocol, 17);
        assert_eq!(header.source, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(header.destination, Ipv4Addr::new(8, 8, 8, 8));
    }

    #[test]
    fn test_parse_rejects_short_and_non_ipv4() {
        assert!(Ipv4Header::parse(&[0x45; 19]).is_none());

        let mut v6 = ipv4_udp();
        v6[0] = 0x60;
        assert!(Ipv4Header::parse(&v6).is_none());
    }

    #[test]
    fn test_protocol_from_version_nibble() {
        assert_eq!(Protocol::of_packet(&[0x45, 0]), Protocol::Ipv4);
        assert_eq!(Protocol::of_packet(&[0x60, 0]), Protocol::Ipv6);
        assert_eq!(Protocol::of_packet(&[]), Protocol::Ipv4);
    }

    #[test]
    fn test_batch_keeps_order_and_tags() {
        let mut v6 = ipv4_udp();
        v6[0] = 0x60;
        let batch = PacketBatch::from_packets(vec![ipv4_udp(), v6]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.protocols(), &[Protocol::Ipv4, Protocol::Ipv6]);
        assert_eq!(batch.byte_len(), 56);
        let (packets, _) = batch.into_parts();
        assert_eq!(packets[1][0], 0x60);
    }
}
