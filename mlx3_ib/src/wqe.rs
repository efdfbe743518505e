//! The wire headers a send descriptor can carry inline.
//!
//! These follow the InfiniBand packet format: a local route header,
//! a base transport header and the extended transport header of the
//! operation, datagram or RDMA.

use modular_bitfield_msb::{bitfield, specifiers::{B11, B2, B24, B4, B5, B7}};

/// The transport opcode for an unreliable datagram send.
pub(super) const BTH_OPCODE_UD_SEND_ONLY: u8 = 0x64;
/// The transport opcode for an RDMA write carried by a single packet.
pub(super) const BTH_OPCODE_RDMA_WRITE_ONLY: u8 = 0x0a;
/// Next header: an InfiniBand transport packet without a GRH.
const LRH_LNH_IBA_LOCAL: u8 = 2;
const LRH_VERSION: u8 = 0;
const BTH_VERSION: u8 = 0;

/// The local route header, addressing a packet within one subnet.
#[bitfield]
pub(super) struct LocalRouteHeader {
    virtual_lane: B4,
    link_version: B4,
    service_level: B4,
    #[skip] __: B2,
    next_header: B2,
    destination_lid: u16,
    #[skip] __: B5,
    packet_length: B11,
    source_lid: u16,
}

/// The base transport header.
#[bitfield]
pub(super) struct BaseTransportHeader {
    opcode: u8,
    solicited: bool,
    migration_request: bool,
    pad_count: B2,
    version: B4,
    partition_key: u16,
    #[skip] __: u8,
    destination_qpn: B24,
    ack_request: bool,
    #[skip] __: B7,
    packet_sequence_number: B24,
}

/// The datagram extended transport header.
#[bitfield]
pub(super) struct DatagramExtendedTransportHeader {
    queue_key: u32,
    #[skip] __: u8,
    source_qpn: B24,
}

/// The RDMA extended transport header, carrying the remote buffer.
#[bitfield]
pub(super) struct RdmaExtendedTransportHeader {
    virtual_address: u64,
    remote_key: u32,
    dma_length: u32,
}

/// Build the route header for a single-packet send.
///
/// `words` counts four-byte words over all headers, the padded payload
/// and the checksum.
fn route_header(
    source_lid: u16, destination_lid: u16, service_level: u8, words: usize,
) -> LocalRouteHeader {
    let mut lrh = LocalRouteHeader::new();
    lrh.set_virtual_lane(0);
    lrh.set_link_version(LRH_VERSION);
    lrh.set_service_level(service_level);
    lrh.set_next_header(LRH_LNH_IBA_LOCAL);
    lrh.set_destination_lid(destination_lid);
    lrh.set_packet_length(words.try_into().unwrap());
    lrh.set_source_lid(source_lid);
    lrh
}

fn base_transport_header(
    opcode: u8, padding: usize, partition_key: u16, destination_qpn: u32,
    packet_sequence_number: u32,
) -> BaseTransportHeader {
    let mut bth = BaseTransportHeader::new();
    bth.set_opcode(opcode);
    bth.set_pad_count(padding.try_into().unwrap());
    bth.set_version(BTH_VERSION);
    bth.set_partition_key(partition_key);
    bth.set_destination_qpn(destination_qpn);
    bth.set_packet_sequence_number(packet_sequence_number);
    bth
}

/// The full header of an unreliable datagram packet, as it would be
/// placed inline in front of the payload.
pub(super) struct UdHeader {
    pub(super) lrh: LocalRouteHeader,
    pub(super) bth: BaseTransportHeader,
    pub(super) deth: DatagramExtendedTransportHeader,
}

impl UdHeader {
    /// Build the headers for a single-packet datagram send.
    ///
    /// `payload_length` is in bytes.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        source_lid: u16, destination_lid: u16, service_level: u8,
        partition_key: u16, destination_qpn: u32, source_qpn: u32,
        queue_key: u32, packet_sequence_number: u32, payload_length: usize,
    ) -> Self {
        const ICRC_SIZE: usize = 4;
        let padding = payload_length.next_multiple_of(4) - payload_length;
        let words = (Self::SIZE + payload_length + padding + ICRC_SIZE) / 4;

        let mut deth = DatagramExtendedTransportHeader::new();
        deth.set_queue_key(queue_key);
        deth.set_source_qpn(source_qpn);

        Self {
            lrh: route_header(
                source_lid, destination_lid, service_level, words,
            ),
            bth: base_transport_header(
                BTH_OPCODE_UD_SEND_ONLY, padding, partition_key,
                destination_qpn, packet_sequence_number,
            ),
            deth,
        }
    }

    /// The size of the three headers together.
    pub(super) const SIZE: usize = 8 + 12 + 8;

    /// Serialize the headers back to back.
    pub(super) fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.lrh.bytes);
        bytes[8..20].copy_from_slice(&self.bth.bytes);
        bytes[20..28].copy_from_slice(&self.deth.bytes);
        bytes
    }
}

/// The full header of a single-packet RDMA write, addressing the
/// remote buffer directly.
pub(super) struct RdmaHeader {
    pub(super) lrh: LocalRouteHeader,
    pub(super) bth: BaseTransportHeader,
    pub(super) reth: RdmaExtendedTransportHeader,
}

impl RdmaHeader {
    /// Build the headers for an RDMA write carried by one packet.
    ///
    /// `virtual_address` and `remote_key` name the target buffer as
    /// registered on the remote node.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        source_lid: u16, destination_lid: u16, service_level: u8,
        partition_key: u16, destination_qpn: u32,
        packet_sequence_number: u32, virtual_address: u64, remote_key: u32,
        payload_length: usize,
    ) -> Self {
        const ICRC_SIZE: usize = 4;
        let padding = payload_length.next_multiple_of(4) - payload_length;
        let words = (Self::SIZE + payload_length + padding + ICRC_SIZE) / 4;

        let mut bth = base_transport_header(
            BTH_OPCODE_RDMA_WRITE_ONLY, padding, partition_key,
            destination_qpn, packet_sequence_number,
        );
        bth.set_ack_request(true);

        let mut reth = RdmaExtendedTransportHeader::new();
        reth.set_virtual_address(virtual_address);
        reth.set_remote_key(remote_key);
        reth.set_dma_length(payload_length.try_into().unwrap());

        Self {
            lrh: route_header(
                source_lid, destination_lid, service_level, words,
            ),
            bth,
            reth,
        }
    }

    /// The size of the three headers together.
    pub(super) const SIZE: usize = 8 + 12 + 16;

    /// Serialize the headers back to back.
    pub(super) fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.lrh.bytes);
        bytes[8..20].copy_from_slice(&self.bth.bytes);
        bytes[20..36].copy_from_slice(&self.reth.bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;

    use super::*;

    #[test]
    fn headers_are_wire_sized() {
        assert_eq!(size_of::<LocalRouteHeader>(), 8);
        assert_eq!(size_of::<BaseTransportHeader>(), 12);
        assert_eq!(size_of::<DatagramExtendedTransportHeader>(), 8);
        assert_eq!(size_of::<RdmaExtendedTransportHeader>(), 16);
    }

    #[test]
    fn datagram_header_packs_the_route() {
        let header = UdHeader::new(
            0x1234, 0x5678, 3, 0xffff, 0xabcdef, 0x123456, 0xdeadbeef,
            0x42, 64,
        );
        let bytes = header.to_bytes();
        // LRH: dlid in bytes 2..4, slid in bytes 6..8
        assert_eq!(&bytes[2..4], &[0x56, 0x78]);
        assert_eq!(&bytes[6..8], &[0x12, 0x34]);
        // BTH: opcode first, destination QP in bytes 13..16
        assert_eq!(bytes[8], BTH_OPCODE_UD_SEND_ONLY);
        assert_eq!(&bytes[13..16], &[0xab, 0xcd, 0xef]);
        // DETH: queue key first, source QP last
        assert_eq!(&bytes[20..24], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&bytes[25..28], &[0x12, 0x34, 0x56]);
    }

    #[test]
    fn packet_length_counts_words() {
        let header = UdHeader::new(1, 2, 0, 0xffff, 3, 4, 5, 6, 64);
        // 28 header bytes + 64 payload + 4 ICRC = 96 bytes = 24 words
        assert_eq!(header.lrh.packet_length(), 24);
    }

    #[test]
    fn rdma_header_packs_the_remote_buffer() {
        let header = RdmaHeader::new(
            0x1234, 0x5678, 0, 0xffff, 0xabcdef, 0x42,
            0x1122_3344_5566_7788, 0xcafe_f00d, 256,
        );
        let bytes = header.to_bytes();
        assert_eq!(bytes[8], BTH_OPCODE_RDMA_WRITE_ONLY);
        assert_eq!(&bytes[13..16], &[0xab, 0xcd, 0xef]);
        // RETH: virtual address, then remote key, then DMA length
        assert_eq!(&bytes[20..28], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(&bytes[28..32], &[0xca, 0xfe, 0xf0, 0x0d]);
        assert_eq!(&bytes[32..36], &256u32.to_be_bytes());
        // 36 header bytes + 256 payload + 4 ICRC = 296 bytes = 74 words
        assert_eq!(header.lrh.packet_length(), 74);
    }
}
