//! Frames as the ASIC delivers them to the CPU port.

use asic_knet::api::hw::Pph;
use asic_knet::api::hw::pph::fwd_op;
use asic_knet::config::{DMA_HDR_LEN, EMAC_HDR_LEN, FCS_LEN};
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Packet,
};

pub const HOST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
pub const STP_MAC: [u8; 6] = [0x01, 0x80, 0xC2, 0x00, 0x00, 0x00];

/// Device header fields a test cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxHeader {
    pub src_idx: u16,
    pub slice: u8,
    pub port: u8,
    pub reason: u16,
    pub dst_idx: u16,
    pub tc: u8,
    pub vlan: u16,
    pub vlan_pop: u8,
}

impl Default for RxHeader {
    fn default() -> Self {
        Self {
            src_idx: 0,
            slice: 0,
            port: 0,
            reason: 0,
            dst_idx: 0,
            tc: 0,
            vlan: 1,
            vlan_pop: 0,
        }
    }
}

impl RxHeader {
    /// Header of a frame that entered on logical port `port_di` with `reason`.
    pub fn new(port_di: u16, reason: u16) -> Self {
        Self {
            src_idx: port_di,
            reason,
            ..Self::default()
        }
    }

    pub fn write(&self, hdr: &mut [u8]) {
        hdr[..DMA_HDR_LEN].fill(0);
        let mut pph = Pph::new_unchecked(&mut hdr[EMAC_HDR_LEN..DMA_HDR_LEN]);
        pph.set_fwd_op(fwd_op::L2);
        pph.set_src_idx(self.src_idx);
        pph.set_slice_id(self.slice);
        pph.set_port_num(self.port);
        pph.set_cpu_reason(self.reason);
        pph.set_dst_idx(self.dst_idx);
        pph.set_tc(self.tc);
        pph.set_src_vlan(self.vlan);
        pph.set_igr_vid_pop_num(self.vlan_pop);
    }
}

/// `[device header][l2][trailer]`.
pub fn device_frame(hdr: &RxHeader, l2: &[u8]) -> Vec<u8> {
    let mut f = vec![0u8; DMA_HDR_LEN + l2.len() + FCS_LEN];
    hdr.write(&mut f);
    f[DMA_HDR_LEN..DMA_HDR_LEN + l2.len()].copy_from_slice(l2);
    f
}

/// Ethernet frame of `len` bytes with a counting payload.
pub fn eth_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, len: usize) -> Vec<u8> {
    let mut f = vec![0u8; len.max(14)];
    for (i, b) in f[14..].iter_mut().enumerate() {
        *b = i as u8;
    }
    let mut eth = EthernetFrame::new_unchecked(&mut f[..]);
    eth.set_dst_addr(EthernetAddress(dst));
    eth.set_src_addr(EthernetAddress(src));
    eth.set_ethertype(EthernetProtocol::from(ethertype));
    f
}

/// Insert an 802.1Q tag after the MAC addresses.
pub fn tagged(frame: &[u8], vid: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 4);
    out.extend_from_slice(&frame[..12]);
    out.extend_from_slice(&0x8100u16.to_be_bytes());
    out.extend_from_slice(&(vid & 0x0FFF).to_be_bytes());
    out.extend_from_slice(&frame[12..]);
    out
}

/// IFA-over-UDP frame whose first metadata entry points at `(slice, port)` with class `tc`.
pub fn ifa_udp_frame(ip_protocol: u8, slice: u16, port: u16, tc: u8) -> Vec<u8> {
    const IFA_HDR: usize = 4;
    const UDP_HDR: usize = 8;
    const MD_HDR: usize = 4;
    const MD: usize = 32;
    let udp_len = UDP_HDR + MD_HDR + MD + 16;
    let ip_len = 20 + IFA_HDR + udp_len;
    let mut f = vec![0u8; 14 + ip_len];
    {
        let mut eth = EthernetFrame::new_unchecked(&mut f[..]);
        eth.set_dst_addr(EthernetAddress(HOST_MAC));
        eth.set_src_addr(EthernetAddress(PEER_MAC));
        eth.set_ethertype(EthernetProtocol::Ipv4);
        let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
        ip.set_version(4);
        ip.set_header_len(20);
        ip.set_total_len(ip_len as u16);
        ip.set_hop_limit(64);
        ip.set_next_header(IpProtocol::from(ip_protocol));
        ip.set_src_addr(Ipv4Address::new(10, 1, 0, 1));
        ip.set_dst_addr(Ipv4Address::new(10, 1, 0, 2));
        ip.fill_checksum();
    }
    let ifa = 14 + 20;
    f[ifa] = 2 << 4;
    f[ifa + 1] = u8::from(IpProtocol::Udp);
    let udp = ifa + IFA_HDR;
    f[udp..udp + 2].copy_from_slice(&4789u16.to_be_bytes());
    f[udp + 2..udp + 4].copy_from_slice(&4790u16.to_be_bytes());
    f[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    let md = udp + UDP_HDR + MD_HDR;
    f[md + 4] = (tc >> 4) & 0x3;
    f[md + 5] = (tc & 0xF) << 4;
    f[md + 8..md + 10].copy_from_slice(&((slice << 6) | port).to_be_bytes());
    f
}

/// Split a transmitted device frame into its header and the Ethernet frame, trailer removed.
pub fn split_tx(frame: &[u8]) -> (Pph<&[u8]>, &[u8]) {
    let pph = Pph::new_unchecked(&frame[EMAC_HDR_LEN..DMA_HDR_LEN]);
    (pph, &frame[DMA_HDR_LEN..frame.len() - FCS_LEN])
}
