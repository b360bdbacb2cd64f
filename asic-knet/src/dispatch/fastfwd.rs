// In-band telemetry (IFA) fast-forward
//
// Frame layout handled here:
//   Ethernet | IPv4 (protocol = configured) | IFA header (4) | UDP or TCP (fixed 20) |
//   metadata header (4) | metadata stack
// The first metadata entry names the egress (slice, port) and carries the traffic class.
// The node id field is overwritten and the L4 checksum recomputed before the frame is sent
// out of the resolved interface.

use std::fmt;

use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket,
};
use tracing::{debug, trace};

use super::{DispatchRouter, l2_frame};
use crate::dma::ChannelCounters;
use crate::dma::channel::bump;
use crate::netif::PortMap;
use crate::rx::RxPacket;

const IFA_VERSION: u8 = 2;
const IFA_HDR_LEN: usize = 4;
const IFA_MD_HDR_LEN: usize = 4;
const UDP_HDR_LEN: usize = 8;
const TCP_HDR_LEN: usize = 20;
const IFA_MD_LEN: usize = 32;

/// Fast-forward settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IfaConfig {
    /// IPv4 protocol number announcing an IFA header.
    pub ip_protocol: u8,
    /// Written into every forwarded metadata entry.
    pub node_id: u32,
}

/// Where a rewritten frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaTarget {
    pub port_di: u32,
    pub tc: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaError {
    Truncated,
    NotIpv4,
    Protocol(u8),
    Version(u8),
    NextHeader(u8),
    Unresolved { slice: u8, port: u8 },
    /// The resolved port has no interface.
    NoInterface(u32),
}

impl fmt::Display for IfaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfaError::Truncated => write!(f, "truncated IFA frame"),
            IfaError::NotIpv4 => write!(f, "not an IPv4 frame"),
            IfaError::Protocol(p) => write!(f, "unexpected IP protocol {p}"),
            IfaError::Version(v) => write!(f, "unsupported IFA version {v}"),
            IfaError::NextHeader(h) => write!(f, "unsupported IFA next header {h}"),
            IfaError::Unresolved { slice, port } => {
                write!(f, "no logical port bound to slice {slice} port {port}")
            }
            IfaError::NoInterface(di) => write!(f, "no interface on port {di}"),
        }
    }
}

impl std::error::Error for IfaError {}

/// Rewrite the IFA frame in place and resolve its next hop.
pub fn rewrite_ifa(frame: &mut [u8], cfg: &IfaConfig, ports: &PortMap) -> Result<IfaTarget, IfaError> {
    let mut eth = EthernetFrame::new_checked(frame).map_err(|_| IfaError::Truncated)?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return Err(IfaError::NotIpv4);
    }
    let mut ip = Ipv4Packet::new_checked(eth.payload_mut()).map_err(|_| IfaError::Truncated)?;
    let proto = u8::from(ip.next_header());
    if proto != cfg.ip_protocol {
        return Err(IfaError::Protocol(proto));
    }
    let src = IpAddress::Ipv4(ip.src_addr());
    let dst = IpAddress::Ipv4(ip.dst_addr());

    let payload = ip.payload_mut();
    if payload.len() < IFA_HDR_LEN {
        return Err(IfaError::Truncated);
    }
    let version = payload[0] >> 4;
    if version != IFA_VERSION {
        return Err(IfaError::Version(version));
    }
    let next = IpProtocol::from(payload[1]);
    let l4 = &mut payload[IFA_HDR_LEN..];
    let l4_hdr = match next {
        IpProtocol::Udp => UDP_HDR_LEN,
        IpProtocol::Tcp => TCP_HDR_LEN,
        other => return Err(IfaError::NextHeader(u8::from(other))),
    };
    let md_off = l4_hdr + IFA_MD_HDR_LEN;
    if l4.len() < md_off + IFA_MD_LEN {
        return Err(IfaError::Truncated);
    }

    let md = &mut l4[md_off..md_off + IFA_MD_LEN];
    let combined = u16::from_be_bytes([md[8], md[9]]);
    let port = (combined & 0x3F) as u8;
    let slice = ((combined >> 6) & 0x7) as u8;
    let port_di = ports
        .lookup(slice as u32, port as u32)
        .ok_or(IfaError::Unresolved { slice, port })?;
    md[28..32].copy_from_slice(&cfg.node_id.to_be_bytes());
    let tc = ((md[4] & 0x3) << 4) | (md[5] >> 4);

    match next {
        IpProtocol::Udp => {
            let udp_len = u16::from_be_bytes([l4[4], l4[5]]) as usize;
            if udp_len < UDP_HDR_LEN || udp_len > l4.len() {
                return Err(IfaError::Truncated);
            }
            UdpPacket::new_unchecked(&mut l4[..udp_len]).fill_checksum(&src, &dst);
        }
        _ => {
            TcpPacket::new_unchecked(&mut l4[..]).fill_checksum(&src, &dst);
        }
    }
    Ok(IfaTarget { port_di, tc })
}

impl DispatchRouter {
    pub(super) fn fast_forward(&self, pkt: RxPacket, _chan: &ChannelCounters) {
        let Some(mut frame) = l2_frame(&pkt) else {
            bump(&self.counters.fast_forward_dropped);
            return;
        };
        drop(pkt);

        let cfg = self.ifa_config();
        let res = rewrite_ifa(&mut frame, &cfg, &self.netifs.port_map()).and_then(|t| {
            self.netifs
                .by_port(t.port_di)
                .map(|n| (t, n))
                .ok_or(IfaError::NoInterface(t.port_di))
        });
        let (target, netif) = match res {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "fast-forward drop");
                bump(&self.counters.fast_forward_dropped);
                return;
            }
        };
        match self.netif_transmit(&netif, &frame, Some(target.tc)) {
            Ok(()) => {
                trace!(port_di = target.port_di, tc = target.tc, "fast-forwarded");
                bump(&self.counters.fast_forward);
            }
            Err(_) => bump(&self.counters.fast_forward_dropped),
        }
    }
}
