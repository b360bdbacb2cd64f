// Delivery to the host network stack, and transmit on behalf of an interface

use bytes::{BufMut, BytesMut};
use tracing::trace;

use super::{DispatchRouter, l2_frame};
use crate::dma::ChannelCounters;
use crate::dma::channel::{add, bump};
use crate::netif::{MacAddress, Netif, VlanPolicy};
use crate::rx::{RxMeta, RxPacket};
use crate::tx::TxError;

const ETH_P_8021Q: u16 = 0x8100;
const ETH_P_8021AD: u16 = 0x88A8;

/// Spanning-tree BPDUs always reach the stack tagged.
const STP_DMAC: MacAddress = [0x01, 0x80, 0xC2, 0x00, 0x00, 0x00];
const PVST_DMAC: MacAddress = [0x01, 0x00, 0x0C, 0xCC, 0xCC, 0xCD];

impl DispatchRouter {
    pub(super) fn to_netdev(&self, pkt: RxPacket, chan: &ChannelCounters) {
        let meta = pkt.meta;
        let Some(netif) = self.netifs.by_port(meta.port_di) else {
            bump(&chan.netdev_miss);
            trace!(channel = pkt.channel(), port_di = meta.port_di, "no interface for port");
            return;
        };
        let Some(mut frame) = l2_frame(&pkt) else {
            bump(&netif.stats().rx_errors);
            return;
        };
        drop(pkt);

        let len = frame.len();
        let stats = netif.stats();
        bump(&stats.rx_packets);
        add(&stats.rx_bytes, len as u64);
        netif.reasons().record(meta.reason, len);

        apply_vlan(&mut frame, netif.attrs().vlan_policy, &meta);
        self.netifs.stack().receive(netif.ifindex(), frame.freeze());
        bump(&self.counters.netdev);
    }

    /// Send `frame` out of the port bound to `netif`.
    ///
    /// `tc` overrides the interface's configured traffic class.
    pub fn netif_transmit(&self, netif: &Netif, frame: &[u8], tc: Option<u8>) -> Result<(), TxError> {
        let tc = tc.unwrap_or_else(|| netif.attrs().tc);
        let stats = netif.stats();
        match self
            .tx
            .transmit(self.netif_tx_channel, netif.port_di(), tc, frame)
        {
            Ok(()) => {
                bump(&stats.tx_packets);
                add(&stats.tx_bytes, frame.len() as u64);
                Ok(())
            }
            Err(e) => {
                if e == TxError::Busy {
                    bump(&stats.tx_fifo_errors);
                } else {
                    bump(&stats.tx_errors);
                }
                bump(&stats.tx_dropped);
                trace!(netif = netif.name(), error = %e, "netif transmit failed");
                Err(e)
            }
        }
    }
}

fn is_tagged(frame: &[u8]) -> bool {
    frame.len() >= 18 && matches!(u16::from_be_bytes([frame[12], frame[13]]), ETH_P_8021Q | ETH_P_8021AD)
}

fn push_tag(frame: &mut BytesMut, vlan: u16) {
    let mut out = BytesMut::with_capacity(frame.len() + 4);
    out.put_slice(&frame[..12]);
    out.put_u16(ETH_P_8021Q);
    out.put_u16(vlan & 0x0FFF);
    out.put_slice(&frame[12..]);
    *frame = out;
}

fn pop_tag(frame: &mut BytesMut) -> bool {
    if !is_tagged(frame) {
        return false;
    }
    let mut out = BytesMut::with_capacity(frame.len() - 4);
    out.put_slice(&frame[..12]);
    out.put_slice(&frame[16..]);
    *frame = out;
    true
}

/// Rewrite the VLAN tags of a received frame for delivery.
///
/// BPDUs are tagged if they arrived untagged. Otherwise `Strip` pops the number of tags the
/// device reported, `Keep` tags untagged frames, and `Original` leaves the frame alone.
pub fn apply_vlan(frame: &mut BytesMut, policy: VlanPolicy, meta: &RxMeta) {
    if frame.len() < 14 {
        return;
    }
    let dst = &frame[..6];
    if dst == STP_DMAC || dst == PVST_DMAC {
        if !is_tagged(frame) {
            push_tag(frame, meta.vlan);
        }
        return;
    }
    if is_tagged(frame) {
        if policy == VlanPolicy::Strip {
            for _ in 0..meta.vlan_pop {
                if !pop_tag(frame) {
                    break;
                }
            }
        }
    } else if policy == VlanPolicy::Keep {
        push_tag(frame, meta.vlan);
    }
}
