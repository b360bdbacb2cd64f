//! Per-packet action execution.
//!
//! [`DispatchRouter::dispatch`] consumes a classified [`RxPacket`] and carries out the action
//! picked by the profile table. It runs in a deferred unit: it never blocks and never returns
//! an error. Every way a packet can disappear is counted.

mod fastfwd;
mod netdev;

use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::BytesMut;
use tracing::trace;

use crate::api::hw::ChannelId;
use crate::config::{DMA_HDR_LEN, ETH_HLEN, FCS_LEN};
use crate::dma::ChannelCounters;
use crate::dma::channel::{bump, counter_set};
use crate::netif::NetifTable;
use crate::netlink::{MessageKind, NetlinkRegistry, SampleDir, SampleInfo};
use crate::profile::{Action, NetlinkTarget};
use crate::rx::RxPacket;
use crate::sdk_queue::SdkRxQueue;
use crate::tx::TxPathBuilder;

pub use fastfwd::{IfaConfig, IfaError, IfaTarget, rewrite_ifa};
pub use netdev::apply_vlan;

counter_set!(
    /// Outcome of dispatched packets, by action.
    DispatchCounters, DispatchCountersSnapshot {
        netdev,
        netlink,
        sdk,
        fast_forward,
        /// Packets freed by a `Drop` rule.
        dropped,
        /// Fast-forward candidates that failed to parse or resolve.
        fast_forward_dropped,
    }
);

pub struct DispatchRouter {
    netifs: Arc<NetifTable>,
    netlinks: Arc<NetlinkRegistry>,
    sdk: Arc<SdkRxQueue>,
    tx: TxPathBuilder,
    netif_tx_channel: ChannelId,
    ifa: ArcSwap<IfaConfig>,
    counters: DispatchCounters,
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("netif_tx_channel", &self.netif_tx_channel)
            .field("ifa", &**self.ifa.load())
            .finish_non_exhaustive()
    }
}

impl DispatchRouter {
    pub fn new(
        netifs: Arc<NetifTable>,
        netlinks: Arc<NetlinkRegistry>,
        sdk: Arc<SdkRxQueue>,
        tx: TxPathBuilder,
        netif_tx_channel: ChannelId,
    ) -> Self {
        Self {
            netifs,
            netlinks,
            sdk,
            tx,
            netif_tx_channel,
            ifa: ArcSwap::from_pointee(IfaConfig::default()),
            counters: DispatchCounters::default(),
        }
    }

    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    pub fn ifa_config(&self) -> IfaConfig {
        **self.ifa.load()
    }

    pub fn set_ifa_config(&self, cfg: IfaConfig) {
        self.ifa.store(Arc::new(cfg));
    }

    #[inline]
    pub fn tx(&self) -> &TxPathBuilder {
        &self.tx
    }

    #[inline]
    pub fn netif_tx_channel(&self) -> ChannelId {
        self.netif_tx_channel
    }

    /// Execute `action` on `pkt`. `chan` is the receiving channel's counter block.
    pub fn dispatch(&self, action: &Action, pkt: RxPacket, chan: &ChannelCounters) {
        trace!(
            channel = pkt.channel(),
            port_di = pkt.meta.port_di,
            reason = pkt.meta.reason,
            len = pkt.len(),
            ?action,
            "dispatch"
        );
        match action {
            Action::NetDevice => self.to_netdev(pkt, chan),
            Action::Netlink(target) => self.to_netlink(target, pkt, chan),
            Action::SdkQueue => self.to_sdk(pkt, chan),
            Action::FastForward => self.fast_forward(pkt, chan),
            Action::Drop => {
                bump(&self.counters.dropped);
                drop(pkt);
            }
        }
    }

    fn to_sdk(&self, pkt: RxPacket, chan: &ChannelCounters) {
        match self.sdk.try_enqueue(pkt) {
            Ok(()) => bump(&self.counters.sdk),
            Err(pkt) => {
                trace!(channel = pkt.channel(), "sdk queue full, packet dropped");
                bump(&chan.dropped);
            }
        }
    }

    fn to_netlink(&self, target: &NetlinkTarget, pkt: RxPacket, chan: &ChannelCounters) {
        let Some(fam) = self.netlinks.resolve(&target.family, &target.group) else {
            bump(&self.netlinks.counters().no_target);
            trace!(family = %target.family, group = %target.group, "no netlink target");
            return;
        };
        let Some(frame) = l2_frame(&pkt) else {
            bump(&chan.dropped);
            return;
        };
        let meta = pkt.meta;
        drop(pkt);

        let kind = MessageKind::for_reason(meta.reason);
        let mut sample = SampleInfo::default();
        if let MessageKind::Sample(dir) = kind {
            let Some(igr) = self.netifs.by_port(meta.port_di) else {
                bump(&chan.netdev_miss);
                return;
            };
            let attrs = igr.attrs();
            let oif = self
                .netifs
                .by_port(meta.dst_idx as u32)
                .map_or(igr.ifindex(), |n| n.ifindex());
            sample = SampleInfo {
                iifindex: igr.ifindex() as u16,
                oifindex: oif as u16,
                rate: if dir == SampleDir::Ingress {
                    attrs.igr_sample_rate
                } else {
                    attrs.egr_sample_rate
                },
            };
        }

        let msg = self.netlinks.encode(&fam, kind, sample, meta.port_di, &frame);
        self.netlinks.broadcast(&fam, &target.group, msg);
        bump(&self.counters.netlink);
    }
}

/// The Ethernet frame of `pkt`: device header and trailer removed, fragments merged.
fn l2_frame(pkt: &RxPacket) -> Option<BytesMut> {
    let len = pkt.len().checked_sub(DMA_HDR_LEN + FCS_LEN)?;
    if len < ETH_HLEN {
        return None;
    }
    // Spare room for a pushed VLAN tag.
    let mut out = BytesMut::with_capacity(len + 4);
    pkt.copy_range_into(DMA_HDR_LEN, len, &mut out);
    Some(out)
}
