// Per-packet metadata from the device header

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::assembler::RxPacket;
use crate::api::hw::Pph;
use crate::api::hw::pph::fwd_op;
use crate::config::{ChipGeometry, DMA_HDR_LEN, EMAC_HDR_LEN, REASON_MAX};
use crate::netif::PortMap;

/// Destination MAC the ASIC stamps on mirror-on-drop (MOD) copies.
pub const MOD_DEFAULT_DMAC: [u8; 6] = [0x70, 0x06, 0x92, 0x6D, 0x00, 0x01];

/// Well-known reason codes.
pub mod reason {
    pub const INGRESS_SAMPLE: u16 = 352;
    pub const EGRESS_SAMPLE: u16 = 480;
    /// Mirror-on-drop copy.
    pub const MOD: u16 = 511;
}

/// Metadata extracted once a packet is complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxMeta {
    /// Logical ingress port.
    pub port_di: u32,
    /// Destination index reported by the device (egress port for egress samples).
    pub dst_idx: u16,
    pub reason: u16,
    pub vlan: u16,
    /// Tags to pop before delivery.
    pub vlan_pop: u8,
    pub fwd_op: u8,
    pub tc: u8,
    /// The packet is a MOD copy.
    pub is_mod: bool,
}

/// Packet dropped while extracting metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaError {
    /// First fragment shorter than the device header.
    Truncated { len: usize },
    /// No logical port is bound to (slice, port).
    UnresolvedPort { slice: u8, port: u8 },
}

/// Packet and byte counters per reason code.
pub struct ReasonCounters {
    packets: Box<[AtomicU64]>,
    bytes: Box<[AtomicU64]>,
}

impl std::fmt::Debug for ReasonCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasonCounters").finish_non_exhaustive()
    }
}

impl Default for ReasonCounters {
    fn default() -> Self {
        Self {
            packets: (0..REASON_MAX).map(|_| AtomicU64::new(0)).collect(),
            bytes: (0..REASON_MAX).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl ReasonCounters {
    pub fn record(&self, reason: u16, bytes: usize) {
        let i = reason as usize;
        if i < REASON_MAX {
            self.packets[i].fetch_add(1, Ordering::Relaxed);
            self.bytes[i].fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    /// `(packets, bytes)` of `reason`.
    pub fn get(&self, reason: u16) -> Option<(u64, u64)> {
        let i = reason as usize;
        (i < REASON_MAX).then(|| {
            (
                self.packets[i].load(Ordering::Relaxed),
                self.bytes[i].load(Ordering::Relaxed),
            )
        })
    }

    /// Reasons with a non-zero packet count.
    pub fn nonzero(&self) -> Vec<(u16, u64, u64)> {
        (0..REASON_MAX as u16)
            .filter_map(|r| self.get(r).filter(|(p, _)| *p > 0).map(|(p, b)| (r, p, b)))
            .collect()
    }

    pub fn clear(&self) {
        for c in self.packets.iter().chain(self.bytes.iter()) {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Inputs of metadata extraction that live outside the packet.
pub struct MetaContext<'a> {
    pub geometry: &'a ChipGeometry,
    pub port_map: &'a PortMap,
    /// Replacement destination MAC for MOD copies, if configured.
    pub mod_dmac: Option<[u8; 6]>,
    pub counters: &'a ReasonCounters,
}

/// Fill `pkt.meta` from the device header in the first fragment.
pub fn extract(pkt: &mut RxPacket, ctx: &MetaContext<'_>) -> Result<(), MetaError> {
    let total = pkt.len();
    let Some(first) = pkt.frags_mut().first_mut() else {
        return Err(MetaError::Truncated { len: 0 });
    };
    let data = first.data_mut();
    if data.len() < DMA_HDR_LEN {
        return Err(MetaError::Truncated { len: data.len() });
    }

    let mut is_mod = false;
    if data.len() >= DMA_HDR_LEN + 6 && data[DMA_HDR_LEN..DMA_HDR_LEN + 6] == MOD_DEFAULT_DMAC {
        is_mod = true;
        if let Some(mac) = ctx.mod_dmac {
            data[DMA_HDR_LEN..DMA_HDR_LEN + 6].copy_from_slice(&mac);
        }
    }

    let pph = Pph::new_unchecked(&data[EMAC_HDR_LEN..DMA_HDR_LEN]);
    let mut meta = RxMeta {
        dst_idx: pph.dst_idx(),
        reason: if is_mod { reason::MOD } else { pph.cpu_reason() },
        fwd_op: pph.fwd_op(),
        tc: pph.tc(),
        is_mod,
        ..RxMeta::default()
    };
    if meta.fwd_op == fwd_op::L2 {
        meta.vlan = pph.src_vlan();
        meta.vlan_pop = pph.igr_vid_pop_num();
    } else {
        meta.vlan = pph.src_bdi();
        meta.vlan_pop = 1;
    }

    let src_idx = pph.src_idx() as u32;
    meta.port_di = if src_idx < ctx.geometry.port_di_max {
        src_idx
    } else {
        let (slice, port) = (pph.slice_id(), pph.port_num());
        match ctx.port_map.lookup(slice as u32, port as u32) {
            Some(di) => di,
            None => {
                trace!(slice, port, src_idx, "no logical port for ingress");
                return Err(MetaError::UnresolvedPort { slice, port });
            }
        }
    };

    ctx.counters.record(meta.reason, total.saturating_sub(DMA_HDR_LEN));
    pkt.meta = meta;
    Ok(())
}
