// Transmit path
//
// Frame layout handed to the device:
//   [EMAC 12][PPH 40][frame, zero-padded to 60][trailer 4]
// The trailer is zero-filled; the ASIC recomputes it on egress.

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use tracing::trace;

use crate::api::hw::{ChannelId, Direction, Pph};
use crate::api::Errno;
use crate::config::{ChipGeometry, DMA_HDR_LEN, EMAC_HDR_LEN, ETH_ZLEN, FCS_LEN};
use crate::dma::channel::add;
use crate::dma::{AllocError, BufferPool, ChannelArena, ChannelState, DmaBuffer, DmaError};

/// Completed descriptors taken per lock hold.
const RECLAIM_BATCH: usize = 32;

/// Transmit rejected. The frame has been freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// No free descriptor.
    Busy,
    TooLong { len: usize, max: usize },
    NoMemory(AllocError),
    Map(DmaError),
    InvalidChannel(ChannelId),
    /// Channel faulted or torn down.
    Down,
}

impl TxError {
    pub fn errno(&self) -> Errno {
        match self {
            TxError::Busy => Errno::EBUSY,
            TxError::TooLong { .. } => Errno::EMSGSIZE,
            TxError::NoMemory(_) => Errno::ENOMEM,
            TxError::Map(_) => Errno::EFAULT,
            TxError::InvalidChannel(_) => Errno::EINVAL,
            TxError::Down => Errno::ENETDOWN,
        }
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Busy => write!(f, "transmit ring full"),
            TxError::TooLong { len, max } => write!(f, "frame of {len} bytes exceeds {max}"),
            TxError::NoMemory(e) => write!(f, "{e}"),
            TxError::Map(e) => write!(f, "{e}"),
            TxError::InvalidChannel(ch) => write!(f, "channel {ch} is not a transmit channel"),
            TxError::Down => write!(f, "channel down"),
        }
    }
}

impl std::error::Error for TxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxError::NoMemory(e) => Some(e),
            TxError::Map(e) => Some(e),
            _ => None,
        }
    }
}

/// Builds device frames and pushes them onto TX rings.
#[derive(Debug, Clone)]
pub struct TxPathBuilder {
    arena: Arc<ChannelArena>,
    pool: BufferPool,
    cpu_port: u16,
    max_pkt_len: usize,
}

impl TxPathBuilder {
    pub fn new(arena: Arc<ChannelArena>, pool: BufferPool, geometry: &ChipGeometry) -> Self {
        Self {
            arena,
            pool,
            cpu_port: geometry.cpu_port as u16,
            max_pkt_len: geometry.max_pkt_len,
        }
    }

    /// Largest Ethernet frame (without trailer) accepted by [`transmit`](Self::transmit).
    #[inline]
    pub fn max_frame_len(&self) -> usize {
        self.max_pkt_len - DMA_HDR_LEN - FCS_LEN
    }

    /// Wrap `frame` in a device header addressed to `port_di` and queue it on `channel`.
    pub fn transmit(&self, channel: ChannelId, port_di: u32, tc: u8, frame: &[u8]) -> Result<(), TxError> {
        let buf = self.build(port_di, tc, frame)?;
        self.transmit_raw(channel, buf)
    }

    /// Build the device frame for `frame` without queueing it.
    pub fn build(&self, port_di: u32, tc: u8, frame: &[u8]) -> Result<DmaBuffer, TxError> {
        let max = self.max_frame_len();
        if frame.len() > max {
            return Err(TxError::TooLong {
                len: frame.len(),
                max,
            });
        }
        let padded = frame.len().max(ETH_ZLEN);
        let mut buf = self
            .pool
            .alloc_with_headroom(DMA_HDR_LEN, padded + FCS_LEN)
            .map_err(TxError::NoMemory)?;
        buf.extend_from_slice(frame);
        if let Some(pad) = buf.append(padded - frame.len()) {
            pad.fill(0);
        }
        if let Some(trailer) = buf.append(FCS_LEN) {
            trailer.fill(0);
        }
        if let Some(hdr) = buf.prepend(DMA_HDR_LEN) {
            hdr.fill(0);
            let mut pph = Pph::new_unchecked(&mut hdr[EMAC_HDR_LEN..]);
            pph.set_skip_ipp(1);
            pph.set_skip_epp(1);
            pph.set_color(0);
            pph.set_tc(tc & 7);
            pph.set_src_idx(self.cpu_port);
            pph.set_dst_idx(port_di as u16);
        }
        Ok(buf)
    }

    /// Copy `frags` into one buffer and queue it unchanged. The caller supplies the header.
    pub fn transmit_frags(&self, channel: ChannelId, frags: &[&[u8]]) -> Result<(), TxError> {
        let len: usize = frags.iter().map(|f| f.len()).sum();
        if len > self.max_pkt_len {
            return Err(TxError::TooLong {
                len,
                max: self.max_pkt_len,
            });
        }
        let mut buf = self.pool.alloc(len.max(1)).map_err(TxError::NoMemory)?;
        for f in frags {
            buf.extend_from_slice(f);
        }
        self.transmit_raw(channel, buf)
    }

    /// Map `buf` and push it on `channel`.
    pub fn transmit_raw(&self, channel: ChannelId, mut buf: DmaBuffer) -> Result<(), TxError> {
        let ch = self.arena.tx(channel).ok_or(TxError::InvalidChannel(channel))?;
        self.pool
            .map_for_device(&mut buf, Direction::ToDevice)
            .map_err(TxError::Map)?;
        let len = buf.len();

        let mut guard = ch.lock();
        let ring = guard.as_mut().ok_or(TxError::Down)?;
        if ring.state() == ChannelState::Faulted {
            return Err(TxError::Down);
        }
        ring.push_tx(buf).map_err(|_| TxError::Busy)?;
        trace!(channel, len, work_idx = ring.work_idx(), "tx queued");
        Ok(())
    }

    /// Release completed TX buffers of `channel`. Returns `(packets, bytes)`.
    pub fn reclaim(&self, channel: ChannelId) -> (u64, u64) {
        let Some(ch) = self.arena.tx(channel) else {
            return (0, 0);
        };
        let mut packets = 0;
        let mut bytes = 0;
        loop {
            let mut batch = ArrayVec::<_, RECLAIM_BATCH>::new();
            let n = {
                let mut guard = ch.lock();
                let Some(ring) = guard.as_mut() else {
                    break;
                };
                let n = ring.reclaim_pop(&mut batch);
                if batch.iter().any(|(desc, _)| desc.err()) {
                    ring.set_faulted();
                }
                n
            };
            // Buffers are freed outside the channel lock.
            for (_, mut buf) in batch {
                self.pool.unmap(&mut buf);
                packets += 1;
                bytes += buf.len() as u64;
            }
            if n < RECLAIM_BATCH {
                break;
            }
        }
        let c = ch.counters();
        add(&c.packets, packets);
        add(&c.bytes, bytes);
        (packets, bytes)
    }
}
