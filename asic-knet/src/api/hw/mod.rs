// Device family API
// Register access is behind DeviceFamily so the pipeline never touches BAR offsets directly.

pub mod desc;
pub mod pph;

use std::ptr::NonNull;

use crate::config::ChipGeometry;
use crate::dma::DmaError;

pub use desc::{DescRing, DescView, Descriptor};
pub use pph::Pph;

/// Channel number as seen by the interrupt controller.
pub type ChannelId = u32;

/// Bus address handed to the DMA engine.
pub type DeviceAddr = u64;

/// Direction of a DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device writes into host memory (RX).
    FromDevice,
    /// Device reads host memory (TX).
    ToDevice,
    Bidirectional,
}

/// Class of an interrupt channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Rx,
    Tx,
    /// Non-DMA interrupt sources (link, counters, ...).
    General,
}

impl ChannelKind {
    /// Classify `ch` under `geometry`. Returns `None` when out of range.
    pub fn of(geometry: &ChipGeometry, ch: ChannelId) -> Option<Self> {
        if ch < geometry.rx_channels {
            Some(ChannelKind::Rx)
        } else if ch < geometry.dma_channels() {
            Some(ChannelKind::Tx)
        } else if ch < geometry.total_channels {
            Some(ChannelKind::General)
        } else {
            None
        }
    }
}

/// Translates host memory into addresses the device can use.
pub trait DmaMapper: Send + Sync {
    /// Map `len` bytes at `cpu` for `dir`.
    fn map(&self, cpu: NonNull<u8>, len: usize, dir: Direction) -> Result<DeviceAddr, DmaError>;

    fn unmap(&self, addr: DeviceAddr, len: usize, dir: Direction);
}

/// Mapper for systems without an IOMMU: the bus address is the host address.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMapper {
    dma_bits: u32,
}

impl IdentityMapper {
    pub fn new(dma_bits: u32) -> Self {
        Self { dma_bits }
    }
}

impl DmaMapper for IdentityMapper {
    fn map(&self, cpu: NonNull<u8>, len: usize, _dir: Direction) -> Result<DeviceAddr, DmaError> {
        let addr = cpu.as_ptr() as usize as u64;
        let end = addr.checked_add(len as u64).ok_or(DmaError::AddressOverflow {
            addr,
            bits: self.dma_bits,
        })?;
        if self.dma_bits < 64 && end > (1u64 << self.dma_bits) {
            return Err(DmaError::AddressOverflow {
                addr,
                bits: self.dma_bits,
            });
        }
        Ok(addr)
    }

    fn unmap(&self, _addr: DeviceAddr, _len: usize, _dir: Direction) {}
}

/// Register-level operations of one ASIC family.
///
/// Selected once when the [`Knet`](crate::Knet) instance is built. All methods are
/// non-blocking register accesses and may be called from the interrupt path.
pub trait DeviceFamily: Send + Sync + 'static {
    /// Constants of this family. Used to seed [`DriverConfig`](crate::DriverConfig).
    fn geometry(&self) -> ChipGeometry;

    fn mapper(&self) -> &dyn DmaMapper;

    /// Return the channel's DMA engine to its power-on state.
    fn reset_channel(&self, ch: ChannelId);

    /// Program descriptor ring base and length.
    fn set_ring(&self, ch: ChannelId, base: DeviceAddr, len: u32);

    fn enable_channel(&self, ch: ChannelId);
    fn disable_channel(&self, ch: ChannelId);

    /// Publish the software work cursor.
    fn set_work_idx(&self, ch: ChannelId, idx: u32);

    /// Completion cursor as last reported by the device.
    fn hw_pop_idx(&self, ch: ChannelId) -> u32;

    /// Global interrupt gate.
    fn mask_all(&self);
    fn unmask_all(&self);

    /// Bitmap of channels with a completion interrupt pending.
    fn pending_channels(&self) -> u64;

    /// Bitmap of channels with an error interrupt pending.
    fn pending_error_channels(&self) -> u64;

    fn mask_channel_irq(&self, ch: ChannelId);
    fn unmask_channel_irq(&self, ch: ChannelId);
    fn clear_channel_irq(&self, ch: ChannelId);

    fn mask_error_irq(&self, ch: ChannelId);
    fn unmask_error_irq(&self, ch: ChannelId);
    fn clear_error_irq(&self, ch: ChannelId);
}
