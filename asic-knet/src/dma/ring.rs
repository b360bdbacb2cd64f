// Descriptor ring of one DMA channel
//
// Slots [pop_idx, work_idx) belong to the device. `in_flight` counts them, so an empty
// ring and a full ring never have to be told apart by cursor equality. At most N-1 slots
// are ever handed over.

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use tracing::{debug, error};

use super::buffer::{AllocError, DmaBuffer};
use crate::api::hw::{ChannelId, DescRing, DescView, Descriptor, DeviceAddr, DeviceFamily, Direction};
use crate::api::Error;

/// Life-cycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Device stopped. Ring-resident buffers are kept.
    Disabled,
    /// Device may produce or consume descriptors.
    Armed,
    /// A consumed RX slot could not be restocked; the recovery task owns the interrupt.
    RecoveryPending,
    /// The device reported an error. Stays masked until an administrative reset.
    Faulted,
}

/// No free slot is left for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl fmt::Display for RingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("descriptor ring full")
    }
}

impl std::error::Error for RingFull {}

pub struct RingChannel {
    id: ChannelId,
    dev: Arc<dyn DeviceFamily>,
    ring: DescRing,
    ring_addr: DeviceAddr,
    slots: Box<[Option<DmaBuffer>]>,
    work_idx: u32,
    pop_idx: u32,
    in_flight: u32,
    enabled: bool,
    faulted: bool,
    pending_slot: Option<u32>,
}

impl fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingChannel")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("work_idx", &self.work_idx)
            .field("pop_idx", &self.pop_idx)
            .field("in_flight", &self.in_flight)
            .field("state", &self.state())
            .finish()
    }
}

impl RingChannel {
    /// Allocate and map an `n`-descriptor ring and program it into channel `id`.
    pub fn new(dev: Arc<dyn DeviceFamily>, id: ChannelId, n: u32) -> Result<Self, Error> {
        if n < 2 {
            return Err(Error::InvalidArgument("ring size below 2"));
        }
        let ring = DescRing::new(n as usize).ok_or(Error::Alloc(AllocError::OutOfMemory {
            size: n as usize * crate::api::hw::desc::DESC_SIZE,
        }))?;
        let ring_addr = dev
            .mapper()
            .map(ring.as_non_null(), ring.byte_len(), Direction::Bidirectional)?;
        dev.reset_channel(id);
        dev.set_ring(id, ring_addr, n);

        let slots = (0..n).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        debug!(channel = id, size = n, ring_addr = format_args!("{ring_addr:#x}"), "ring created");
        Ok(Self {
            id,
            dev,
            ring,
            ring_addr,
            slots,
            work_idx: 0,
            pop_idx: 0,
            in_flight: 0,
            enabled: false,
            faulted: false,
            pending_slot: None,
        })
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn work_idx(&self) -> u32 {
        self.work_idx
    }

    #[inline]
    pub fn pop_idx(&self) -> u32 {
        self.pop_idx
    }

    /// Slots currently owned by the device.
    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Slots that can still be handed to the device.
    #[inline]
    pub fn free_slots(&self) -> u32 {
        self.capacity() - 1 - self.in_flight
    }

    /// Slots holding a buffer, whether device-owned or not.
    pub fn stocked(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[inline]
    pub fn pending_slot(&self) -> Option<u32> {
        self.pending_slot
    }

    #[inline]
    pub fn ring_addr(&self) -> DeviceAddr {
        self.ring_addr
    }

    #[inline]
    pub fn desc_view(&self) -> DescView<'_> {
        self.ring.view()
    }

    pub fn state(&self) -> ChannelState {
        if self.faulted {
            ChannelState::Faulted
        } else if self.pending_slot.is_some() {
            ChannelState::RecoveryPending
        } else if self.enabled {
            ChannelState::Armed
        } else {
            ChannelState::Disabled
        }
    }

    /// Start the DMA engine. No-op when already running.
    pub fn arm(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::NotReady);
        }
        if self.enabled {
            return Ok(());
        }
        self.dev.set_work_idx(self.id, self.work_idx);
        self.dev.enable_channel(self.id);
        self.enabled = true;
        debug!(channel = self.id, work_idx = self.work_idx, "channel armed");
        Ok(())
    }

    /// Stop the DMA engine. Ring-resident buffers stay in their slots.
    pub fn disarm(&mut self) {
        if self.enabled {
            self.dev.disable_channel(self.id);
            self.enabled = false;
            debug!(channel = self.id, "channel disarmed");
        }
    }

    /// Hand `n` more stocked slots to the device and publish the new work cursor.
    pub fn advance_work(&mut self, n: u32) -> Result<(), RingFull> {
        if n > self.free_slots() {
            return Err(RingFull);
        }
        let cap = self.capacity();
        for i in 0..n {
            debug_assert!(self.slots[((self.work_idx + i) % cap) as usize].is_some());
        }
        self.work_idx = (self.work_idx + n) % cap;
        self.in_flight += n;
        self.dev.set_work_idx(self.id, self.work_idx);
        Ok(())
    }

    /// Put a mapped receive buffer into `slot` without handing it over.
    ///
    /// Gives the buffer back if the slot is occupied or the buffer is unmapped.
    pub fn stock_rx(&mut self, slot: u32, buf: DmaBuffer) -> Result<(), DmaBuffer> {
        let Some(addr) = buf.device_addr() else {
            return Err(buf);
        };
        let Some(entry) = self.slots.get_mut(slot as usize) else {
            return Err(buf);
        };
        if entry.is_some() {
            return Err(buf);
        }
        let size = (buf.capacity() - buf.headroom()).min(u16::MAX as usize) as u16;
        self.ring.view().write(slot as usize, &Descriptor::rx(addr, size));
        *entry = Some(buf);
        Ok(())
    }

    /// Restock a consumed RX slot and hand the reserve slot to the device.
    pub fn refill(&mut self, slot: u32, buf: DmaBuffer) -> Result<(), DmaBuffer> {
        self.stock_rx(slot, buf)?;
        if self.advance_work(1).is_err() {
            return self.slots[slot as usize].take().map_or(Ok(()), Err);
        }
        Ok(())
    }

    /// Queue a mapped frame for transmission.
    pub fn push_tx(&mut self, buf: DmaBuffer) -> Result<(), (DmaBuffer, RingFull)> {
        if self.free_slots() == 0 {
            return Err((buf, RingFull));
        }
        let Some(addr) = buf.device_addr() else {
            return Err((buf, RingFull));
        };
        let slot = self.work_idx as usize;
        if self.slots[slot].is_some() {
            return Err((buf, RingFull));
        }
        let len = buf.len().min(u16::MAX as usize) as u16;
        self.ring.view().write(slot, &Descriptor::tx(addr, len));
        self.slots[slot] = Some(buf);
        if let Err(e) = self.advance_work(1) {
            if let Some(buf) = self.slots[slot].take() {
                return Err((buf, e));
            }
        }
        Ok(())
    }

    /// Take the next completed slot, if the device is done with it.
    pub fn pop_completed(&mut self) -> Option<(Descriptor, DmaBuffer)> {
        if self.in_flight == 0 {
            return None;
        }
        let idx = self.pop_idx as usize;
        let view = self.ring.view();
        let desc = view.read(idx);
        if !desc.interrupt() {
            return None;
        }
        let Some(buf) = self.slots[idx].take() else {
            error!(channel = self.id, slot = idx, "completed descriptor without buffer");
            self.faulted = true;
            return None;
        };
        view.write(idx, &Descriptor::default());
        self.pop_idx = (self.pop_idx + 1) % self.capacity();
        self.in_flight -= 1;
        Some((desc, buf))
    }

    /// Reclaim completed slots in ring order into `out`. Returns how many were taken.
    pub fn reclaim_pop<const N: usize>(
        &mut self,
        out: &mut ArrayVec<(Descriptor, DmaBuffer), N>,
    ) -> usize {
        let mut n = 0;
        while !out.is_full() {
            match self.pop_completed() {
                Some(entry) => {
                    out.push(entry);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Record that `slot` was consumed but could not be restocked.
    pub fn set_recovery_pending(&mut self, slot: u32) {
        self.pending_slot = Some(slot);
    }

    /// Restock the slot recorded by [`set_recovery_pending`](Self::set_recovery_pending).
    ///
    /// Returns the slot on success; the buffer comes back when nothing is pending.
    pub fn complete_recovery(&mut self, buf: DmaBuffer) -> Result<u32, DmaBuffer> {
        let Some(slot) = self.pending_slot else {
            return Err(buf);
        };
        self.refill(slot, buf)?;
        self.pending_slot = None;
        Ok(slot)
    }

    pub fn set_faulted(&mut self) {
        if !self.faulted {
            error!(
                channel = self.id,
                work_idx = self.work_idx,
                pop_idx = self.pop_idx,
                hw_pop_idx = self.dev.hw_pop_idx(self.id),
                "channel faulted"
            );
        }
        self.faulted = true;
    }

    /// Stop the channel and free every ring-resident buffer exactly once.
    ///
    /// Leaves an empty, disabled ring programmed at the same base. Returns the number of
    /// buffers freed.
    pub fn release_all(&mut self) -> usize {
        self.disarm();
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                freed += 1;
            }
        }
        self.ring.clear();
        self.work_idx = 0;
        self.pop_idx = 0;
        self.in_flight = 0;
        self.pending_slot = None;
        self.faulted = false;
        self.dev.reset_channel(self.id);
        self.dev.set_ring(self.id, self.ring_addr, self.capacity());
        debug!(channel = self.id, freed, "ring released");
        freed
    }
}

impl Drop for RingChannel {
    fn drop(&mut self) {
        self.disarm();
        self.dev
            .mapper()
            .unmap(self.ring_addr, self.ring.byte_len(), Direction::Bidirectional);
    }
}
