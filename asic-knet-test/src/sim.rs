//! Register-level model of the switch ASIC.
//!
//! `SimAsic` implements [`DeviceFamily`] on top of host memory: the descriptor rings the driver
//! programs are real, so injected frames travel through the same descriptors, cursors and
//! interrupt bits as on hardware. Buffers are only touched while their channel is enabled.

use std::sync::{Mutex, MutexGuard, PoisonError};

use asic_knet::ChipGeometry;
use asic_knet::api::hw::{ChannelId, DescView, DeviceAddr, DeviceFamily, DmaMapper, IdentityMapper};
use tracing::trace;

/// Why an injection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// The channel's DMA engine is off.
    Disabled(ChannelId),
    /// Not enough device-owned descriptors for the frame.
    NoDescriptor { channel: ChannelId, needed: usize, available: usize },
    /// A fragment does not fit the posted buffer.
    FragmentTooLarge { len: usize, size: usize },
}

#[derive(Debug, Clone, Copy, Default)]
struct ChanRegs {
    base: DeviceAddr,
    len: u32,
    work: u32,
    pop: u32,
    enabled: bool,
}

impl ChanRegs {
    /// Descriptors handed over by the driver and not yet completed.
    fn owned(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        ((self.work + self.len - self.pop) % self.len) as usize
    }

    /// # Safety
    /// The ring programmed at `base` must still be alive.
    unsafe fn view<'a>(&self) -> DescView<'a> {
        unsafe { DescView::from_raw(self.base as usize as *const u8, self.len as usize) }
    }
}

#[derive(Debug)]
struct Regs {
    chans: Vec<ChanRegs>,
    gate_masked: bool,
    irq_mask: u64,
    err_mask: u64,
    pending: u64,
    errors: u64,
    tx_out: Vec<(ChannelId, Vec<u8>)>,
}

/// Simulated device.
#[derive(Debug)]
pub struct SimAsic {
    geometry: ChipGeometry,
    mapper: IdentityMapper,
    regs: Mutex<Regs>,
}

impl SimAsic {
    pub fn new(geometry: ChipGeometry) -> Self {
        let chans = vec![ChanRegs::default(); geometry.total_channels as usize];
        Self {
            mapper: IdentityMapper::new(64),
            geometry,
            regs: Mutex::new(Regs {
                chans,
                gate_masked: true,
                irq_mask: u64::MAX,
                err_mask: u64::MAX,
                pending: 0,
                errors: 0,
                tx_out: Vec::new(),
            }),
        }
    }

    fn regs(&self) -> MutexGuard<'_, Regs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive `frame` on `ch`, spreading it over as many posted buffers as needed.
    ///
    /// Returns the number of descriptors consumed.
    pub fn inject_rx(&self, ch: ChannelId, frame: &[u8]) -> Result<usize, SimError> {
        let mut regs = self.regs();
        let c = regs.chans[ch as usize];
        if !c.enabled {
            return Err(SimError::Disabled(ch));
        }
        // SAFETY: an enabled channel has a live ring.
        let view = unsafe { c.view() };

        // Plan the split first so a frame is never half-written.
        let mut plan = Vec::new();
        let mut off = 0;
        let mut slot = c.pop;
        while off < frame.len() || plan.is_empty() {
            if plan.len() == c.owned() {
                return Err(SimError::NoDescriptor {
                    channel: ch,
                    needed: plan.len() + 1,
                    available: c.owned(),
                });
            }
            let size = view.read(slot as usize).size() as usize;
            let n = size.min(frame.len() - off);
            plan.push((slot, off, n));
            off += n;
            slot = (slot + 1) % c.len;
        }

        let last = plan.len() - 1;
        for (i, &(slot, off, n)) in plan.iter().enumerate() {
            write_fragment(&view, slot, &frame[off..off + n], i == 0, i == last, false);
        }
        let chan = &mut regs.chans[ch as usize];
        chan.pop = slot;
        regs.pending |= 1 << ch;
        trace!(channel = ch, len = frame.len(), descs = plan.len(), "sim rx");
        Ok(plan.len())
    }

    /// Complete one descriptor on `ch` with explicit framing bits.
    pub fn inject_rx_fragment(
        &self,
        ch: ChannelId,
        data: &[u8],
        sop: bool,
        eop: bool,
        err: bool,
    ) -> Result<(), SimError> {
        let mut regs = self.regs();
        let c = regs.chans[ch as usize];
        if !c.enabled {
            return Err(SimError::Disabled(ch));
        }
        if c.owned() == 0 {
            return Err(SimError::NoDescriptor {
                channel: ch,
                needed: 1,
                available: 0,
            });
        }
        // SAFETY: an enabled channel has a live ring.
        let view = unsafe { c.view() };
        let size = view.read(c.pop as usize).size() as usize;
        if data.len() > size {
            return Err(SimError::FragmentTooLarge {
                len: data.len(),
                size,
            });
        }
        write_fragment(&view, c.pop, data, sop, eop, err);
        regs.chans[ch as usize].pop = (c.pop + 1) % c.len;
        regs.pending |= 1 << ch;
        Ok(())
    }

    /// Complete one descriptor on `ch` as a whole packet whose reported size is `size`,
    /// regardless of how many bytes the posted buffer holds.
    pub fn inject_rx_bad_size(&self, ch: ChannelId, size: u16) -> Result<(), SimError> {
        let mut regs = self.regs();
        let c = regs.chans[ch as usize];
        if !c.enabled {
            return Err(SimError::Disabled(ch));
        }
        if c.owned() == 0 {
            return Err(SimError::NoDescriptor {
                channel: ch,
                needed: 1,
                available: 0,
            });
        }
        // SAFETY: an enabled channel has a live ring.
        let view = unsafe { c.view() };
        let mut desc = view.read(c.pop as usize);
        desc.set_size(size);
        desc.set_sop(true);
        desc.set_eop(true);
        desc.set_err(false);
        desc.set_interrupt(true);
        view.write(c.pop as usize, &desc);
        regs.chans[ch as usize].pop = (c.pop + 1) % c.len;
        regs.pending |= 1 << ch;
        Ok(())
    }

    /// Transmit everything queued on `ch`. Returns the number of frames sent.
    pub fn complete_tx(&self, ch: ChannelId) -> usize {
        let mut regs = self.regs();
        let c = regs.chans[ch as usize];
        if !c.enabled {
            return 0;
        }
        // SAFETY: an enabled channel has a live ring.
        let view = unsafe { c.view() };
        let mut sent = Vec::new();
        let mut pop = c.pop;
        while pop != c.work {
            let mut desc = view.read(pop as usize);
            let len = desc.size() as usize;
            let mut data = vec![0u8; len];
            // SAFETY: the driver keeps the mapped buffer alive until it reclaims the slot.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    desc.src_addr() as usize as *const u8,
                    data.as_mut_ptr(),
                    len,
                );
            }
            desc.set_interrupt(true);
            view.write(pop as usize, &desc);
            sent.push((ch, data));
            pop = (pop + 1) % c.len;
        }
        let n = sent.len();
        regs.chans[ch as usize].pop = pop;
        if n > 0 {
            regs.pending |= 1 << ch;
            trace!(channel = ch, frames = n, "sim tx completed");
        }
        regs.tx_out.extend(sent);
        n
    }

    /// Frames the device put on the wire, oldest first.
    pub fn take_tx(&self) -> Vec<(ChannelId, Vec<u8>)> {
        std::mem::take(&mut self.regs().tx_out)
    }

    /// Latch a DMA error on `ch`.
    pub fn raise_error(&self, ch: ChannelId) {
        self.regs().errors |= 1 << ch;
    }

    /// Raise a non-DMA interrupt, such as a link change on a general channel.
    pub fn raise_irq(&self, ch: ChannelId) {
        self.regs().pending |= 1 << ch;
    }

    /// True when the interrupt line would be asserted.
    pub fn irq_line(&self) -> bool {
        let regs = self.regs();
        !regs.gate_masked
            && ((regs.pending & !regs.irq_mask) | (regs.errors & !regs.err_mask)) != 0
    }

    pub fn irq_masked(&self, ch: ChannelId) -> bool {
        self.regs().irq_mask & (1 << ch) != 0
    }

    pub fn error_masked(&self, ch: ChannelId) -> bool {
        self.regs().err_mask & (1 << ch) != 0
    }

    pub fn is_enabled(&self, ch: ChannelId) -> bool {
        self.regs().chans[ch as usize].enabled
    }

    /// Work cursor as last written by the driver.
    pub fn work_idx(&self, ch: ChannelId) -> u32 {
        self.regs().chans[ch as usize].work
    }

    /// Descriptors the device currently owns on `ch`.
    pub fn device_owned(&self, ch: ChannelId) -> usize {
        self.regs().chans[ch as usize].owned()
    }
}

fn write_fragment(view: &DescView<'_>, slot: u32, data: &[u8], sop: bool, eop: bool, err: bool) {
    let mut desc = view.read(slot as usize);
    // SAFETY: the slot is device-owned, so its buffer is mapped and idle on the host side.
    unsafe {
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            desc.dst_addr() as usize as *mut u8,
            data.len(),
        );
    }
    desc.set_size(data.len() as u16);
    desc.set_sop(sop);
    desc.set_eop(eop);
    desc.set_err(err);
    desc.set_interrupt(true);
    view.write(slot as usize, &desc);
}

impl DeviceFamily for SimAsic {
    fn geometry(&self) -> ChipGeometry {
        self.geometry.clone()
    }

    fn mapper(&self) -> &dyn DmaMapper {
        &self.mapper
    }

    fn reset_channel(&self, ch: ChannelId) {
        let mut regs = self.regs();
        let c = &mut regs.chans[ch as usize];
        c.work = 0;
        c.pop = 0;
        c.enabled = false;
        regs.pending &= !(1 << ch);
        regs.errors &= !(1 << ch);
    }

    fn set_ring(&self, ch: ChannelId, base: DeviceAddr, len: u32) {
        let mut regs = self.regs();
        let c = &mut regs.chans[ch as usize];
        c.base = base;
        c.len = len;
    }

    fn enable_channel(&self, ch: ChannelId) {
        self.regs().chans[ch as usize].enabled = true;
    }

    fn disable_channel(&self, ch: ChannelId) {
        self.regs().chans[ch as usize].enabled = false;
    }

    fn set_work_idx(&self, ch: ChannelId, idx: u32) {
        self.regs().chans[ch as usize].work = idx;
    }

    fn hw_pop_idx(&self, ch: ChannelId) -> u32 {
        self.regs().chans[ch as usize].pop
    }

    fn mask_all(&self) {
        self.regs().gate_masked = true;
    }

    fn unmask_all(&self) {
        self.regs().gate_masked = false;
    }

    fn pending_channels(&self) -> u64 {
        let regs = self.regs();
        regs.pending & !regs.irq_mask
    }

    fn pending_error_channels(&self) -> u64 {
        let regs = self.regs();
        regs.errors & !regs.err_mask
    }

    fn mask_channel_irq(&self, ch: ChannelId) {
        self.regs().irq_mask |= 1 << ch;
    }

    fn unmask_channel_irq(&self, ch: ChannelId) {
        self.regs().irq_mask &= !(1 << ch);
    }

    fn clear_channel_irq(&self, ch: ChannelId) {
        self.regs().pending &= !(1 << ch);
    }

    fn mask_error_irq(&self, ch: ChannelId) {
        self.regs().err_mask |= 1 << ch;
    }

    fn unmask_error_irq(&self, ch: ChannelId) {
        self.regs().err_mask &= !(1 << ch);
    }

    fn clear_error_irq(&self, ch: ChannelId) {
        self.regs().errors &= !(1 << ch);
    }
}
