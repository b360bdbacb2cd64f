// DMA descriptor layout
//
// word 0: src_addr[31:0]
// word 1: src_addr[47:32] (bits 0-15) | size (bits 16-31)
// word 2: dst_addr[31:0]
// word 3: dst_addr[47:32] (bits 0-15) | status (bits 16-31)
//
// status: 16 interrupt, 17 err, 18 eop, 19 sop, 20 sinc, 21 dinc,
//         22-26 xfer_size, 27 limit_xfer_en, 28-31 reserved
//
// Word 3 carries the ownership handoff. The device writes it last, so software loads it
// with Acquire before looking at anything else, and stores it with Release when arming.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

pub const DESC_WORDS: usize = 4;
pub const DESC_SIZE: usize = DESC_WORDS * 4;

const ADDR_HI_MASK: u32 = 0xFFFF;
const ADDR_MASK: u64 = (1 << 48) - 1;

const ST_INTERRUPT: u32 = 16;
const ST_ERR: u32 = 17;
const ST_EOP: u32 = 18;
const ST_SOP: u32 = 19;
const ST_SINC: u32 = 20;
const ST_DINC: u32 = 21;
const ST_XFER_SIZE: u32 = 22;
const ST_LIMIT_XFER_EN: u32 = 27;

/// A copy of one hardware descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    words: [u32; DESC_WORDS],
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("src_addr", &format_args!("{:#x}", self.src_addr()))
            .field("dst_addr", &format_args!("{:#x}", self.dst_addr()))
            .field("size", &self.size())
            .field("interrupt", &self.interrupt())
            .field("err", &self.err())
            .field("sop", &self.sop())
            .field("eop", &self.eop())
            .finish()
    }
}

impl Descriptor {
    #[inline]
    pub fn from_words(words: [u32; DESC_WORDS]) -> Self {
        Self { words }
    }

    #[inline]
    pub fn words(&self) -> [u32; DESC_WORDS] {
        self.words
    }

    /// Descriptor handing an empty receive buffer of `size` bytes to the device.
    pub fn rx(dst: u64, size: u16) -> Self {
        let mut d = Self::default();
        d.set_dst_addr(dst);
        d.set_size(size);
        d.set_dinc(true);
        d
    }

    /// Descriptor handing a complete single-fragment frame to the device.
    pub fn tx(src: u64, len: u16) -> Self {
        let mut d = Self::default();
        d.set_src_addr(src);
        d.set_size(len);
        d.set_sinc(true);
        d.set_sop(true);
        d.set_eop(true);
        d
    }

    #[inline]
    fn bit(&self, n: u32) -> bool {
        self.words[3] & (1 << n) != 0
    }

    #[inline]
    fn set_bit(&mut self, n: u32, v: bool) {
        if v {
            self.words[3] |= 1 << n;
        } else {
            self.words[3] &= !(1 << n);
        }
    }

    pub fn src_addr(&self) -> u64 {
        (((self.words[1] & ADDR_HI_MASK) as u64) << 32) | self.words[0] as u64
    }

    pub fn set_src_addr(&mut self, addr: u64) {
        let addr = addr & ADDR_MASK;
        self.words[0] = addr as u32;
        self.words[1] = (self.words[1] & !ADDR_HI_MASK) | (addr >> 32) as u32;
    }

    pub fn dst_addr(&self) -> u64 {
        (((self.words[3] & ADDR_HI_MASK) as u64) << 32) | self.words[2] as u64
    }

    pub fn set_dst_addr(&mut self, addr: u64) {
        let addr = addr & ADDR_MASK;
        self.words[2] = addr as u32;
        self.words[3] = (self.words[3] & !ADDR_HI_MASK) | (addr >> 32) as u32;
    }

    /// Buffer size when armed, transferred length when completed.
    pub fn size(&self) -> u16 {
        (self.words[1] >> 16) as u16
    }

    pub fn set_size(&mut self, size: u16) {
        self.words[1] = (self.words[1] & ADDR_HI_MASK) | ((size as u32) << 16);
    }

    /// Set by the device when the transfer is complete.
    pub fn interrupt(&self) -> bool {
        self.bit(ST_INTERRUPT)
    }

    pub fn set_interrupt(&mut self, v: bool) {
        self.set_bit(ST_INTERRUPT, v)
    }

    pub fn err(&self) -> bool {
        self.bit(ST_ERR)
    }

    pub fn set_err(&mut self, v: bool) {
        self.set_bit(ST_ERR, v)
    }

    pub fn eop(&self) -> bool {
        self.bit(ST_EOP)
    }

    pub fn set_eop(&mut self, v: bool) {
        self.set_bit(ST_EOP, v)
    }

    pub fn sop(&self) -> bool {
        self.bit(ST_SOP)
    }

    pub fn set_sop(&mut self, v: bool) {
        self.set_bit(ST_SOP, v)
    }

    pub fn sinc(&self) -> bool {
        self.bit(ST_SINC)
    }

    pub fn set_sinc(&mut self, v: bool) {
        self.set_bit(ST_SINC, v)
    }

    pub fn dinc(&self) -> bool {
        self.bit(ST_DINC)
    }

    pub fn set_dinc(&mut self, v: bool) {
        self.set_bit(ST_DINC, v)
    }

    pub fn xfer_size(&self) -> u8 {
        ((self.words[3] >> ST_XFER_SIZE) & 0x1F) as u8
    }

    pub fn set_xfer_size(&mut self, v: u8) {
        self.words[3] =
            (self.words[3] & !(0x1F << ST_XFER_SIZE)) | (((v & 0x1F) as u32) << ST_XFER_SIZE);
    }

    pub fn limit_xfer_en(&self) -> bool {
        self.bit(ST_LIMIT_XFER_EN)
    }

    pub fn set_limit_xfer_en(&mut self, v: bool) {
        self.set_bit(ST_LIMIT_XFER_EN, v)
    }
}

/// Shared view of a descriptor array, usable from both sides of the bus.
#[derive(Clone, Copy)]
pub struct DescView<'a> {
    words: &'a [AtomicU32],
}

impl<'a> DescView<'a> {
    /// View `len` descriptors starting at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to `len * DESC_SIZE` bytes of 4-byte aligned memory that stays
    /// valid for `'a` and is only accessed atomically.
    pub unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        let words = unsafe { std::slice::from_raw_parts(ptr as *const AtomicU32, len * DESC_WORDS) };
        Self { words }
    }

    /// Number of descriptors.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len() / DESC_WORDS
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Snapshot descriptor `idx`. The status word is read first with Acquire.
    pub fn read(&self, idx: usize) -> Descriptor {
        let base = idx * DESC_WORDS;
        let w3 = self.words[base + 3].load(Ordering::Acquire);
        Descriptor::from_words([
            self.words[base].load(Ordering::Relaxed),
            self.words[base + 1].load(Ordering::Relaxed),
            self.words[base + 2].load(Ordering::Relaxed),
            w3,
        ])
    }

    /// Store descriptor `idx`. The status word is written last with Release.
    pub fn write(&self, idx: usize, desc: &Descriptor) {
        let base = idx * DESC_WORDS;
        let w = desc.words();
        self.words[base].store(w[0], Ordering::Relaxed);
        self.words[base + 1].store(w[1], Ordering::Relaxed);
        self.words[base + 2].store(w[2], Ordering::Relaxed);
        self.words[base + 3].store(w[3], Ordering::Release);
    }
}

/// Owned, zero-initialized descriptor ring memory.
pub struct DescRing {
    ptr: NonNull<AtomicU32>,
    len: usize,
}

// The memory is only accessed through atomics.
unsafe impl Send for DescRing {}
unsafe impl Sync for DescRing {}

impl DescRing {
    const ALIGN: usize = 64;

    /// Allocate `len` zeroed descriptors. Returns `None` when `len` is zero or allocation fails.
    pub fn new(len: usize) -> Option<Self> {
        let layout = Self::layout(len)?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw as *mut AtomicU32).map(|ptr| Self { ptr, len })
    }

    fn layout(len: usize) -> Option<Layout> {
        if len == 0 {
            return None;
        }
        Layout::from_size_align(len.checked_mul(DESC_SIZE)?, Self::ALIGN).ok()
    }

    #[inline]
    pub fn view(&self) -> DescView<'_> {
        let words = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len * DESC_WORDS) };
        DescView { words }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len * DESC_SIZE
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Zero every descriptor.
    pub fn clear(&self) {
        let view = self.view();
        for i in 0..self.len {
            view.write(i, &Descriptor::default());
        }
    }
}

impl Drop for DescRing {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.len) {
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_fields_do_not_overlap() {
        let mut d = Descriptor::tx(0xABCD_1234_5678, 1500);
        d.set_dst_addr(0x1111_2222_3333);
        d.set_xfer_size(0x1F);
        assert_eq!(d.src_addr(), 0xABCD_1234_5678);
        assert_eq!(d.dst_addr(), 0x1111_2222_3333);
        assert_eq!(d.size(), 1500);
        assert!(d.sop() && d.eop() && d.sinc());
        assert!(!d.interrupt() && !d.err() && !d.dinc());
        assert_eq!(d.xfer_size(), 0x1F);
        assert!(!d.limit_xfer_en());

        d.set_interrupt(true);
        assert_eq!(d.words()[3] >> 16 & 1, 1);
        d.set_interrupt(false);
        assert!(!d.interrupt());
    }

    #[test]
    fn test_rx_descriptor() {
        let d = Descriptor::rx(0x1000, 4096);
        assert_eq!(d.dst_addr(), 0x1000);
        assert_eq!(d.size(), 4096);
        assert!(d.dinc() && !d.sinc() && !d.interrupt());
    }

    #[test]
    fn test_ring_read_write() {
        let ring = DescRing::new(8).unwrap();
        assert_eq!(ring.byte_len(), 128);
        let view = ring.view();
        assert_eq!(view.len(), 8);
        let d = Descriptor::rx(0xdead_beef, 64);
        view.write(7, &d);
        assert_eq!(view.read(7), d);
        assert_eq!(view.read(0), Descriptor::default());

        let alias = unsafe { DescView::from_raw(ring.as_non_null().as_ptr(), ring.len()) };
        assert_eq!(alias.read(7), d);
        ring.clear();
        assert_eq!(view.read(7), Descriptor::default());
    }
}
