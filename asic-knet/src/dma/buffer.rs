// DMA packet buffers
//
// A DmaBuffer has exactly one owner at a time: a ring slot, an in-flight RxPacket,
// a consumer queue or a TX slot. Moving the value is the ownership transfer.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::api::hw::{DeviceAddr, DeviceFamily, Direction};

const BUF_ALIGN: usize = 64;

/// Buffer allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The pool reached its configured buffer limit.
    Exhausted { limit: usize },
    /// The system allocator returned nothing.
    OutOfMemory { size: usize },
    /// Zero-sized or overflowing request.
    BadSize { size: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Exhausted { limit } => write!(f, "buffer pool exhausted ({limit} buffers)"),
            AllocError::OutOfMemory { size } => write!(f, "out of memory allocating {size} bytes"),
            AllocError::BadSize { size } => write!(f, "invalid buffer size {size}"),
        }
    }
}

impl std::error::Error for AllocError {}

/// DMA mapping failed. Always a hardware-class fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The address is not reachable with the device's addressing width.
    AddressOverflow { addr: u64, bits: u32 },
    /// The mapper refused the request.
    Rejected,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaError::AddressOverflow { addr, bits } => {
                write!(f, "address {addr:#x} beyond {bits}-bit DMA window")
            }
            DmaError::Rejected => write!(f, "DMA mapping rejected"),
        }
    }
}

impl std::error::Error for DmaError {}

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone, Default)]
pub struct BufferPoolConfig {
    /// Maximum number of live buffers (None = unbounded).
    pub limit: Option<usize>,
}

impl BufferPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

struct PoolInner {
    dev: Arc<dyn DeviceFamily>,
    limit: Option<usize>,
    outstanding: AtomicUsize,
    alloc_failures: AtomicU64,
    map_failures: AtomicU64,
}

/// Allocator of device-mappable packet buffers.
///
/// Cloning is cheap; clones share the same accounting.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("limit", &self.inner.limit)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl BufferPool {
    pub fn new(dev: Arc<dyn DeviceFamily>, config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                dev,
                limit: config.limit,
                outstanding: AtomicUsize::new(0),
                alloc_failures: AtomicU64::new(0),
                map_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate an empty buffer with room for `size` bytes.
    #[inline]
    pub fn alloc(&self, size: usize) -> Result<DmaBuffer, AllocError> {
        self.alloc_with_headroom(0, size)
    }

    /// Allocate an empty buffer with `headroom` bytes reserved in front for `prepend`.
    pub fn alloc_with_headroom(&self, headroom: usize, size: usize) -> Result<DmaBuffer, AllocError> {
        let res = self.try_alloc(headroom, size);
        if res.is_err() {
            self.inner.alloc_failures.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    fn try_alloc(&self, headroom: usize, size: usize) -> Result<DmaBuffer, AllocError> {
        let cap = headroom
            .checked_add(size)
            .filter(|c| *c > 0)
            .ok_or(AllocError::BadSize { size })?;
        let layout = Layout::from_size_align(cap, BUF_ALIGN).map_err(|_| AllocError::BadSize { size })?;

        self.reserve()?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(AllocError::OutOfMemory { size: cap });
        };
        Ok(DmaBuffer {
            ptr,
            cap,
            head: headroom,
            len: 0,
            mapping: None,
            pool: self.inner.clone(),
        })
    }

    fn reserve(&self) -> Result<(), AllocError> {
        let Some(limit) = self.inner.limit else {
            self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| AllocError::Exhausted { limit })
    }

    /// Map `buf` for the device. RX mappings cover the tailroom; TX mappings cover the data.
    pub fn map_for_device(&self, buf: &mut DmaBuffer, dir: Direction) -> Result<DeviceAddr, DmaError> {
        let res = buf.map(dir);
        if res.is_err() {
            self.inner.map_failures.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    /// Release the device mapping of `buf`, if any.
    pub fn unmap(&self, buf: &mut DmaBuffer) {
        buf.unmap();
    }

    /// Buffers currently alive.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.limit
    }

    pub fn alloc_failures(&self) -> u64 {
        self.inner.alloc_failures.load(Ordering::Relaxed)
    }

    pub fn map_failures(&self) -> u64 {
        self.inner.map_failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    addr: DeviceAddr,
    len: usize,
    dir: Direction,
}

/// Owning handle to one device-mappable buffer.
///
/// The buffer is unmapped and freed when dropped.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    cap: usize,
    head: usize,
    len: usize,
    mapping: Option<Mapping>,
    pool: Arc<PoolInner>,
}

// Exclusively owned memory.
unsafe impl Send for DmaBuffer {}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("len", &self.len)
            .field("headroom", &self.head)
            .field("capacity", &self.cap)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

impl DmaBuffer {
    /// Bytes of valid data.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn tailroom(&self) -> usize {
        self.cap - self.head - self.len
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(self.head), self.len) }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.head), self.len) }
    }

    /// Grow the data by `len` bytes at the end. Returns the new region.
    pub fn append(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let start = self.head + self.len;
        self.len += len;
        Some(unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len) })
    }

    /// Grow the data by `len` bytes at the front. Returns the new region.
    pub fn prepend(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.head {
            return None;
        }
        self.head -= len;
        self.len += len;
        Some(unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.head), len) })
    }

    /// Remove `len` bytes from the front.
    pub fn adj(&mut self, len: usize) -> bool {
        if len > self.len {
            return false;
        }
        self.head += len;
        self.len -= len;
        true
    }

    /// Remove `len` bytes from the end.
    pub fn trim(&mut self, len: usize) -> bool {
        if len > self.len {
            return false;
        }
        self.len -= len;
        true
    }

    /// Declare `len` bytes valid after the device wrote them.
    pub fn set_len(&mut self, len: usize) -> bool {
        if self.head + len > self.cap {
            return false;
        }
        self.len = len;
        true
    }

    /// Append a copy of `src`.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> bool {
        match self.append(src.len()) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Explicit duplicate, drawn from the same pool. The copy is unmapped.
    pub fn try_clone(&self) -> Result<DmaBuffer, AllocError> {
        let pool = BufferPool {
            inner: self.pool.clone(),
        };
        let mut copy = pool.alloc_with_headroom(self.head, self.cap - self.head)?;
        copy.extend_from_slice(self.data());
        Ok(copy)
    }

    /// Device address of the current mapping.
    #[inline]
    pub fn device_addr(&self) -> Option<DeviceAddr> {
        self.mapping.map(|m| m.addr)
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    fn map(&mut self, dir: Direction) -> Result<DeviceAddr, DmaError> {
        self.unmap();
        let (offset, len) = match dir {
            Direction::ToDevice => (self.head, self.len),
            Direction::FromDevice | Direction::Bidirectional => (self.head, self.cap - self.head),
        };
        let start = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        let addr = self.pool.dev.mapper().map(start, len, dir)?;
        self.mapping = Some(Mapping { addr, len, dir });
        Ok(addr)
    }

    fn unmap(&mut self) {
        if let Some(m) = self.mapping.take() {
            self.pool.dev.mapper().unmap(m.addr, m.len, m.dir);
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.unmap();
        if let Ok(layout) = Layout::from_size_align(self.cap, BUF_ALIGN) {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dma::testing::NullDevice;

    pub(crate) fn pool(limit: Option<usize>) -> BufferPool {
        let mut cfg = BufferPoolConfig::new();
        if let Some(l) = limit {
            cfg = cfg.limit(l);
        }
        BufferPool::new(Arc::new(NullDevice::default()), cfg)
    }

    #[test]
    fn test_limit_and_release() {
        let pool = pool(Some(2));
        let a = pool.alloc(64).unwrap();
        let _b = pool.alloc(64).unwrap();
        assert_eq!(pool.alloc(64).unwrap_err(), AllocError::Exhausted { limit: 2 });
        assert_eq!(pool.alloc_failures(), 1);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.alloc(64).is_ok());
    }

    #[test]
    fn test_headroom_ops() {
        let pool = pool(None);
        let mut buf = pool.alloc_with_headroom(52, 100).unwrap();
        assert!(buf.extend_from_slice(&[1, 2, 3]));
        buf.prepend(2).unwrap().copy_from_slice(&[9, 9]);
        assert_eq!(buf.data(), &[9, 9, 1, 2, 3]);
        assert!(buf.prepend(51).is_none());
        assert!(buf.adj(2));
        assert!(buf.trim(1));
        assert_eq!(buf.data(), &[1, 2]);
        assert!(!buf.trim(3));
        assert!(buf.append(98).is_some());
        assert!(buf.append(1).is_none());
    }

    #[test]
    fn test_clone_and_map() {
        let pool = pool(None);
        let mut buf = pool.alloc(16).unwrap();
        buf.extend_from_slice(b"abcd");
        let addr = pool.map_for_device(&mut buf, Direction::ToDevice).unwrap();
        assert_eq!(buf.device_addr(), Some(addr));
        let copy = buf.try_clone().unwrap();
        assert_eq!(copy.data(), b"abcd");
        assert!(!copy.is_mapped());
        assert_eq!(pool.outstanding(), 2);
        pool.unmap(&mut buf);
        assert!(!buf.is_mapped());
    }
}
