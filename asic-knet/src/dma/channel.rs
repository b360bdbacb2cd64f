// Channel arena
//
// One object per interrupt channel, indexed by channel id. Each owns its ring state behind
// its own lock, its counters and its deferred work item.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::ring::RingChannel;
use crate::api::hw::{ChannelId, ChannelKind};
use crate::config::ChipGeometry;
use crate::rx::RxAssembler;
use crate::runtime::WorkItem;

macro_rules! counter_set {
    ($(#[$meta:meta])* $name:ident, $snap:ident { $($(#[$fmeta:meta])* $field:ident),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: ::std::sync::atomic::AtomicU64,)*
        }

        /// Point-in-time copy of the counters.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $snap {
            $($(#[$fmeta])* pub $field: u64,)*
        }

        impl $name {
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(::std::sync::atomic::Ordering::Relaxed),)*
                }
            }

            pub fn clear(&self) {
                $(self.$field.store(0, ::std::sync::atomic::Ordering::Relaxed);)*
            }
        }
    };
}

pub(crate) use counter_set;

counter_set!(
    /// Per-channel statistics.
    ChannelCounters, ChannelCountersSnapshot {
        /// Packets received (RX) or completed (TX).
        packets,
        bytes,
        /// Refill allocations that failed.
        no_memory,
        /// Recoveries that completed.
        err_recover,
        interrupts,
        error_interrupts,
        /// Packets for which no interface matched the destination.
        netdev_miss,
        /// Allocation attempts made by the recovery task.
        recovery_retries,
        /// Partial packets dropped by the assembler.
        assembly_errors,
        /// Packets dropped after reassembly.
        dropped,
    }
);

#[inline]
pub(crate) fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

/// Ring and reassembly state of one RX channel.
#[derive(Debug)]
pub struct RxState {
    pub ring: RingChannel,
    pub asm: RxAssembler,
}

/// An interrupt channel and the state it serializes.
#[derive(Debug)]
pub struct Channel<T> {
    id: ChannelId,
    kind: ChannelKind,
    state: Mutex<Option<T>>,
    counters: ChannelCounters,
    work: WorkItem,
    closing: AtomicBool,
    recovering: AtomicBool,
}

impl<T> Channel<T> {
    pub fn new(id: ChannelId, kind: ChannelKind, state: Option<T>) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(state),
            counters: ChannelCounters::default(),
            work: WorkItem::new(),
            closing: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Lock the channel state. `None` once the channel has been torn down.
    pub fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    #[inline]
    pub fn work(&self) -> &WorkItem {
        &self.work
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Claim the recovery role. Returns false if a recovery task already runs.
    pub fn begin_recovery(&self) -> bool {
        !self.recovering.swap(true, Ordering::AcqRel)
    }

    pub fn end_recovery(&self) {
        self.recovering.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Stop new deferred units and wait out the running one.
    ///
    /// Returns the channel state for the caller to release.
    pub fn quiesce(&self) -> Option<T> {
        self.closing.store(true, Ordering::Release);
        self.lock().take()
    }

    /// Install fresh state and accept deferred units again.
    pub fn reopen(&self, state: T) {
        *self.lock() = Some(state);
        self.closing.store(false, Ordering::Release);
    }
}

/// All channels of a device, addressed by channel id.
#[derive(Debug)]
pub struct ChannelArena {
    geometry: ChipGeometry,
    rx: Box<[Arc<Channel<RxState>>]>,
    tx: Box<[Arc<Channel<RingChannel>>]>,
    general: Box<[Arc<Channel<()>>]>,
}

impl ChannelArena {
    pub fn new(
        geometry: ChipGeometry,
        rx: Vec<Arc<Channel<RxState>>>,
        tx: Vec<Arc<Channel<RingChannel>>>,
    ) -> Self {
        let general = (geometry.dma_channels()..geometry.total_channels)
            .map(|id| Arc::new(Channel::new(id, ChannelKind::General, None)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            geometry,
            rx: rx.into_boxed_slice(),
            tx: tx.into_boxed_slice(),
            general,
        }
    }

    #[inline]
    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    pub fn kind(&self, ch: ChannelId) -> Option<ChannelKind> {
        ChannelKind::of(&self.geometry, ch)
    }

    pub fn rx(&self, ch: ChannelId) -> Option<&Arc<Channel<RxState>>> {
        match self.kind(ch)? {
            ChannelKind::Rx => self.rx.get(ch as usize),
            _ => None,
        }
    }

    pub fn tx(&self, ch: ChannelId) -> Option<&Arc<Channel<RingChannel>>> {
        match self.kind(ch)? {
            ChannelKind::Tx => self.tx.get((ch - self.geometry.first_tx_channel()) as usize),
            _ => None,
        }
    }

    pub fn general(&self, ch: ChannelId) -> Option<&Arc<Channel<()>>> {
        match self.kind(ch)? {
            ChannelKind::General => self.general.get((ch - self.geometry.dma_channels()) as usize),
            _ => None,
        }
    }

    /// Counters of any channel class.
    pub fn counters(&self, ch: ChannelId) -> Option<&ChannelCounters> {
        match self.kind(ch)? {
            ChannelKind::Rx => self.rx(ch).map(|c| c.counters()),
            ChannelKind::Tx => self.tx(ch).map(|c| c.counters()),
            ChannelKind::General => self.general(ch).map(|c| c.counters()),
        }
    }

    pub fn rx_channels(&self) -> impl Iterator<Item = &Arc<Channel<RxState>>> {
        self.rx.iter()
    }

    pub fn tx_channels(&self) -> impl Iterator<Item = &Arc<Channel<RingChannel>>> {
        self.tx.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_lookup_by_class() {
        let g = ChipGeometry::nb();
        let arena = ChannelArena::new(g, Vec::new(), Vec::new());
        assert!(arena.rx(0).is_none());
        assert!(arena.tx(0).is_none());
        assert_eq!(arena.general(8).map(|c| c.id()), Some(8));
        assert_eq!(arena.general(19).map(|c| c.id()), Some(19));
        assert!(arena.general(20).is_none());
        assert!(arena.counters(42).is_none());
    }

    #[test]
    fn test_counters_snapshot_and_clear() {
        let c = ChannelCounters::default();
        bump(&c.packets);
        add(&c.bytes, 1500);
        let s = c.snapshot();
        assert_eq!(s.packets, 1);
        assert_eq!(s.bytes, 1500);
        c.clear();
        assert_eq!(c.snapshot(), ChannelCountersSnapshot::default());
    }

    #[test]
    fn test_quiesce_and_reopen() {
        let ch = Channel::new(0, ChannelKind::Rx, Some(7u32));
        assert_eq!(ch.quiesce(), Some(7));
        assert!(ch.is_closing());
        assert!(ch.lock().is_none());
        ch.reopen(9);
        assert!(!ch.is_closing());
        assert!(ch.begin_recovery());
        assert!(!ch.begin_recovery());
        ch.end_recovery();
        assert!(!ch.is_recovering());
    }
}
