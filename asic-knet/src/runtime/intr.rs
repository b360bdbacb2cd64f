// Interrupt top half
//
// Runs with every channel interrupt masked: reads the pending bitmaps, faults channels that
// raised a hardware error, masks and acknowledges each pending RX/TX channel and posts its
// deferred unit. The unit unmasks the channel when it is done.

use std::sync::Arc;

use tracing::{debug, error, trace};

use super::Executor;
use crate::api::hw::{ChannelId, ChannelKind, DeviceFamily};
use crate::dma::channel::bump;
use crate::dma::ChannelArena;

/// Deferred processing of one channel, posted by the top half.
pub(crate) trait Deferred: Send + Sync + 'static {
    fn run(self: Arc<Self>, kind: ChannelKind, ch: ChannelId);
}

/// What one top-half pass found, as channel bitmaps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IrqStatus {
    pub rx: u64,
    pub tx: u64,
    pub general: u64,
    pub errors: u64,
    /// Channels whose deferred unit was posted (not coalesced).
    pub scheduled: u64,
}

impl IrqStatus {
    pub fn is_empty(&self) -> bool {
        (self.rx | self.tx | self.general | self.errors) == 0
    }
}

pub struct InterruptDispatcher {
    dev: Arc<dyn DeviceFamily>,
    arena: Arc<ChannelArena>,
    exec: Arc<dyn Executor>,
}

impl std::fmt::Debug for InterruptDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptDispatcher").finish_non_exhaustive()
    }
}

impl InterruptDispatcher {
    pub fn new(dev: Arc<dyn DeviceFamily>, arena: Arc<ChannelArena>, exec: Arc<dyn Executor>) -> Self {
        Self { dev, arena, exec }
    }

    /// Handle one raised interrupt.
    pub(crate) fn dispatch<D: Deferred>(&self, target: &Arc<D>) -> IrqStatus {
        let mut status = IrqStatus::default();
        self.dev.mask_all();

        let pending = self.dev.pending_channels();
        let errors = self.dev.pending_error_channels();

        for ch in bits(errors) {
            status.errors |= 1 << ch;
            self.fault(ch);
        }

        for ch in bits(pending & !errors) {
            match self.arena.kind(ch) {
                Some(kind @ (ChannelKind::Rx | ChannelKind::Tx)) => {
                    if kind == ChannelKind::Rx {
                        status.rx |= 1 << ch;
                    } else {
                        status.tx |= 1 << ch;
                    }
                    if self.schedule(kind, ch, target) {
                        status.scheduled |= 1 << ch;
                    }
                }
                Some(ChannelKind::General) => {
                    status.general |= 1 << ch;
                    self.dev.clear_channel_irq(ch);
                    if let Some(c) = self.arena.counters(ch) {
                        bump(&c.interrupts);
                    }
                    debug!(channel = ch, "general channel interrupt acknowledged");
                }
                None => {
                    self.dev.clear_channel_irq(ch);
                    debug!(channel = ch, "interrupt from unknown channel");
                }
            }
        }

        self.dev.unmask_all();
        trace!(?status, "irq handled");
        status
    }

    fn schedule<D: Deferred>(&self, kind: ChannelKind, ch: ChannelId, target: &Arc<D>) -> bool {
        self.dev.mask_channel_irq(ch);
        self.dev.clear_channel_irq(ch);

        let (work, closing) = match kind {
            ChannelKind::Rx => match self.arena.rx(ch) {
                Some(c) => {
                    bump(&c.counters().interrupts);
                    (c.work(), c.is_closing() || c.is_recovering())
                }
                None => return false,
            },
            _ => match self.arena.tx(ch) {
                Some(c) => {
                    bump(&c.counters().interrupts);
                    (c.work(), c.is_closing())
                }
                None => return false,
            },
        };
        // A recovering channel is unmasked by its recovery task.
        if closing || !work.try_schedule() {
            return false;
        }
        let target = target.clone();
        self.exec.spawn(Box::new(move || target.run(kind, ch)));
        true
    }

    fn fault(&self, ch: ChannelId) {
        self.dev.mask_channel_irq(ch);
        self.dev.mask_error_irq(ch);
        self.dev.clear_error_irq(ch);
        match self.arena.kind(ch) {
            Some(ChannelKind::Rx) => {
                if let Some(c) = self.arena.rx(ch) {
                    bump(&c.counters().error_interrupts);
                    if let Some(st) = c.lock().as_mut() {
                        st.ring.set_faulted();
                    }
                }
            }
            Some(ChannelKind::Tx) => {
                if let Some(c) = self.arena.tx(ch) {
                    bump(&c.counters().error_interrupts);
                    if let Some(ring) = c.lock().as_mut() {
                        ring.set_faulted();
                    }
                }
            }
            Some(ChannelKind::General) => {
                if let Some(c) = self.arena.counters(ch) {
                    bump(&c.error_interrupts);
                }
            }
            None => {}
        }
        error!(channel = ch, "hardware error interrupt, channel left masked");
    }
}

fn bits(mut map: u64) -> impl Iterator<Item = ChannelId> {
    std::iter::from_fn(move || {
        if map == 0 {
            return None;
        }
        let ch = map.trailing_zeros();
        map &= map - 1;
        Some(ch)
    })
}
