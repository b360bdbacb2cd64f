// RX buffer recovery
//
// A deferred unit that cannot restock a consumed slot records it as pending, leaves the
// channel interrupt masked and hands over to this task. The task may sleep: it retries the
// allocation with a fixed back-off and restocks the slot under the channel lock. If the
// ring is still armed it then unmasks the interrupt and posts a fresh drain for whatever
// arrived meanwhile. A faulted, reset or stopped ring is left alone.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Deferred, Executor};
use crate::api::Error;
use crate::api::hw::{ChannelKind, DeviceFamily, Direction};
use crate::dma::channel::bump;
use crate::dma::{BufferPool, Channel, ChannelState, RxState};

pub(crate) struct RecoveryTask<D> {
    pub channel: Arc<Channel<RxState>>,
    pub dev: Arc<dyn DeviceFamily>,
    pub pool: BufferPool,
    pub frag_size: usize,
    pub backoff: Duration,
    pub exec: Arc<dyn Executor>,
    pub target: Arc<D>,
}

impl<D: Deferred> RecoveryTask<D> {
    /// Post the task. The caller has already claimed the channel's recovery role.
    pub(crate) fn spawn(self) {
        let exec = self.exec.clone();
        exec.spawn_blocking(Box::new(move || {
            self.run();
        }));
    }

    /// Returns true if the pending slot was restocked.
    fn run(self) -> bool {
        let ch = &self.channel;
        let id = ch.id();
        let mut attempts = 0u64;

        let restocked = loop {
            if ch.is_closing() {
                debug!(channel = id, attempts, "recovery abandoned, channel closing");
                ch.end_recovery();
                return false;
            }
            attempts += 1;
            bump(&ch.counters().recovery_retries);

            let buf = self
                .pool
                .alloc(self.frag_size)
                .map_err(Error::from)
                .and_then(|mut buf| {
                    self.pool
                        .map_for_device(&mut buf, Direction::FromDevice)
                        .map_err(Error::from)
                        .map(|_| buf)
                });
            let buf = match buf {
                Ok(buf) => buf,
                Err(e) => {
                    if attempts == 1 {
                        warn!(channel = id, error = %e, "rx refill still failing, backing off");
                    }
                    self.exec.sleep(self.backoff);
                    continue;
                }
            };

            let mut guard = ch.lock();
            let Some(st) = guard.as_mut() else {
                break None;
            };
            if st.ring.state() == ChannelState::Faulted {
                debug!(channel = id, attempts, "recovery abandoned, channel faulted");
                break None;
            }
            match st.ring.complete_recovery(buf) {
                Ok(slot) => break Some((slot, st.ring.work_idx(), st.ring.state())),
                // Slot no longer pending: the ring was reset meanwhile.
                Err(_buf) => break None,
            }
        };

        let Some((slot, work_idx, state)) = restocked else {
            ch.end_recovery();
            return false;
        };
        bump(&ch.counters().err_recover);
        info!(channel = id, slot, work_idx, attempts, "rx slot restocked");
        // Stopped meanwhile: start_rx unmasks.
        if state != ChannelState::Armed {
            ch.end_recovery();
            return true;
        }
        self.dev.clear_channel_irq(id);
        self.dev.unmask_channel_irq(id);
        ch.end_recovery();

        if ch.work().try_schedule() {
            let target = self.target.clone();
            self.exec.spawn(Box::new(move || target.run(ChannelKind::Rx, id)));
        }
        true
    }
}
