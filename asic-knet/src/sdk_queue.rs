//! Bounded queue toward the user-space SDK.
//!
//! Producers are deferred RX units and never block: a full queue rejects the packet and
//! counts the failure. The single consumer waits on a condition variable with a timeout.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::dma::channel::counter_set;
use crate::rx::RxPacket;

counter_set!(
    /// Queue accounting.
    SdkQueueCounters, SdkQueueCountersSnapshot {
        enqueue_ok,
        enqueue_fail,
        dequeue_ok,
        /// Waits that expired.
        dequeue_fail,
    }
);

#[derive(Debug)]
pub struct SdkRxQueue {
    capacity: usize,
    queue: Mutex<VecDeque<RxPacket>>,
    ready: Condvar,
    counters: SdkQueueCounters,
}

impl SdkRxQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            ready: Condvar::new(),
            counters: SdkQueueCounters::default(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking. A full queue hands the packet back.
    pub fn try_enqueue(&self, pkt: RxPacket) -> Result<(), RxPacket> {
        let mut q = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if q.len() >= self.capacity {
            drop(q);
            self.counters.enqueue_fail.fetch_add(1, Ordering::Relaxed);
            return Err(pkt);
        }
        q.push_back(pkt);
        drop(q);
        self.counters.enqueue_ok.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the oldest packet, waiting up to `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<RxPacket> {
        let deadline = Instant::now() + timeout;
        let mut q = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(pkt) = q.pop_front() {
                self.counters.dequeue_ok.fetch_add(1, Ordering::Relaxed);
                return Some(pkt);
            }
            let now = Instant::now();
            if now >= deadline {
                self.counters.dequeue_fail.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            q = self
                .ready
                .wait_timeout(q, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drop everything queued. Returns how many packets were freed.
    pub fn drain(&self) -> usize {
        let mut q = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let n = q.len();
        q.clear();
        n
    }

    pub fn counters(&self) -> &SdkQueueCounters {
        &self.counters
    }
}
