//! Host-side collaborators: an on-demand executor, a recording network stack and a
//! recording broadcast sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use asic_knet::BoxError;
use asic_knet::netif::{MacAddress, NetStack};
use asic_knet::netlink::BroadcastSink;
use asic_knet::runtime::{Executor, Job};
use bytes::Bytes;

/// Executor that queues jobs until the test runs them.
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run the oldest job. Returns false when nothing was queued.
    pub fn run_one(&self) -> bool {
        let job = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including ones queued meanwhile.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        while self.run_one() {
            n += 1;
        }
        n
    }
}

impl Executor for ManualExecutor {
    fn spawn(&self, job: Job) {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).push_back(job);
    }

    fn spawn_blocking(&self, job: Job) {
        self.spawn(job);
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur.min(Duration::from_millis(1)));
    }
}

/// Network stack that records registrations and delivered frames.
pub struct RecordingStack {
    next_ifindex: AtomicU32,
    registered: Mutex<Vec<(u32, String, MacAddress)>>,
    received: Mutex<Vec<(u32, Bytes)>>,
}

impl Default for RecordingStack {
    fn default() -> Self {
        Self {
            next_ifindex: AtomicU32::new(100),
            registered: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered devices as `(ifindex, name, mac)`.
    pub fn registered(&self) -> Vec<(u32, String, MacAddress)> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain delivered frames as `(ifindex, frame)`.
    pub fn take_received(&self) -> Vec<(u32, Bytes)> {
        std::mem::take(&mut *self.received.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl NetStack for RecordingStack {
    fn register(&self, name: &str, mac: MacAddress) -> Result<u32, BoxError> {
        let mut reg = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        if reg.iter().any(|(_, n, _)| n == name) {
            return Err(format!("device {name} exists").into());
        }
        let ifindex = self.next_ifindex.fetch_add(1, Ordering::Relaxed);
        reg.push((ifindex, name.to_string(), mac));
        Ok(ifindex)
    }

    fn unregister(&self, ifindex: u32) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(i, _, _)| *i != ifindex);
    }

    fn receive(&self, ifindex: u32, frame: Bytes) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((ifindex, frame));
    }
}

/// A broadcast message as `(family, group, payload)`.
pub type Broadcast = (String, String, Bytes);

/// Broadcast sink that records every message.
#[derive(Default)]
pub struct RecordingSink {
    families: Mutex<Vec<String>>,
    sent: Mutex<Vec<Broadcast>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later broadcasts fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn families(&self) -> Vec<String> {
        self.families.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take_sent(&self) -> Vec<Broadcast> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl BroadcastSink for RecordingSink {
    fn register_family(&self, family: &str, _groups: &[String]) -> Result<(), BoxError> {
        self.families
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(family.to_string());
        Ok(())
    }

    fn unregister_family(&self, family: &str) {
        self.families
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|f| f != family);
    }

    fn broadcast(&self, family: &str, group: &str, msg: Bytes) -> Result<(), BoxError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err("no listeners".into());
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((family.to_string(), group.to_string(), msg));
        Ok(())
    }
}
