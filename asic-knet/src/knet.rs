//! The driver instance.
//!
//! [`Knet`] owns every channel of one device together with the tables the data path reads:
//! interfaces, profiles, netlink families and the SDK queue. Interrupts enter through
//! [`Knet::handle_irq`]; deferred units and recovery tasks run on the configured
//! [`Executor`]. Everything else is the control-plane surface.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use asic_knet::{DriverConfig, KnetBuilder};
//! use asic_knet::profile::{Action, ProfileSpec, ReasonMatch};
//!
//! let knet = KnetBuilder::new()
//!     .config(DriverConfig::new().ring_size(256))
//!     .device(device)
//!     .net_stack(stack)
//!     .broadcast_sink(sink)
//!     .executor(executor)
//!     .build()?;
//!
//! knet.create_netif("swp1", 0, [0x02, 0, 0, 0, 0, 1])?;
//! knet.create_profile(ProfileSpec::new("bpdu", 0, Action::NetDevice).reason(ReasonMatch::only(&[5])))?;
//! knet.start_rx()?;
//! // from the interrupt line:
//! knet.handle_irq();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::api::hw::{ChannelId, ChannelKind, DeviceFamily, Direction};
use crate::api::{Error, Result};
use crate::config::{DMA_HDR_LEN, DriverConfig};
use crate::dispatch::{DispatchCountersSnapshot, DispatchRouter, IfaConfig};
use crate::dma::channel::{add, bump};
use crate::dma::{
    BufferPool, BufferPoolConfig, Channel, ChannelArena, ChannelCountersSnapshot, ChannelState,
    DmaBuffer, RingChannel, RxState,
};
use crate::netif::{IntfAttrs, MacAddress, NetStack, NetifInfo, NetifStatsSnapshot, NetifTable};
use crate::netlink::{BroadcastSink, NetlinkCountersSnapshot, NetlinkInfo, NetlinkRegistry};
use crate::profile::{Action, ProfileRule, ProfileSpec, ProfileTable};
use crate::runtime::{Deferred, Executor, InterruptDispatcher, IrqStatus, RecoveryTask};
use crate::rx::{self, MAX_FRAGS, MOD_DEFAULT_DMAC, MetaContext, ReasonCounters, RxAssembler, RxPacket};
use crate::sdk_queue::{SdkQueueCountersSnapshot, SdkRxQueue};

/// Snapshot of one channel for the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub kind: ChannelKind,
    /// `None` for general channels and torn-down rings.
    pub state: Option<ChannelState>,
    pub capacity: u32,
    pub work_idx: u32,
    pub pop_idx: u32,
    pub in_flight: u32,
    pub recovering: bool,
}

/// Builder for a [`Knet`] instance.
#[derive(Default)]
pub struct KnetBuilder {
    config: DriverConfig,
    device: Option<Arc<dyn DeviceFamily>>,
    stack: Option<Arc<dyn NetStack>>,
    sink: Option<Arc<dyn BroadcastSink>>,
    executor: Option<Arc<dyn Executor>>,
}

impl KnetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// The device family driving the hardware.
    pub fn device(mut self, dev: Arc<dyn DeviceFamily>) -> Self {
        self.device = Some(dev);
        self
    }

    /// Host network stack receiving `NetDevice` traffic.
    pub fn net_stack(mut self, stack: Arc<dyn NetStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Broadcast facility behind netlink families.
    pub fn broadcast_sink(mut self, sink: Arc<dyn BroadcastSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn executor(mut self, exec: Arc<dyn Executor>) -> Self {
        self.executor = Some(exec);
        self
    }

    /// Allocate and stock every ring. RX stays stopped until [`Knet::start_rx`].
    pub fn build(self) -> Result<Knet> {
        let config = self.config;
        config.validate()?;
        let dev = self.device.ok_or(Error::InvalidArgument("device not set"))?;
        let stack = self.stack.ok_or(Error::InvalidArgument("net stack not set"))?;
        let sink = self.sink.ok_or(Error::InvalidArgument("broadcast sink not set"))?;
        let exec = self.executor.ok_or(Error::InvalidArgument("executor not set"))?;
        let g = config.geometry.clone();

        let mut pool_cfg = BufferPoolConfig::new();
        if let Some(limit) = config.buffer_limit {
            pool_cfg = pool_cfg.limit(limit);
        }
        let pool = BufferPool::new(dev.clone(), pool_cfg);

        dev.mask_all();
        let mut rx = Vec::with_capacity(g.rx_channels as usize);
        for id in 0..g.rx_channels {
            let mut ring = RingChannel::new(dev.clone(), id, g.ring_size)?;
            stock_rx_ring(&pool, &mut ring, g.frag_size)?;
            dev.mask_channel_irq(id);
            let asm = RxAssembler::new(id, config.sop_policy, g.max_pkt_len);
            rx.push(Arc::new(Channel::new(id, ChannelKind::Rx, Some(RxState { ring, asm }))));
        }
        let mut tx = Vec::with_capacity(g.tx_channels as usize);
        for id in g.first_tx_channel()..g.dma_channels() {
            let mut ring = RingChannel::new(dev.clone(), id, g.ring_size)?;
            ring.arm()?;
            dev.unmask_channel_irq(id);
            dev.unmask_error_irq(id);
            tx.push(Arc::new(Channel::new(id, ChannelKind::Tx, Some(ring))));
        }
        for id in g.dma_channels()..g.total_channels {
            dev.unmask_channel_irq(id);
        }
        let arena = Arc::new(ChannelArena::new(g.clone(), rx, tx));

        let netifs = Arc::new(NetifTable::new(&g, config.max_netifs, stack));
        let netlinks = Arc::new(NetlinkRegistry::new(sink, config.max_netlinks, config.netlink_msg_max));
        let sdk = Arc::new(SdkRxQueue::new(config.sdk_queue_capacity));
        let tx_path = crate::tx::TxPathBuilder::new(arena.clone(), pool.clone(), &g);
        let router = DispatchRouter::new(
            netifs.clone(),
            netlinks.clone(),
            sdk.clone(),
            tx_path,
            config.netif_tx_channel,
        );
        let irq = InterruptDispatcher::new(dev.clone(), arena.clone(), exec.clone());
        dev.unmask_all();

        info!(
            rx_channels = g.rx_channels,
            tx_channels = g.tx_channels,
            ring_size = g.ring_size,
            frag_size = g.frag_size,
            "knet initialized"
        );

        Ok(Knet {
            shared: Arc::new(Shared {
                profiles: ProfileTable::new(config.max_profiles),
                config,
                dev,
                pool,
                arena,
                exec,
                irq,
                netifs,
                netlinks,
                sdk,
                router,
                reasons: ReasonCounters::default(),
                mod_dmac: ArcSwap::from_pointee(None),
                rx_started: AtomicBool::new(false),
            }),
        })
    }
}

fn alloc_rx(pool: &BufferPool, frag_size: usize) -> Result<DmaBuffer> {
    let mut buf = pool.alloc(frag_size)?;
    pool.map_for_device(&mut buf, Direction::FromDevice)?;
    Ok(buf)
}

/// Stock every slot and hand all but one to the device.
fn stock_rx_ring(pool: &BufferPool, ring: &mut RingChannel, frag_size: usize) -> Result<()> {
    for slot in 0..ring.capacity() {
        let buf = alloc_rx(pool, frag_size)?;
        ring.stock_rx(slot, buf)
            .map_err(|_| Error::InvalidArgument("rx slot already stocked"))?;
    }
    ring.advance_work(ring.capacity() - 1)
        .map_err(|_| Error::InvalidArgument("ring too small"))
}

struct Shared {
    config: DriverConfig,
    dev: Arc<dyn DeviceFamily>,
    pool: BufferPool,
    arena: Arc<ChannelArena>,
    exec: Arc<dyn Executor>,
    irq: InterruptDispatcher,
    profiles: ProfileTable,
    netifs: Arc<NetifTable>,
    netlinks: Arc<NetlinkRegistry>,
    sdk: Arc<SdkRxQueue>,
    router: DispatchRouter,
    reasons: ReasonCounters,
    mod_dmac: ArcSwap<Option<MacAddress>>,
    rx_started: AtomicBool,
}

impl Deferred for Shared {
    fn run(self: Arc<Self>, kind: ChannelKind, ch: ChannelId) {
        match kind {
            ChannelKind::Rx => self.rx_bottom_half(ch),
            ChannelKind::Tx => self.tx_bottom_half(ch),
            ChannelKind::General => {}
        }
    }
}

enum RxExit {
    Drained,
    Budget,
    NoMemory,
    Faulted,
}

impl Shared {
    fn rx_bottom_half(self: Arc<Self>, id: ChannelId) {
        let Some(chan) = self.arena.rx(id) else {
            return;
        };
        chan.work().begin();
        if chan.is_closing() {
            return;
        }
        let c = chan.counters();
        let frag_size = self.config.geometry.frag_size;
        let mut done = Vec::new();

        let exit = {
            let mut guard = chan.lock();
            let Some(st) = guard.as_mut() else {
                return;
            };
            let mut budget = st.ring.capacity();
            loop {
                if budget == 0 {
                    break RxExit::Budget;
                }
                let slot = st.ring.pop_idx();
                let Some((desc, mut buf)) = st.ring.pop_completed() else {
                    break if st.ring.state() == ChannelState::Faulted {
                        RxExit::Faulted
                    } else {
                        RxExit::Drained
                    };
                };
                budget -= 1;

                self.pool.unmap(&mut buf);
                let err = desc.err();
                if !err && !buf.set_len(desc.size() as usize) {
                    // Device reported more bytes than the buffer holds.
                    warn!(channel = id, slot, size = desc.size(), "rx descriptor size exceeds buffer");
                    st.asm.reset();
                    bump(&c.assembly_errors);
                    bump(&c.dropped);
                    drop(buf);
                } else if err {
                    st.ring.set_faulted();
                    st.asm.reset();
                    bump(&c.dropped);
                    drop(buf);
                } else {
                    let pushed = st.asm.push(desc.sop(), desc.eop(), buf);
                    add(&c.assembly_errors, pushed.errors as u64);
                    if let Some(pkt) = pushed.packet {
                        done.push(pkt);
                    }
                }

                match alloc_rx(&self.pool, frag_size) {
                    Ok(fresh) => {
                        if st.ring.refill(slot, fresh).is_err() {
                            st.ring.set_faulted();
                            break RxExit::Faulted;
                        }
                    }
                    Err(e) => {
                        bump(&c.no_memory);
                        if st.ring.state() == ChannelState::Faulted {
                            // The slot stays empty until the channel is reset.
                            break RxExit::Faulted;
                        }
                        st.ring.set_recovery_pending(slot);
                        warn!(channel = id, slot, error = %e, "rx refill failed, channel left masked");
                        break RxExit::NoMemory;
                    }
                }
                if err {
                    break RxExit::Faulted;
                }
            }
        };

        for pkt in done {
            self.deliver(pkt, chan);
        }

        match exit {
            RxExit::Drained => self.dev.unmask_channel_irq(id),
            RxExit::Budget => {
                if chan.work().try_schedule() {
                    let me = self.clone();
                    self.exec.spawn(Box::new(move || me.run(ChannelKind::Rx, id)));
                }
            }
            RxExit::NoMemory => {
                if chan.begin_recovery() {
                    RecoveryTask {
                        channel: chan.clone(),
                        dev: self.dev.clone(),
                        pool: self.pool.clone(),
                        frag_size,
                        backoff: self.config.recovery_backoff,
                        exec: self.exec.clone(),
                        target: self.clone(),
                    }
                    .spawn();
                }
            }
            RxExit::Faulted => debug!(channel = id, "rx channel faulted, left masked"),
        }
    }

    /// Classify and dispatch one reassembled packet.
    fn deliver(&self, mut pkt: RxPacket, chan: &Channel<RxState>) {
        let c = chan.counters();
        bump(&c.packets);
        add(&c.bytes, pkt.len() as u64);

        let mod_dmac = **self.mod_dmac.load();
        let port_map = self.netifs.port_map();
        let ctx = MetaContext {
            geometry: &self.config.geometry,
            port_map: &port_map,
            mod_dmac,
            counters: &self.reasons,
        };
        if let Err(e) = rx::extract(&mut pkt, &ctx) {
            trace!(channel = chan.id(), error = ?e, "metadata extraction failed");
            bump(&c.dropped);
            return;
        }

        let head = pkt.head();
        let payload = head.get(DMA_HDR_LEN..).unwrap_or(&[]);
        let action = self
            .profiles
            .match_packet(pkt.meta.port_di, pkt.meta.reason, payload)
            .unwrap_or(Action::NetDevice);
        self.router.dispatch(&action, pkt, c);
    }

    fn tx_bottom_half(self: Arc<Self>, id: ChannelId) {
        let Some(chan) = self.arena.tx(id) else {
            return;
        };
        chan.work().begin();
        if chan.is_closing() {
            return;
        }
        let (packets, bytes) = self.router.tx().reclaim(id);
        trace!(channel = id, packets, bytes, "tx reclaimed");
        let faulted = chan
            .lock()
            .as_ref()
            .is_some_and(|r| r.state() == ChannelState::Faulted);
        if faulted {
            debug!(channel = id, "tx channel faulted, left masked");
        } else {
            self.dev.unmask_channel_irq(id);
        }
    }

    fn rx_channel(&self, ch: ChannelId) -> Result<&Arc<Channel<RxState>>> {
        self.arena.rx(ch).ok_or(Error::InvalidChannel(ch))
    }

    fn reset_rx(&self, chan: &Channel<RxState>) -> Result<()> {
        let id = chan.id();
        self.dev.mask_channel_irq(id);
        let Some(mut st) = chan.quiesce() else {
            return Err(Error::NotReady);
        };
        let freed = st.ring.release_all();
        st.asm.reset();
        let restocked = stock_rx_ring(&self.pool, &mut st.ring, self.config.geometry.frag_size);
        if let Err(e) = restocked {
            // Keep the emptied ring so the channel can be reset again.
            chan.reopen(st);
            return Err(e);
        }
        self.dev.clear_error_irq(id);
        self.dev.unmask_error_irq(id);
        let started = self.rx_started.load(Ordering::Acquire);
        let armed = if started { st.ring.arm() } else { Ok(()) };
        chan.reopen(st);
        armed?;
        if started {
            self.dev.clear_channel_irq(id);
            self.dev.unmask_channel_irq(id);
        }
        info!(channel = id, freed, "rx channel reset");
        Ok(())
    }

    fn reset_tx(&self, chan: &Channel<RingChannel>) -> Result<()> {
        let id = chan.id();
        self.dev.mask_channel_irq(id);
        let Some(mut ring) = chan.quiesce() else {
            return Err(Error::NotReady);
        };
        let freed = ring.release_all();
        let armed = ring.arm();
        chan.reopen(ring);
        armed?;
        self.dev.clear_error_irq(id);
        self.dev.unmask_error_irq(id);
        self.dev.clear_channel_irq(id);
        self.dev.unmask_channel_irq(id);
        info!(channel = id, freed, "tx channel reset");
        Ok(())
    }
}

/// A running driver instance.
pub struct Knet {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Knet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Knet")
            .field("geometry", &self.shared.config.geometry)
            .field("rx_started", &self.shared.rx_started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Knet {
    pub fn builder() -> KnetBuilder {
        KnetBuilder::new()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// Interrupt entry point.
    pub fn handle_irq(&self) -> IrqStatus {
        self.shared.irq.dispatch(&self.shared)
    }

    /// DMA buffers currently alive (ring slots, open packets, queued consumers).
    pub fn buffers_outstanding(&self) -> usize {
        self.shared.pool.outstanding()
    }

    // --- RX control ---

    /// Enable every RX channel.
    pub fn start_rx(&self) -> Result<()> {
        for chan in self.shared.arena.rx_channels() {
            let id = chan.id();
            let state = match chan.lock().as_mut() {
                Some(st) => {
                    st.ring.arm()?;
                    Some(st.ring.state())
                }
                None => None,
            };
            self.shared.dev.unmask_error_irq(id);
            // A recovering channel is unmasked by its recovery task.
            if state != Some(ChannelState::RecoveryPending) {
                self.shared.dev.unmask_channel_irq(id);
            }
        }
        self.shared.rx_started.store(true, Ordering::Release);
        info!("rx started");
        Ok(())
    }

    /// Disable every RX channel. Ring-resident buffers stay stocked.
    pub fn stop_rx(&self) {
        self.shared.rx_started.store(false, Ordering::Release);
        for chan in self.shared.arena.rx_channels() {
            self.shared.dev.mask_channel_irq(chan.id());
            if let Some(st) = chan.lock().as_mut() {
                st.ring.disarm();
            }
        }
        info!("rx stopped");
    }

    pub fn is_rx_started(&self) -> bool {
        self.shared.rx_started.load(Ordering::Acquire)
    }

    // --- channels ---

    pub fn channel_counters(&self, ch: ChannelId) -> Result<ChannelCountersSnapshot> {
        self.shared
            .arena
            .counters(ch)
            .map(|c| c.snapshot())
            .ok_or(Error::InvalidChannel(ch))
    }

    pub fn clear_channel_counters(&self, ch: ChannelId) -> Result<()> {
        self.shared
            .arena
            .counters(ch)
            .map(|c| c.clear())
            .ok_or(Error::InvalidChannel(ch))
    }

    pub fn channel_info(&self, ch: ChannelId) -> Result<ChannelInfo> {
        let arena = &self.shared.arena;
        let kind = arena.kind(ch).ok_or(Error::InvalidChannel(ch))?;
        let mut info = ChannelInfo {
            id: ch,
            kind,
            state: None,
            capacity: 0,
            work_idx: 0,
            pop_idx: 0,
            in_flight: 0,
            recovering: false,
        };
        let fill = |info: &mut ChannelInfo, ring: &RingChannel| {
            info.state = Some(ring.state());
            info.capacity = ring.capacity();
            info.work_idx = ring.work_idx();
            info.pop_idx = ring.pop_idx();
            info.in_flight = ring.in_flight();
        };
        match kind {
            ChannelKind::Rx => {
                let chan = self.shared.rx_channel(ch)?;
                info.recovering = chan.is_recovering();
                if let Some(st) = chan.lock().as_ref() {
                    fill(&mut info, &st.ring);
                }
            }
            ChannelKind::Tx => {
                let chan = arena.tx(ch).ok_or(Error::InvalidChannel(ch))?;
                if let Some(ring) = chan.lock().as_ref() {
                    fill(&mut info, ring);
                }
            }
            ChannelKind::General => {}
        }
        Ok(info)
    }

    /// Quiesce a channel, free its ring-resident buffers and bring it back up.
    ///
    /// This is the only way out of the faulted state.
    pub fn reset_channel(&self, ch: ChannelId) -> Result<()> {
        match self.shared.arena.kind(ch) {
            Some(ChannelKind::Rx) => self.shared.reset_rx(self.shared.rx_channel(ch)?),
            Some(ChannelKind::Tx) => {
                let chan = self.shared.arena.tx(ch).ok_or(Error::InvalidChannel(ch))?;
                self.shared.reset_tx(chan)
            }
            _ => Err(Error::InvalidChannel(ch)),
        }
    }

    // --- reason counters ---

    /// Global `(packets, bytes)` of one reason code.
    pub fn reason_counters(&self, reason: u16) -> Result<(u64, u64)> {
        self.shared
            .reasons
            .get(reason)
            .ok_or(Error::InvalidArgument("reason out of range"))
    }

    /// Every reason code seen so far, as `(reason, packets, bytes)`.
    pub fn reason_counters_all(&self) -> Vec<(u16, u64, u64)> {
        self.shared.reasons.nonzero()
    }

    pub fn clear_reason_counters(&self) {
        self.shared.reasons.clear();
    }

    // --- interfaces ---

    pub fn create_netif(&self, name: &str, port_di: u32, mac: MacAddress) -> Result<u32> {
        self.shared.netifs.create(name, port_di, mac)
    }

    pub fn destroy_netif(&self, id: u32) -> Result<()> {
        self.shared.netifs.destroy(id)
    }

    pub fn set_netif(&self, id: u32, mac: Option<MacAddress>, port_di: Option<u32>) -> Result<()> {
        self.shared.netifs.set(id, mac, port_di)
    }

    pub fn netif(&self, id: u32) -> Result<NetifInfo> {
        self.shared.netifs.get(id).map(|n| n.info())
    }

    pub fn netifs(&self) -> Vec<NetifInfo> {
        self.shared.netifs.list()
    }

    pub fn set_netif_attrs(&self, id: u32, f: impl FnOnce(&mut IntfAttrs)) -> Result<IntfAttrs> {
        self.shared.netifs.set_attrs(id, f)
    }

    pub fn netif_counters(&self, id: u32) -> Result<NetifStatsSnapshot> {
        self.shared.netifs.get(id).map(|n| n.stats().snapshot())
    }

    pub fn clear_netif_counters(&self, id: u32) -> Result<()> {
        self.shared.netifs.get(id).map(|n| n.stats().clear())
    }

    /// Per-reason `(reason, packets, bytes)` delivered to one interface.
    pub fn netif_reason_counters(&self, id: u32) -> Result<Vec<(u16, u64, u64)>> {
        self.shared.netifs.get(id).map(|n| n.reasons().nonzero())
    }

    pub fn clear_netif_reason_counters(&self, id: u32) -> Result<()> {
        self.shared.netifs.get(id).map(|n| n.reasons().clear())
    }

    /// Bind `(slice, port)` to a logical port.
    pub fn bind_port(&self, slice: u32, port: u32, port_di: u32) -> Result<()> {
        self.shared.netifs.bind_port(slice, port, port_di)
    }

    /// Transmit a frame handed down by the host stack on interface `id`.
    pub fn netif_transmit(&self, id: u32, frame: &[u8]) -> Result<()> {
        let netif = self.shared.netifs.get(id)?;
        self.shared.router.netif_transmit(&netif, frame, None)?;
        Ok(())
    }

    // --- profiles ---

    pub fn create_profile(&self, spec: ProfileSpec) -> Result<u32> {
        self.shared.profiles.create(spec)
    }

    pub fn destroy_profile(&self, id: u32) -> Result<()> {
        self.shared.profiles.destroy(id).map(|_| ())
    }

    pub fn profile(&self, id: u32) -> Result<Arc<ProfileRule>> {
        self.shared.profiles.get(id)
    }

    /// Rules in match order.
    pub fn profiles(&self) -> Vec<Arc<ProfileRule>> {
        self.shared.profiles.list()
    }

    // --- netlink ---

    pub fn create_netlink(&self, family: &str, groups: &[&str]) -> Result<u32> {
        self.shared.netlinks.create(family, groups)
    }

    pub fn destroy_netlink(&self, id: u32) -> Result<()> {
        self.shared.netlinks.destroy(id)
    }

    pub fn netlink(&self, id: u32) -> Result<NetlinkInfo> {
        self.shared.netlinks.get(id)
    }

    pub fn netlinks(&self) -> Vec<NetlinkInfo> {
        self.shared.netlinks.list()
    }

    pub fn netlink_counters(&self) -> NetlinkCountersSnapshot {
        self.shared.netlinks.counters().snapshot()
    }

    // --- SDK raw path ---

    /// Wait for a packet routed to the SDK queue.
    ///
    /// Returns the fragments as received, device header included. `None` waits the
    /// configured default.
    pub fn sdk_receive(&self, timeout: Option<Duration>) -> Result<Vec<Bytes>> {
        let wait = timeout.unwrap_or(self.shared.config.sdk_wait);
        let pkt = self.shared.sdk.dequeue_timeout(wait).ok_or(Error::TimedOut)?;
        Ok(pkt
            .frags()
            .iter()
            .map(|f| Bytes::copy_from_slice(f.data()))
            .collect())
    }

    /// Send a frame whose device header the caller built, as a list of fragments.
    pub fn sdk_send(&self, ch: ChannelId, frags: &[&[u8]]) -> Result<()> {
        if frags.is_empty() {
            return Err(Error::InvalidArgument("no fragments"));
        }
        if frags.len() > MAX_FRAGS {
            return Err(Error::InvalidArgument("too many fragments"));
        }
        if self.shared.arena.tx(ch).is_none() {
            return Err(Error::InvalidChannel(ch));
        }
        self.shared.router.tx().transmit_frags(ch, frags)?;
        Ok(())
    }

    pub fn sdk_queue_len(&self) -> usize {
        self.shared.sdk.len()
    }

    pub fn sdk_queue_counters(&self) -> SdkQueueCountersSnapshot {
        self.shared.sdk.counters().snapshot()
    }

    pub fn clear_sdk_queue_counters(&self) {
        self.shared.sdk.counters().clear();
    }

    // --- fast-forward and MOD ---

    pub fn set_ifa_config(&self, cfg: IfaConfig) {
        debug!(ip_protocol = cfg.ip_protocol, node_id = cfg.node_id, "ifa config updated");
        self.shared.router.set_ifa_config(cfg);
    }

    pub fn ifa_config(&self) -> IfaConfig {
        self.shared.router.ifa_config()
    }

    /// Destination MAC written into MOD copies. The default MAC turns the rewrite off.
    pub fn set_mod_dmac(&self, mac: MacAddress) {
        let rewrite = (mac != MOD_DEFAULT_DMAC).then_some(mac);
        self.shared.mod_dmac.store(Arc::new(rewrite));
    }

    pub fn mod_dmac(&self) -> MacAddress {
        self.shared.mod_dmac.load().unwrap_or(MOD_DEFAULT_DMAC)
    }

    pub fn dispatch_counters(&self) -> DispatchCountersSnapshot {
        self.shared.router.counters().snapshot()
    }

    /// Stop every channel and free all ring-resident and queued buffers.
    ///
    /// Running deferred units finish first; later ones and recovery tasks see the channel
    /// closed and return.
    pub fn shutdown(&self) {
        let s = &self.shared;
        s.rx_started.store(false, Ordering::Release);
        s.dev.mask_all();
        let mut freed = 0;
        for chan in s.arena.rx_channels() {
            s.dev.mask_channel_irq(chan.id());
            if let Some(mut st) = chan.quiesce() {
                freed += st.ring.release_all();
                st.asm.reset();
            }
        }
        for chan in s.arena.tx_channels() {
            s.dev.mask_channel_irq(chan.id());
            if let Some(mut ring) = chan.quiesce() {
                freed += ring.release_all();
            }
        }
        let queued = s.sdk.drain();
        if freed > 0 || queued > 0 {
            info!(freed, queued, "knet shut down");
        }
    }
}

impl Drop for Knet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
