//! Logical network interfaces and the physical-to-logical port map.
//!
//! Each interface is bound to one logical port (`port_di`) and registered with the host
//! network stack through [`NetStack`]. The data path looks interfaces up by `port_di`
//! and resolves `(slice, port)` pairs through the [`PortMap`]; both lookups are single
//! atomic loads (`arc-swap`), while control-plane writers serialize on a mutex and
//! publish copy-on-write snapshots.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::{ArcSwap, Guard};
use bytes::Bytes;
use tracing::{debug, info};

use crate::api::{BoxError, Error, Result};
use crate::config::{ChipGeometry, NAME_LEN};
use crate::dma::channel::counter_set;
use crate::idmap::IdBitmap;
use crate::rx::ReasonCounters;

/// A MAC address (6 bytes).
pub type MacAddress = [u8; 6];

/// The host network stack, seen from the driver.
pub trait NetStack: Send + Sync {
    /// Create the host-side device. Returns its interface index.
    fn register(&self, name: &str, mac: MacAddress) -> std::result::Result<u32, BoxError>;

    fn unregister(&self, ifindex: u32);

    /// Ingress delivery of a complete Ethernet frame. Must not block.
    fn receive(&self, ifindex: u32, frame: Bytes);
}

/// VLAN tag handling on delivery to the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VlanPolicy {
    /// Deliver untagged.
    #[default]
    Strip,
    /// Insert the tag reported by the device.
    Keep,
    /// Deliver the frame as it arrived.
    Original,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpeed {
    G1,
    G10,
    G25,
    G40,
    G50,
    G100,
    G200,
    G400,
    G800,
}

impl LinkSpeed {
    pub fn mbps(self) -> u32 {
        match self {
            LinkSpeed::G1 => 1_000,
            LinkSpeed::G10 => 10_000,
            LinkSpeed::G25 => 25_000,
            LinkSpeed::G40 => 40_000,
            LinkSpeed::G50 => 50_000,
            LinkSpeed::G100 => 100_000,
            LinkSpeed::G200 => 200_000,
            LinkSpeed::G400 => 400_000,
            LinkSpeed::G800 => 800_000,
        }
    }
}

/// Per-interface settings read by the data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntfAttrs {
    pub speed: Option<LinkSpeed>,
    pub oper_up: bool,
    pub vlan_policy: VlanPolicy,
    pub igr_sample_rate: u32,
    pub egr_sample_rate: u32,
    pub skip_port_state_event: bool,
    /// Traffic class used for frames the stack transmits.
    pub tc: u8,
}

counter_set!(
    /// Per-interface statistics.
    NetifStats, NetifStatsSnapshot {
        rx_packets,
        rx_bytes,
        rx_errors,
        rx_dropped,
        tx_packets,
        tx_bytes,
        tx_errors,
        tx_dropped,
        tx_fifo_errors,
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    port_di: u32,
    mac: MacAddress,
}

/// A logical network interface.
pub struct Netif {
    id: u32,
    name: String,
    ifindex: u32,
    binding: ArcSwap<Binding>,
    attrs: ArcSwap<IntfAttrs>,
    stats: NetifStats,
    reasons: ReasonCounters,
}

impl fmt::Debug for Netif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netif")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ifindex", &self.ifindex)
            .field("port_di", &self.port_di())
            .finish()
    }
}

impl Netif {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    #[inline]
    pub fn port_di(&self) -> u32 {
        self.binding.load().port_di
    }

    #[inline]
    pub fn mac(&self) -> MacAddress {
        self.binding.load().mac
    }

    #[inline]
    pub fn attrs(&self) -> IntfAttrs {
        **self.attrs.load()
    }

    #[inline]
    pub fn stats(&self) -> &NetifStats {
        &self.stats
    }

    #[inline]
    pub fn reasons(&self) -> &ReasonCounters {
        &self.reasons
    }

    /// Snapshot for the control plane.
    pub fn info(&self) -> NetifInfo {
        let b = self.binding.load();
        NetifInfo {
            id: self.id,
            name: self.name.clone(),
            ifindex: self.ifindex,
            port_di: b.port_di,
            mac: b.mac,
            attrs: self.attrs(),
        }
    }
}

/// Control-plane view of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetifInfo {
    pub id: u32,
    pub name: String,
    pub ifindex: u32,
    pub port_di: u32,
    pub mac: MacAddress,
    pub attrs: IntfAttrs,
}

/// `(slice, port-within-slice)` to logical port bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    slices: u32,
    ports_per_slice: u32,
    port_di_max: u32,
    map: Box<[u32]>,
}

impl PortMap {
    const UNBOUND: u32 = u32::MAX;

    pub fn new(geometry: &ChipGeometry) -> Self {
        Self {
            slices: geometry.slices,
            ports_per_slice: geometry.ports_per_slice,
            port_di_max: geometry.port_di_max,
            map: vec![Self::UNBOUND; (geometry.slices * geometry.ports_per_slice) as usize]
                .into_boxed_slice(),
        }
    }

    /// Copy with `(slice, port)` bound to `port_di`.
    pub fn with_binding(&self, slice: u32, port: u32, port_di: u32) -> Result<Self> {
        if slice >= self.slices || port >= self.ports_per_slice {
            return Err(Error::InvalidPort(port));
        }
        if port_di >= self.port_di_max {
            return Err(Error::InvalidPort(port_di));
        }
        let mut next = self.clone();
        next.map[(slice * self.ports_per_slice + port) as usize] = port_di;
        Ok(next)
    }

    #[inline]
    pub fn lookup(&self, slice: u32, port: u32) -> Option<u32> {
        if slice >= self.slices || port >= self.ports_per_slice {
            return None;
        }
        let di = self.map[(slice * self.ports_per_slice + port) as usize];
        (di != Self::UNBOUND).then_some(di)
    }
}

struct Writer {
    ids: IdBitmap,
    list: Vec<Arc<Netif>>,
}

/// All logical interfaces of one device.
pub struct NetifTable {
    port_di_max: u32,
    stack: Arc<dyn NetStack>,
    writer: Mutex<Writer>,
    by_port: ArcSwap<Vec<Option<Arc<Netif>>>>,
    ports: ArcSwap<PortMap>,
}

impl fmt::Debug for NetifTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetifTable")
            .field("port_di_max", &self.port_di_max)
            .finish_non_exhaustive()
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty name"));
    }
    if name.len() >= NAME_LEN {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

impl NetifTable {
    pub fn new(geometry: &ChipGeometry, max_netifs: u32, stack: Arc<dyn NetStack>) -> Self {
        Self {
            port_di_max: geometry.port_di_max,
            stack,
            writer: Mutex::new(Writer {
                ids: IdBitmap::new(max_netifs),
                list: Vec::new(),
            }),
            by_port: ArcSwap::from_pointee(vec![None; geometry.port_di_max as usize]),
            ports: ArcSwap::from_pointee(PortMap::new(geometry)),
        }
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, w: &Writer) {
        let mut index = vec![None; self.port_di_max as usize];
        for netif in &w.list {
            if let Some(slot) = index.get_mut(netif.port_di() as usize) {
                *slot = Some(netif.clone());
            }
        }
        self.by_port.store(Arc::new(index));
    }

    /// Create an interface bound to `port_di`. Returns its id.
    pub fn create(&self, name: &str, port_di: u32, mac: MacAddress) -> Result<u32> {
        check_name(name)?;
        if port_di >= self.port_di_max {
            return Err(Error::InvalidPort(port_di));
        }
        let mut w = self.writer();
        if w.list.iter().any(|n| n.name == name || n.port_di() == port_di) {
            return Err(Error::Exists);
        }
        let id = w.ids.alloc().ok_or(Error::TableFull)?;
        let ifindex = match self.stack.register(name, mac) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                w.ids.release(id);
                return Err(Error::Registration(e));
            }
        };
        w.list.push(Arc::new(Netif {
            id,
            name: name.to_owned(),
            ifindex,
            binding: ArcSwap::from_pointee(Binding { port_di, mac }),
            attrs: ArcSwap::from_pointee(IntfAttrs::default()),
            stats: NetifStats::default(),
            reasons: ReasonCounters::default(),
        }));
        self.publish(&w);
        info!(id, name, port_di, ifindex, "netif created");
        Ok(id)
    }

    pub fn destroy(&self, id: u32) -> Result<()> {
        let mut w = self.writer();
        let pos = w.list.iter().position(|n| n.id == id).ok_or(Error::NotFound)?;
        let netif = w.list.remove(pos);
        w.ids.release(id);
        self.publish(&w);
        drop(w);
        self.stack.unregister(netif.ifindex);
        info!(id, name = %netif.name, "netif destroyed");
        Ok(())
    }

    /// Change the MAC address and/or the bound logical port.
    pub fn set(&self, id: u32, mac: Option<MacAddress>, port_di: Option<u32>) -> Result<()> {
        if let Some(di) = port_di {
            if di >= self.port_di_max {
                return Err(Error::InvalidPort(di));
            }
        }
        let w = self.writer();
        let netif = w.list.iter().find(|n| n.id == id).ok_or(Error::NotFound)?.clone();
        if let Some(di) = port_di {
            if w.list.iter().any(|n| n.id != id && n.port_di() == di) {
                return Err(Error::Exists);
            }
        }
        let cur = **netif.binding.load();
        netif.binding.store(Arc::new(Binding {
            port_di: port_di.unwrap_or(cur.port_di),
            mac: mac.unwrap_or(cur.mac),
        }));
        self.publish(&w);
        debug!(id, port_di = netif.port_di(), "netif updated");
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<Arc<Netif>> {
        self.writer()
            .list
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub fn list(&self) -> Vec<NetifInfo> {
        let mut out: Vec<_> = self.writer().list.iter().map(|n| n.info()).collect();
        out.sort_by_key(|n| n.id);
        out
    }

    /// Update interface attributes in place.
    pub fn set_attrs(&self, id: u32, f: impl FnOnce(&mut IntfAttrs)) -> Result<IntfAttrs> {
        let w = self.writer();
        let netif = w.list.iter().find(|n| n.id == id).ok_or(Error::NotFound)?;
        let mut attrs = netif.attrs();
        f(&mut attrs);
        netif.attrs.store(Arc::new(attrs));
        Ok(attrs)
    }

    /// Interface bound to `port_di`. Lock-free.
    #[inline]
    pub fn by_port(&self, port_di: u32) -> Option<Arc<Netif>> {
        self.by_port.load().get(port_di as usize).cloned().flatten()
    }

    /// Interface with host interface index `ifindex`.
    pub fn by_ifindex(&self, ifindex: u32) -> Option<Arc<Netif>> {
        self.by_port
            .load()
            .iter()
            .flatten()
            .find(|n| n.ifindex == ifindex)
            .cloned()
    }

    /// Bind `(slice, port)` to `port_di` for ingress resolution.
    pub fn bind_port(&self, slice: u32, port: u32, port_di: u32) -> Result<()> {
        let _w = self.writer();
        let next = self.ports.load().with_binding(slice, port, port_di)?;
        self.ports.store(Arc::new(next));
        debug!(slice, port, port_di, "port bound");
        Ok(())
    }

    #[inline]
    pub fn port_map(&self) -> Guard<Arc<PortMap>> {
        self.ports.load()
    }

    pub(crate) fn stack(&self) -> &Arc<dyn NetStack> {
        &self.stack
    }
}
