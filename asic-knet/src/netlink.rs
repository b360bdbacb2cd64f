//! Netlink broadcast channels.
//!
//! A channel is a named broadcast family with one or more named multicast groups.
//! Families are registered with the host broadcast facility ([`BroadcastSink`]) when
//! created and resolved by name for every forwarded packet, so the read side is a
//! lock-free snapshot and writers serialize on a mutex.
//!
//! Forwarded packets are encoded as a flat list of attributes
//! (`{len: u16, type: u16, value, pad to 4}`, native byte order) chosen by reason code:
//!
//! - ingress/egress sample: `IIFINDEX`, `OIFINDEX`, `ORIGSIZE`, `SAMPLE_GROUP`,
//!   `GROUP_SEQ`, `SAMPLE_RATE`, `DATA`
//! - mirror-on-drop: `IGR_PORT`, `DATA`
//! - anything else: `DATA`

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::api::{BoxError, Error, Result};
use crate::config::NAME_LEN;
use crate::dma::channel::counter_set;
use crate::idmap::IdBitmap;
use crate::rx::reason;

/// Most groups one family may carry.
pub const MAX_GROUPS: usize = 32;

/// Attribute type ids of sample messages.
pub mod sample_attr {
    pub const IIFINDEX: u16 = 0;
    pub const OIFINDEX: u16 = 1;
    pub const ORIGSIZE: u16 = 2;
    pub const SAMPLE_GROUP: u16 = 3;
    pub const GROUP_SEQ: u16 = 4;
    pub const SAMPLE_RATE: u16 = 5;
    pub const DATA: u16 = 6;
}

/// Attribute type ids of mirror-on-drop messages.
pub mod mod_attr {
    pub const IGR_PORT: u16 = 0;
    pub const DATA: u16 = 1;
}

/// Host broadcast facility.
pub trait BroadcastSink: Send + Sync {
    fn register_family(&self, family: &str, groups: &[String]) -> std::result::Result<(), BoxError>;

    fn unregister_family(&self, family: &str);

    /// Multicast `msg` to `group` of `family`. Must not block.
    fn broadcast(&self, family: &str, group: &str, msg: Bytes) -> std::result::Result<(), BoxError>;
}

/// Sampling direction carried in `SAMPLE_GROUP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SampleDir {
    Other = 0,
    Ingress = 1,
    Egress = 2,
}

/// Message layout selected by reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sample(SampleDir),
    Mirror,
    Generic,
}

impl MessageKind {
    pub fn for_reason(r: u16) -> Self {
        match r {
            reason::INGRESS_SAMPLE => MessageKind::Sample(SampleDir::Ingress),
            reason::EGRESS_SAMPLE => MessageKind::Sample(SampleDir::Egress),
            reason::MOD => MessageKind::Mirror,
            _ => MessageKind::Generic,
        }
    }
}

/// Header fields of a sample message. `seq` is filled in by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleInfo {
    pub iifindex: u16,
    pub oifindex: u16,
    pub rate: u32,
}

/// Space taken by an attribute carrying `n` bytes.
#[inline]
pub const fn nla_total_size(n: usize) -> usize {
    (4 + n + 3) & !3
}

fn put_attr(buf: &mut BytesMut, ty: u16, value: &[u8]) {
    buf.put_slice(&((4 + value.len()) as u16).to_ne_bytes());
    buf.put_slice(&ty.to_ne_bytes());
    buf.put_slice(value);
    buf.put_bytes(0, nla_total_size(value.len()) - 4 - value.len());
}

fn put_data(buf: &mut BytesMut, ty: u16, frame: &[u8]) {
    let start = buf.len();
    put_attr(buf, ty, frame);
    debug_assert_eq!(buf.len() - start, nla_total_size(frame.len()));
}

/// A registered family.
pub struct NetlinkFamily {
    id: u32,
    name: String,
    groups: Vec<String>,
    seq: [AtomicU32; 3],
}

impl fmt::Debug for NetlinkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetlinkFamily")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("groups", &self.groups)
            .finish()
    }
}

impl NetlinkFamily {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Take the next sequence number of `dir`.
    fn next_seq(&self, dir: SampleDir) -> u32 {
        self.seq[dir as usize].fetch_add(1, Ordering::Relaxed)
    }
}

/// Control-plane view of a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkInfo {
    pub id: u32,
    pub family: String,
    pub groups: Vec<String>,
}

counter_set!(
    /// Netlink forwarding statistics.
    NetlinkCounters, NetlinkCountersSnapshot {
        sent,
        truncated,
        /// No family or group with the rule's name.
        no_target,
        send_errors,
    }
);

struct Writer {
    ids: IdBitmap,
}

/// Registry of broadcast families.
pub struct NetlinkRegistry {
    sink: Arc<dyn BroadcastSink>,
    writer: Mutex<Writer>,
    families: ArcSwap<Vec<Arc<NetlinkFamily>>>,
    max_msg: usize,
    counters: NetlinkCounters,
}

impl fmt::Debug for NetlinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetlinkRegistry")
            .field("families", &self.families.load().len())
            .field("max_msg", &self.max_msg)
            .finish()
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

impl NetlinkRegistry {
    pub fn new(sink: Arc<dyn BroadcastSink>, max_families: u32, max_msg: usize) -> Self {
        Self {
            sink,
            writer: Mutex::new(Writer {
                ids: IdBitmap::new(max_families),
            }),
            families: ArcSwap::from_pointee(Vec::new()),
            max_msg,
            counters: NetlinkCounters::default(),
        }
    }

    /// Register `family` with `groups`. Returns the channel id.
    pub fn create(&self, family: &str, groups: &[&str]) -> Result<u32> {
        check_name(family)?;
        if groups.is_empty() || groups.len() > MAX_GROUPS {
            return Err(Error::InvalidArgument("group count"));
        }
        for g in groups {
            check_name(g)?;
        }
        let mut w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.families.load_full();
        if current.iter().any(|f| f.name == family) {
            return Err(Error::Exists);
        }
        let id = w.ids.alloc().ok_or(Error::TableFull)?;
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        if let Err(e) = self.sink.register_family(family, &groups) {
            w.ids.release(id);
            return Err(Error::Registration(e));
        }
        let mut next = (*current).clone();
        next.push(Arc::new(NetlinkFamily {
            id,
            name: family.to_owned(),
            groups,
            seq: Default::default(),
        }));
        self.families.store(Arc::new(next));
        info!(id, family, "netlink family registered");
        Ok(id)
    }

    pub fn destroy(&self, id: u32) -> Result<()> {
        let mut w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.families.load_full();
        let fam = current
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or(Error::NotFound)?;
        let next: Vec<_> = current.iter().filter(|f| f.id != id).cloned().collect();
        self.families.store(Arc::new(next));
        w.ids.release(id);
        drop(w);
        self.sink.unregister_family(&fam.name);
        info!(id, family = %fam.name, "netlink family unregistered");
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<NetlinkInfo> {
        self.families
            .load()
            .iter()
            .find(|f| f.id == id)
            .map(|f| NetlinkInfo {
                id: f.id,
                family: f.name.clone(),
                groups: f.groups.clone(),
            })
            .ok_or(Error::NotFound)
    }

    pub fn list(&self) -> Vec<NetlinkInfo> {
        let mut out: Vec<_> = self
            .families
            .load()
            .iter()
            .map(|f| NetlinkInfo {
                id: f.id,
                family: f.name.clone(),
                groups: f.groups.clone(),
            })
            .collect();
        out.sort_by_key(|f| f.id);
        out
    }

    /// Find `family` carrying `group`.
    pub fn resolve(&self, family: &str, group: &str) -> Option<Arc<NetlinkFamily>> {
        self.families
            .load()
            .iter()
            .find(|f| f.name == family && f.groups.iter().any(|g| g == group))
            .cloned()
    }

    pub fn counters(&self) -> &NetlinkCounters {
        &self.counters
    }

    /// Encode one forwarded frame.
    ///
    /// `frame` is the packet without the device header. The payload attribute is cut so the
    /// message stays within the configured maximum size.
    pub fn encode(
        &self,
        fam: &NetlinkFamily,
        kind: MessageKind,
        sample: SampleInfo,
        igr_port: u32,
        frame: &[u8],
    ) -> Bytes {
        let (hdr, data_ty) = match kind {
            MessageKind::Sample(_) => (
                nla_total_size(2) * 2 + nla_total_size(4) * 4,
                sample_attr::DATA,
            ),
            MessageKind::Mirror => (nla_total_size(4), mod_attr::DATA),
            MessageKind::Generic => (0, sample_attr::DATA),
        };
        let mut data_len = frame.len();
        if hdr + nla_total_size(data_len) > self.max_msg {
            data_len = self.max_msg.saturating_sub(hdr + 8);
            self.counters.truncated.fetch_add(1, Ordering::Relaxed);
        }

        let mut buf = BytesMut::with_capacity(hdr + nla_total_size(data_len));
        match kind {
            MessageKind::Sample(dir) => {
                put_attr(&mut buf, sample_attr::IIFINDEX, &sample.iifindex.to_ne_bytes());
                put_attr(&mut buf, sample_attr::OIFINDEX, &sample.oifindex.to_ne_bytes());
                put_attr(&mut buf, sample_attr::ORIGSIZE, &(frame.len() as u32).to_ne_bytes());
                put_attr(&mut buf, sample_attr::SAMPLE_GROUP, &(dir as u32).to_ne_bytes());
                put_attr(&mut buf, sample_attr::GROUP_SEQ, &fam.next_seq(dir).to_ne_bytes());
                put_attr(&mut buf, sample_attr::SAMPLE_RATE, &sample.rate.to_ne_bytes());
            }
            MessageKind::Mirror => {
                put_attr(&mut buf, mod_attr::IGR_PORT, &igr_port.to_ne_bytes());
            }
            MessageKind::Generic => {}
        }
        put_data(&mut buf, data_ty, &frame[..data_len]);
        buf.freeze()
    }

    /// Hand a message to the sink. Failures are counted, never returned.
    pub fn broadcast(&self, fam: &NetlinkFamily, group: &str, msg: Bytes) {
        match self.sink.broadcast(&fam.name, group, msg) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(family = %fam.name, group, error = %e, "netlink broadcast failed");
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Walk an encoded message as `(type, value)` pairs.
pub fn attrs(msg: &[u8]) -> impl Iterator<Item = (u16, &[u8])> + '_ {
    let mut off = 0;
    std::iter::from_fn(move || {
        let hdr = msg.get(off..off + 4)?;
        let len = u16::from_ne_bytes([hdr[0], hdr[1]]) as usize;
        let ty = u16::from_ne_bytes([hdr[2], hdr[3]]);
        if len < 4 {
            return None;
        }
        let value = msg.get(off + 4..off + len)?;
        off += nla_total_size(len - 4);
        Some((ty, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullSink {
        sent: Mutex<Vec<(String, String, Bytes)>>,
    }

    impl BroadcastSink for NullSink {
        fn register_family(&self, family: &str, _groups: &[String]) -> std::result::Result<(), BoxError> {
            if family == "taken" {
                return Err("family exists in host".into());
            }
            Ok(())
        }
        fn unregister_family(&self, _family: &str) {}
        fn broadcast(&self, family: &str, group: &str, msg: Bytes) -> std::result::Result<(), BoxError> {
            self.sent
                .lock()
                .unwrap()
                .push((family.to_owned(), group.to_owned(), msg));
            Ok(())
        }
    }

    fn registry(max_msg: usize) -> NetlinkRegistry {
        NetlinkRegistry::new(Arc::new(NullSink::default()), 4, max_msg)
    }

    #[test]
    fn test_registry_lifecycle() {
        let r = registry(10200);
        assert_eq!(r.create("psample", &["packets"]).unwrap(), 0);
        assert!(matches!(r.create("psample", &["x"]), Err(Error::Exists)));
        assert!(matches!(r.create("other", &[]), Err(Error::InvalidArgument(_))));
        assert!(matches!(r.create("taken", &["g"]), Err(Error::Registration(_))));
        assert!(matches!(
            r.create("other", &["sixteen-chars-xx"]),
            Err(Error::NameTooLong)
        ));
        assert_eq!(r.create("mod", &["drops", "stats"]).unwrap(), 1);
        assert!(r.resolve("mod", "stats").is_some());
        assert!(r.resolve("mod", "nope").is_none());
        r.destroy(0).unwrap();
        assert!(r.resolve("psample", "packets").is_none());
        assert_eq!(r.list().len(), 1);
        assert!(matches!(r.get(0), Err(Error::NotFound)));
    }

    #[test]
    fn test_sample_encoding_and_seq() {
        let r = registry(10200);
        r.create("psample", &["packets"]).unwrap();
        let fam = r.resolve("psample", "packets").unwrap();
        let info = SampleInfo {
            iifindex: 7,
            oifindex: 9,
            rate: 4096,
        };
        let kind = MessageKind::for_reason(reason::INGRESS_SAMPLE);
        let m1 = r.encode(&fam, kind, info, 0, &[0xAA; 61]);
        let m2 = r.encode(&fam, kind, info, 0, &[0xAA; 61]);
        let e1 = r.encode(&fam, MessageKind::for_reason(reason::EGRESS_SAMPLE), info, 0, &[1]);

        let a1: Vec<_> = attrs(&m1).collect();
        assert_eq!(a1.len(), 7);
        assert_eq!(a1[0], (sample_attr::IIFINDEX, &7u16.to_ne_bytes()[..]));
        assert_eq!(a1[2].1, &61u32.to_ne_bytes());
        assert_eq!(a1[3].1, &1u32.to_ne_bytes());
        assert_eq!(a1[4].1, &0u32.to_ne_bytes());
        assert_eq!(a1[6].1.len(), 61);
        assert_eq!(m1.len() % 4, 0);

        let a2: Vec<_> = attrs(&m2).collect();
        assert_eq!(a2[4].1, &1u32.to_ne_bytes());
        let ae: Vec<_> = attrs(&e1).collect();
        assert_eq!(ae[3].1, &2u32.to_ne_bytes());
        assert_eq!(ae[4].1, &0u32.to_ne_bytes());
    }

    #[test]
    fn test_truncation() {
        let r = registry(256);
        r.create("mod", &["drops"]).unwrap();
        let fam = r.resolve("mod", "drops").unwrap();
        let msg = r.encode(&fam, MessageKind::Mirror, SampleInfo::default(), 17, &[0u8; 1000]);
        let a: Vec<_> = attrs(&msg).collect();
        assert_eq!(a[0], (mod_attr::IGR_PORT, &17u32.to_ne_bytes()[..]));
        assert_eq!(a[1].1.len(), 256 - 8 - 8);
        assert!(msg.len() <= 256);
        assert_eq!(r.counters().snapshot().truncated, 1);

        let small = r.encode(&fam, MessageKind::Generic, SampleInfo::default(), 0, &[1, 2, 3]);
        assert_eq!(attrs(&small).collect::<Vec<_>>(), vec![(sample_attr::DATA, &[1u8, 2, 3][..])]);
    }
}
