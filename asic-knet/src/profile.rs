//! Classification rules.
//!
//! A [`ProfileTable`] is an ordered list of rules, lowest priority value first. Matching
//! walks the list under a shared lock and returns the action of the first rule whose
//! reason, port and byte patterns all match. Without a match the caller delivers to the
//! network device.
//!
//! # Example
//!
//! ```
//! use asic_knet::profile::{Action, PortMatch, ProfileSpec, ProfileTable, ReasonMatch};
//!
//! let table = ProfileTable::new(16);
//! let drop5 = ProfileSpec::new("drop5", 0, Action::Drop).reason(ReasonMatch::only(&[5]));
//! table.create(drop5).unwrap();
//! table
//!     .create(ProfileSpec::new("all", 10, Action::NetDevice).port(PortMatch::Any))
//!     .unwrap();
//!
//! assert_eq!(table.match_packet(3, 5, &[]), Some(Action::Drop));
//! assert_eq!(table.match_packet(3, 7, &[]), Some(Action::NetDevice));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::api::{Error, Result};
use crate::config::{NAME_LEN, REASON_MAX};
use crate::idmap::IdBitmap;

/// Byte matchers per rule.
pub const MAX_PATTERNS: usize = 4;
/// Bytes compared by one matcher.
pub const PATTERN_LEN: usize = 8;

/// Set of reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReasonBitmap([u64; REASON_MAX / 64]);

impl ReasonBitmap {
    pub fn insert(&mut self, reason: u16) -> bool {
        let r = reason as usize;
        if r >= REASON_MAX {
            return false;
        }
        self.0[r / 64] |= 1 << (r % 64);
        true
    }

    #[inline]
    pub fn contains(&self, reason: u16) -> bool {
        let r = reason as usize;
        r < REASON_MAX && self.0[r / 64] & (1 << (r % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..REASON_MAX as u16).filter(|r| self.contains(*r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasonMatch {
    #[default]
    Any,
    Set(ReasonBitmap),
}

impl ReasonMatch {
    /// Match exactly the listed reasons. Codes past the reason space are ignored.
    pub fn only(reasons: &[u16]) -> Self {
        let mut set = ReasonBitmap::default();
        for r in reasons {
            set.insert(*r);
        }
        ReasonMatch::Set(set)
    }

    #[inline]
    fn matches(&self, reason: u16) -> bool {
        match self {
            ReasonMatch::Any => true,
            ReasonMatch::Set(set) => set.contains(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortMatch {
    #[default]
    Any,
    Exact(u32),
}

/// `payload[offset..offset + len] & mask == pattern & mask`, where `len` runs up to the
/// last non-zero mask byte. The offset is relative to the frame after the device header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BytePattern {
    pub offset: u8,
    pub pattern: [u8; PATTERN_LEN],
    pub mask: [u8; PATTERN_LEN],
}

impl BytePattern {
    pub fn new(offset: u8, pattern: [u8; PATTERN_LEN], mask: [u8; PATTERN_LEN]) -> Self {
        Self {
            offset,
            pattern,
            mask,
        }
    }

    /// Compared length; zero for an all-zero mask.
    pub fn len(&self) -> usize {
        self.mask.iter().rposition(|m| *m != 0).map_or(0, |i| i + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` when the pattern reaches past the payload.
    fn matches(&self, payload: &[u8]) -> Option<bool> {
        let len = self.len();
        let start = self.offset as usize;
        let window = payload.get(start..start + len)?;
        Some(
            window
                .iter()
                .zip(self.pattern.iter().zip(self.mask.iter()))
                .all(|(b, (p, m))| b & m == p & m),
        )
    }
}

/// Broadcast destination of a netlink rule, resolved by name at dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkTarget {
    pub family: Arc<str>,
    pub group: Arc<str>,
}

impl NetlinkTarget {
    pub fn new(family: &str, group: &str) -> Self {
        Self {
            family: family.into(),
            group: group.into(),
        }
    }
}

/// What to do with a matched packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    NetDevice,
    Netlink(NetlinkTarget),
    SdkQueue,
    FastForward,
    Drop,
}

/// Rule parameters supplied by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    pub name: String,
    /// Lower values win.
    pub priority: u32,
    pub reason: ReasonMatch,
    pub port: PortMatch,
    /// At most [`MAX_PATTERNS`], all of which must match.
    pub patterns: Vec<BytePattern>,
    pub action: Action,
}

impl ProfileSpec {
    pub fn new(name: impl Into<String>, priority: u32, action: Action) -> Self {
        Self {
            name: name.into(),
            priority,
            reason: ReasonMatch::Any,
            port: PortMatch::Any,
            patterns: Vec::new(),
            action,
        }
    }

    pub fn reason(mut self, reason: ReasonMatch) -> Self {
        self.reason = reason;
        self
    }

    pub fn port(mut self, port: PortMatch) -> Self {
        self.port = port;
        self
    }

    /// Add a byte matcher. More than [`MAX_PATTERNS`] is rejected at create.
    pub fn pattern(mut self, p: BytePattern) -> Self {
        self.patterns.push(p);
        self
    }
}

/// An installed rule.
#[derive(Debug)]
pub struct ProfileRule {
    pub id: u32,
    pub spec: ProfileSpec,
    hits: AtomicU64,
}

impl ProfileRule {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// `None` when a pattern reached past the payload.
    fn matches(&self, port: u32, reason: u16, payload: &[u8]) -> Option<bool> {
        if !self.spec.reason.matches(reason) {
            return Some(false);
        }
        if let PortMatch::Exact(p) = self.spec.port {
            if p != port {
                return Some(false);
            }
        }
        for pat in self.spec.patterns.iter().filter(|p| !p.is_empty()) {
            if !pat.matches(payload)? {
                return Some(false);
            }
        }
        Some(true)
    }
}

#[derive(Debug)]
struct Inner {
    rules: Vec<Arc<ProfileRule>>,
    ids: IdBitmap,
}

/// Priority-ordered rule list.
#[derive(Debug)]
pub struct ProfileTable {
    inner: RwLock<Inner>,
    out_of_bounds: AtomicU64,
}

impl ProfileTable {
    pub fn new(max_rules: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: Vec::new(),
                ids: IdBitmap::new(max_rules),
            }),
            out_of_bounds: AtomicU64::new(0),
        }
    }

    /// Install a rule. Returns its id, the lowest free one.
    pub fn create(&self, spec: ProfileSpec) -> Result<u32> {
        if spec.name.is_empty() {
            return Err(Error::InvalidArgument("profile name"));
        }
        if spec.name.len() >= NAME_LEN {
            return Err(Error::NameTooLong);
        }
        if spec.patterns.len() > MAX_PATTERNS {
            return Err(Error::InvalidArgument("too many byte patterns"));
        }
        if let Action::Netlink(t) = &spec.action {
            if t.family.is_empty() || t.group.is_empty() {
                return Err(Error::InvalidArgument("netlink target"));
            }
            if t.family.len() >= NAME_LEN || t.group.len() >= NAME_LEN {
                return Err(Error::NameTooLong);
            }
        }
        if let ReasonMatch::Set(set) = &spec.reason {
            if set.is_empty() {
                return Err(Error::InvalidArgument("empty reason set"));
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.rules.iter().any(|r| r.spec.name == spec.name) {
            return Err(Error::Exists);
        }
        let id = inner.ids.alloc().ok_or(Error::TableFull)?;
        let pos = inner
            .rules
            .iter()
            .position(|r| r.spec.priority > spec.priority)
            .unwrap_or(inner.rules.len());
        debug!(id, name = %spec.name, priority = spec.priority, action = ?spec.action, "profile created");
        inner.rules.insert(
            pos,
            Arc::new(ProfileRule {
                id,
                spec,
                hits: AtomicU64::new(0),
            }),
        );
        Ok(id)
    }

    pub fn destroy(&self, id: u32) -> Result<Arc<ProfileRule>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let pos = inner
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::NotFound)?;
        let rule = inner.rules.remove(pos);
        inner.ids.release(id);
        debug!(id, name = %rule.spec.name, "profile destroyed");
        Ok(rule)
    }

    pub fn get(&self, id: u32) -> Result<Arc<ProfileRule>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Rules in match order.
    pub fn list(&self) -> Vec<Arc<ProfileRule>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.rules.clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Action of the first matching rule.
    ///
    /// `payload` is the frame after the device header. A pattern reaching past it makes
    /// its rule fail and is counted in [`out_of_bounds`](Self::out_of_bounds).
    pub fn match_packet(&self, port: u32, reason: u16, payload: &[u8]) -> Option<Action> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        for rule in &inner.rules {
            match rule.matches(port, reason, payload) {
                Some(true) => {
                    rule.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(rule.spec.action.clone());
                }
                Some(false) => {}
                None => {
                    self.out_of_bounds.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        None
    }

    /// Pattern evaluations that reached past the packet.
    pub fn out_of_bounds(&self) -> u64 {
        self.out_of_bounds.load(Ordering::Relaxed)
    }
}
