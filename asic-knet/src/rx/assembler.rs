// Fragment reassembly
//
// Per channel: Idle -> Accumulating -> (complete) -> Idle.
// Fragments arrive in strict ring order, so a packet never interleaves with another one
// on the same channel.

use arrayvec::ArrayVec;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use super::meta::RxMeta;
use crate::api::hw::ChannelId;
use crate::dma::DmaBuffer;

/// Most fragments one packet may span.
pub const MAX_FRAGS: usize = 16;

/// Reaction to a start-of-packet fragment arriving while a packet is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SopPolicy {
    /// Drop the partial packet and start a new one at the offending fragment.
    #[default]
    Restart,
    /// Drop the partial packet and the offending fragment, then discard until the next
    /// end-of-packet so reassembly resumes on a clean boundary.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmState {
    Idle,
    Accumulating,
    /// Discarding until the next end-of-packet.
    Skipping,
}

/// A received packet: one or more fragment buffers plus extracted metadata.
#[derive(Debug)]
pub struct RxPacket {
    channel: ChannelId,
    frags: ArrayVec<DmaBuffer, MAX_FRAGS>,
    len: usize,
    complete: bool,
    pub meta: RxMeta,
}

impl RxPacket {
    fn start(channel: ChannelId, frag: DmaBuffer) -> Self {
        let mut frags = ArrayVec::new();
        let len = frag.len();
        frags.push(frag);
        Self {
            channel,
            frags,
            len,
            complete: false,
            meta: RxMeta::default(),
        }
    }

    /// Build a complete packet from buffers that did not come off a ring.
    pub fn from_frags(channel: ChannelId, frags: impl IntoIterator<Item = DmaBuffer>) -> Self {
        let frags: ArrayVec<DmaBuffer, MAX_FRAGS> = frags.into_iter().take(MAX_FRAGS).collect();
        let len = frags.iter().map(DmaBuffer::len).sum();
        Self {
            channel,
            frags,
            len,
            complete: true,
            meta: RxMeta::default(),
        }
    }

    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Sum of all fragment lengths.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[inline]
    pub fn frags(&self) -> &[DmaBuffer] {
        &self.frags
    }

    #[inline]
    pub fn frags_mut(&mut self) -> &mut [DmaBuffer] {
        &mut self.frags
    }

    pub fn into_frags(self) -> ArrayVec<DmaBuffer, MAX_FRAGS> {
        self.frags
    }

    /// Data of the first fragment. Carries the device header.
    pub fn head(&self) -> &[u8] {
        self.frags.first().map_or(&[], |f| f.data())
    }

    /// Copy `range` of the logical packet into `dst`.
    pub fn copy_range_into(&self, mut offset: usize, mut len: usize, dst: &mut BytesMut) {
        for frag in &self.frags {
            if len == 0 {
                break;
            }
            let data = frag.data();
            if offset >= data.len() {
                offset -= data.len();
                continue;
            }
            let take = (data.len() - offset).min(len);
            dst.put_slice(&data[offset..offset + take]);
            offset = 0;
            len -= take;
        }
    }

    /// Contiguous copy of the whole packet.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        self.copy_range_into(0, self.len, &mut out);
        out.freeze()
    }

    fn push(&mut self, frag: DmaBuffer) -> Result<(), DmaBuffer> {
        let len = frag.len();
        self.frags.try_push(frag).map_err(|e| e.element())?;
        self.len += len;
        Ok(())
    }
}

/// Result of feeding one fragment.
#[derive(Debug, Default)]
pub struct Pushed {
    /// Set when the fragment completed a packet.
    pub packet: Option<RxPacket>,
    /// Partial packets or stray fragments dropped by this step.
    pub errors: u32,
}

/// Per-channel reassembly state machine.
#[derive(Debug)]
pub struct RxAssembler {
    channel: ChannelId,
    policy: SopPolicy,
    max_len: usize,
    state: AsmState,
    cur: Option<RxPacket>,
}

impl RxAssembler {
    pub fn new(channel: ChannelId, policy: SopPolicy, max_len: usize) -> Self {
        Self {
            channel,
            policy,
            max_len,
            state: AsmState::Idle,
            cur: None,
        }
    }

    #[inline]
    pub fn state(&self) -> AsmState {
        self.state
    }

    #[inline]
    pub fn policy(&self) -> SopPolicy {
        self.policy
    }

    /// Drop any open packet and return to Idle.
    pub fn reset(&mut self) {
        self.cur = None;
        self.state = AsmState::Idle;
    }

    /// Feed one completed fragment in ring order.
    pub fn push(&mut self, sop: bool, eop: bool, frag: DmaBuffer) -> Pushed {
        let mut out = Pushed::default();
        match self.state {
            AsmState::Idle => {
                if !sop {
                    trace!(channel = self.channel, len = frag.len(), "fragment without start of packet");
                    out.errors += 1;
                    if !eop {
                        self.state = AsmState::Skipping;
                    }
                    return out;
                }
                self.open(frag, eop, &mut out);
            }
            AsmState::Accumulating => {
                if sop {
                    debug!(channel = self.channel, policy = ?self.policy, "start of packet inside open packet");
                    self.cur = None;
                    out.errors += 1;
                    match self.policy {
                        SopPolicy::Restart => self.open(frag, eop, &mut out),
                        SopPolicy::Strict => {
                            self.state = if eop { AsmState::Idle } else { AsmState::Skipping };
                        }
                    }
                    return out;
                }
                self.append(frag, eop, &mut out);
            }
            AsmState::Skipping => {
                if eop {
                    self.state = AsmState::Idle;
                }
            }
        }
        out
    }

    fn open(&mut self, frag: DmaBuffer, eop: bool, out: &mut Pushed) {
        let pkt = RxPacket::start(self.channel, frag);
        if pkt.len > self.max_len {
            out.errors += 1;
            self.state = if eop { AsmState::Idle } else { AsmState::Skipping };
            return;
        }
        self.cur = Some(pkt);
        self.state = AsmState::Accumulating;
        if eop {
            self.finish(out);
        }
    }

    fn append(&mut self, frag: DmaBuffer, eop: bool, out: &mut Pushed) {
        let Some(pkt) = self.cur.as_mut() else {
            self.state = AsmState::Idle;
            return;
        };
        let overflow = pkt.len + frag.len() > self.max_len || pkt.push(frag).is_err();
        if overflow {
            debug!(channel = self.channel, len = pkt.len, "packet exceeds reassembly limit");
            self.cur = None;
            out.errors += 1;
            self.state = if eop { AsmState::Idle } else { AsmState::Skipping };
            return;
        }
        if eop {
            self.finish(out);
        }
    }

    fn finish(&mut self, out: &mut Pushed) {
        if let Some(mut pkt) = self.cur.take() {
            pkt.complete = true;
            out.packet = Some(pkt);
        }
        self.state = AsmState::Idle;
    }
}
