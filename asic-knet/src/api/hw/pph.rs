//! Packet-processing header (PPH).
//!
//! Forty bytes of metadata the ASIC places after the 12-byte EMAC prefix of every frame
//! crossing the CPU port. On the wire the header is ten 32-bit words in network order;
//! inside each word fields are packed from the least significant bit upwards:
//!
//! | word | bits (lsb first)                                                                 |
//! |------|----------------------------------------------------------------------------------|
//! | 0    | dst_idx_hi:9 hash_val:16 color:2 tc:3 fwd_op:2                                   |
//! | 1    | igr_acl_label_hi:10 skip_epp:1 src_idx:14 dst_idx_lo:7                           |
//! | 2    | mirror_bmap:8 skip_ipp:1 slice_id:3 die_id:1 port_num:6 pkt_journal:1 pcp_dei:4 tnl_uniform:1 dnt_modify:1 igr_acl_label_lo:6 |
//! | 3    | evpn_esi_hi:4 igr_is_fab:1 decap_act:3 src_bdi:14 cpu_reason:10                  |
//! | 4    | tnl_bd_hi:2 tnl_idx:13 mpls_pwcw_vld:1 evpn_esi_lo:16                            |
//! | 5    | tapping_push_o:1 src_vlan:12 pvlan_port_type:2 igr_vid_pop_num:3 ecn:2 ecn_enable:1 mpls_ctl:4 tnl_bd_lo:7 |
//! | 6    | reserved:31 tapping_push_t:1                                                     |
//! | 7    | ptp_info_hi:6 reserved:2 mac_learn_en:1 reserved:23                              |
//! | 8    | int_role:2 int_profile:3 int_mm_mode:1 ptp_info_lo:26                            |
//! | 9    | timestamp:32                                                                     |
//!
//! `dst_idx` is split: `dst_idx = dst_idx_hi << 7 | dst_idx_lo`.
//!
//! # Example
//!
//! ```
//! use asic_knet::api::hw::Pph;
//!
//! let mut buf = [0u8; 40];
//! let mut pph = Pph::new_unchecked(&mut buf[..]);
//! pph.set_tc(5);
//! pph.set_dst_idx(0x1234);
//! assert_eq!(pph.tc(), 5);
//! assert_eq!(pph.dst_idx(), 0x1234);
//! ```

use crate::config::PPH_LEN;

/// Forwarding operation reported in `fwd_op`.
pub mod fwd_op {
    pub const L2: u8 = 0;
    pub const L3: u8 = 1;
}

/// Header is shorter than [`PPH_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated;

#[derive(Debug, Clone)]
pub struct Pph<T: AsRef<[u8]>> {
    buffer: T,
}

macro_rules! pph_field {
    ($get:ident, $set:ident, $word:expr, $shift:expr, $width:expr, $ty:ty) => {
        #[inline]
        pub fn $get(&self) -> $ty {
            self.bits($word, $shift, $width) as $ty
        }

        #[inline]
        pub fn $set(&mut self, v: $ty)
        where
            T: AsMut<[u8]>,
        {
            self.set_bits($word, $shift, $width, v as u32)
        }
    };
}

impl<T: AsRef<[u8]>> Pph<T> {
    /// Wrap without checking the length. Accessors panic on a short buffer.
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self, Truncated> {
        if buffer.as_ref().len() < PPH_LEN {
            return Err(Truncated);
        }
        Ok(Self { buffer })
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    #[inline]
    fn word(&self, w: usize) -> u32 {
        let b = self.buffer.as_ref();
        u32::from_be_bytes([b[w * 4], b[w * 4 + 1], b[w * 4 + 2], b[w * 4 + 3]])
    }

    #[inline]
    fn bits(&self, w: usize, shift: u32, width: u32) -> u32 {
        let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
        (self.word(w) >> shift) & mask
    }

    #[inline]
    fn set_bits(&mut self, w: usize, shift: u32, width: u32, v: u32)
    where
        T: AsMut<[u8]>,
    {
        let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
        let word = (self.word(w) & !(mask << shift)) | ((v & mask) << shift);
        self.buffer.as_mut()[w * 4..w * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }

    pph_field!(dst_idx_hi, set_dst_idx_hi, 0, 0, 9, u16);
    pph_field!(hash_val, set_hash_val, 0, 9, 16, u16);
    pph_field!(color, set_color, 0, 25, 2, u8);
    pph_field!(tc, set_tc, 0, 27, 3, u8);
    pph_field!(fwd_op, set_fwd_op, 0, 30, 2, u8);

    pph_field!(skip_epp, set_skip_epp, 1, 10, 1, u8);
    pph_field!(src_idx, set_src_idx, 1, 11, 14, u16);
    pph_field!(dst_idx_lo, set_dst_idx_lo, 1, 25, 7, u16);

    pph_field!(mirror_bmap, set_mirror_bmap, 2, 0, 8, u8);
    pph_field!(skip_ipp, set_skip_ipp, 2, 8, 1, u8);
    pph_field!(slice_id, set_slice_id, 2, 9, 3, u8);
    pph_field!(die_id, set_die_id, 2, 12, 1, u8);
    pph_field!(port_num, set_port_num, 2, 13, 6, u8);

    pph_field!(igr_is_fab, set_igr_is_fab, 3, 4, 1, u8);
    pph_field!(decap_act, set_decap_act, 3, 5, 3, u8);
    pph_field!(src_bdi, set_src_bdi, 3, 8, 14, u16);
    pph_field!(cpu_reason, set_cpu_reason, 3, 22, 10, u16);

    pph_field!(tapping_push_o, set_tapping_push_o, 5, 0, 1, u8);
    pph_field!(src_vlan, set_src_vlan, 5, 1, 12, u16);
    pph_field!(pvlan_port_type, set_pvlan_port_type, 5, 13, 2, u8);
    pph_field!(igr_vid_pop_num, set_igr_vid_pop_num, 5, 15, 3, u8);

    pph_field!(timestamp, set_timestamp, 9, 0, 32, u32);

    /// Destination index reassembled from its two halves.
    pub fn dst_idx(&self) -> u16 {
        (self.dst_idx_hi() << 7) | self.dst_idx_lo()
    }

    pub fn set_dst_idx(&mut self, v: u16)
    where
        T: AsMut<[u8]>,
    {
        self.set_dst_idx_hi(v >> 7);
        self.set_dst_idx_lo(v & 0x7F);
    }

    /// Zero the whole header.
    pub fn clear(&mut self)
    where
        T: AsMut<[u8]>,
    {
        self.buffer.as_mut()[..PPH_LEN].fill(0);
    }
}
