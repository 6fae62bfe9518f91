use std::fmt;
use std::hash::Hasher;
use std::net::Ipv4Addr;
use std::ops::Range;
use std::sync::OnceLock;

use fxhash::FxHasher;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::types::field::{FieldDef, FieldId};

//------------ Flow words ----------------------------------------------------
//
// A flow is the header of one packet, flattened into FLOW_U64S host-endian
// words. Multi-byte field values are stored in network byte order inside
// the byte view of those words, the way they sit in the packet itself, so
// a mask pinning a leading span of a field's bytes pins a big-endian
// prefix of its value. Hashing and masking work on whole words; field
// extraction goes through the byte view.

/// Number of u64 words in a flow.
pub const FLOW_U64S: usize = 7;

/// Number of bytes in a flow.
pub const FLOW_BYTES: usize = FLOW_U64S * 8;

/// Default staged-lookup segment boundaries, as flow word indices: end of
/// the metadata words, end of L2, end of L3. The remainder up to
/// `FLOW_U64S` is the L4 stage.
pub const FLOW_SEGMENTS: [u8; 3] = [2, 4, 6];

/// One packet header, the key of a classifier lookup.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Flow(pub(crate) [u64; FLOW_U64S]);

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn words(&self) -> &[u64; FLOW_U64S] {
        &self.0
    }

    /// The raw bytes of the field's extent.
    pub fn field_bytes(&self, fd: &FieldDef) -> &[u8] {
        &self.as_bytes()[fd.offset..fd.offset + fd.n_bytes()]
    }

    fn set_field_bytes(&mut self, fd: &FieldDef, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), fd.n_bytes());
        self.as_mut_bytes()[fd.offset..fd.offset + fd.n_bytes()]
            .copy_from_slice(bytes);
    }

    /// The field value as a big-endian bit string, left-aligned in a u64.
    /// Bit 63 of the result is the first (most significant) bit of the
    /// field. This is the orientation the prefix tries walk in.
    pub(crate) fn extract_be64(&self, fd: &FieldDef) -> u64 {
        let mut v: u64 = 0;
        for b in self.field_bytes(fd) {
            v = (v << 8) | u64::from(*b);
        }
        v << (64 - fd.n_bits)
    }

    pub fn metadata(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.field_bytes(FieldId::Metadata.def()));
        u64::from_be_bytes(b)
    }

    pub fn set_metadata(&mut self, v: u64) {
        self.set_field_bytes(FieldId::Metadata.def(), &v.to_be_bytes());
    }

    pub fn set_in_port(&mut self, v: u32) {
        self.set_field_bytes(FieldId::InPort.def(), &v.to_be_bytes());
    }

    pub fn set_mark(&mut self, v: u32) {
        self.set_field_bytes(FieldId::Mark.def(), &v.to_be_bytes());
    }

    pub fn set_eth_src(&mut self, mac: [u8; 6]) {
        self.set_field_bytes(FieldId::EthSrc.def(), &mac);
    }

    pub fn set_eth_dst(&mut self, mac: [u8; 6]) {
        self.set_field_bytes(FieldId::EthDst.def(), &mac);
    }

    pub fn set_eth_type(&mut self, v: u16) {
        self.set_field_bytes(FieldId::EthType.def(), &v.to_be_bytes());
    }

    pub fn set_vlan_tci(&mut self, v: u16) {
        self.set_field_bytes(FieldId::VlanTci.def(), &v.to_be_bytes());
    }

    pub fn set_ipv4_src(&mut self, addr: Ipv4Addr) {
        self.set_field_bytes(FieldId::Ipv4Src.def(), &addr.octets());
    }

    pub fn set_ipv4_dst(&mut self, addr: Ipv4Addr) {
        self.set_field_bytes(FieldId::Ipv4Dst.def(), &addr.octets());
    }

    pub fn set_ip_proto(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpProto.def(), &[v]);
    }

    pub fn set_ip_tos(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpTos.def(), &[v]);
    }

    pub fn set_ip_ttl(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpTtl.def(), &[v]);
    }

    pub fn set_ip_frag(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpFrag.def(), &[v]);
    }

    pub fn set_tp_src(&mut self, v: u16) {
        self.set_field_bytes(FieldId::TpSrc.def(), &v.to_be_bytes());
    }

    pub fn set_tp_dst(&mut self, v: u16) {
        self.set_field_bytes(FieldId::TpDst.def(), &v.to_be_bytes());
    }

    pub fn set_tcp_flags(&mut self, v: u16) {
        self.set_field_bytes(FieldId::TcpFlags.def(), &v.to_be_bytes());
    }

    /// `self & mask`.
    pub fn masked(&self, mask: &FlowMask) -> Flow {
        let mut out = [0u64; FLOW_U64S];
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.0[i] & mask.0[i];
        }
        Flow(out)
    }

    /// Whether `self` and `other` agree on every bit `mask` pins.
    pub fn equal_in_mask(&self, other: &Flow, mask: &FlowMask) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .zip(mask.0.iter())
            .all(|((a, b), m)| (a ^ b) & m == 0)
    }
}

//------------ FlowMask ------------------------------------------------------

/// A bitmask over the flow words. Bit i set means "bit i of the flow is
/// significant".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct FlowMask(pub(crate) [u64; FLOW_U64S]);

impl FlowMask {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn words(&self) -> &[u64; FLOW_U64S] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn is_subset_of(&self, other: &FlowMask) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Whether any bit in the word range `[range.start, range.end)` is
    /// set.
    pub(crate) fn any_in_range(&self, range: Range<usize>) -> bool {
        self.0[range].iter().any(|w| *w != 0)
    }

    /// OR `other`'s words in `[range.start, range.end)` into self.
    pub(crate) fn or_range(&mut self, other: &FlowMask, range: Range<usize>) {
        for i in range {
            self.0[i] |= other.0[i];
        }
    }

    /// Pin the whole extent of a field.
    pub fn open_field(&mut self, id: FieldId) {
        let fd = id.def();
        for b in &mut self.as_mut_bytes()[fd.offset..fd.offset + fd.n_bytes()]
        {
            *b = 0xff;
        }
    }

    /// Pin the first `plen` big-endian bits of a field.
    pub fn open_field_prefix(&mut self, id: FieldId, plen: u8) {
        let fd = id.def();
        debug_assert!(plen <= fd.n_bits);
        let bytes = &mut self.as_mut_bytes()[fd.offset..fd.offset + fd.n_bytes()];
        let mut left = plen as usize;
        for b in bytes.iter_mut() {
            if left == 0 {
                break;
            }
            let take = left.min(8);
            *b |= (!0u8) << (8 - take);
            left -= take;
        }
    }

    /// If the field's mask is a contiguous run of leading one bits
    /// followed by zeros, return its length; otherwise `None`. A fully
    /// wildcarded field reports `Some(0)`.
    pub(crate) fn prefix_len(&self, fd: &FieldDef) -> Option<u8> {
        let bytes =
            &self.as_bytes()[fd.offset..fd.offset + fd.n_bytes()];
        let mut plen: u8 = 0;
        let mut in_ones = true;
        for b in bytes {
            if in_ones {
                let ones = b.leading_ones() as u8;
                plen += ones;
                if ones < 8 {
                    in_ones = false;
                    // The tail of this byte must be all zero.
                    if *b & ((1u16 << (8 - ones)) - 1) as u8 != 0 {
                        return None;
                    }
                }
            } else if *b != 0 {
                return None;
            }
        }
        Some(plen)
    }

    /// The metadata field's portion of this mask.
    pub(crate) fn metadata_mask(&self) -> u64 {
        let fd = FieldId::Metadata.def();
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.as_bytes()[fd.offset..fd.offset + 8]);
        u64::from_be_bytes(b)
    }
}

impl fmt::Display for FlowMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, w) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:016x}", w)?;
        }
        Ok(())
    }
}

/// The union of all registered field extents. Masks must stay inside it.
pub(crate) fn flow_fields_mask() -> &'static FlowMask {
    static MASK: OnceLock<FlowMask> = OnceLock::new();
    MASK.get_or_init(|| {
        let mut mask = FlowMask::new();
        for fd in FieldId::all() {
            mask.open_field(fd.id);
        }
        mask
    })
}

//------------ FlowWildcards -------------------------------------------------

/// The un-wildcarding accumulator of a lookup: starts all-zero (fully
/// wildcarded) and collects a one bit for every header bit the lookup
/// examined. False one bits are harmless; false zero bits are not.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowWildcards {
    pub mask: FlowMask,
}

impl FlowWildcards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the mask words `[0, end_word)` into the accumulator. Used
    /// when a staged probe has examined a subtable mask up to a segment
    /// boundary.
    pub(crate) fn fold_mask_range(&mut self, mask: &FlowMask, end_word: usize) {
        self.mask.or_range(mask, 0..end_word);
    }

    /// Record that the first `plen` bits of `field` were examined.
    pub(crate) fn unwildcard_prefix(&mut self, id: FieldId, plen: u8) {
        self.mask.open_field_prefix(id, plen);
    }
}

//------------ Hashing -------------------------------------------------------
//
// Staged lookup hashes a growing word range of the masked flow, carrying
// the hasher from one stage into the next so the stage hashes chain. Rule
// insertion computes the same sequence over the rule's value, which is
// already masked. Words with an all-zero mask contribute nothing, so two
// rules of one subtable and a flow probing it always feed identical word
// sequences.

#[derive(Default)]
pub(crate) struct StagedHasher {
    inner: FxHasher,
}

impl StagedHasher {
    pub(crate) fn new(basis: u64) -> Self {
        let mut inner = FxHasher::default();
        inner.write_u64(basis);
        StagedHasher { inner }
    }

    /// Feed the masked words of `[range.start, range.end)`.
    pub(crate) fn fold_range(
        &mut self,
        flow: &Flow,
        mask: &FlowMask,
        range: Range<usize>,
    ) {
        for i in range {
            if mask.0[i] != 0 {
                self.inner.write_u64(flow.0[i] & mask.0[i]);
            }
        }
    }

    /// The hash over everything folded so far. Does not consume; more
    /// ranges may be folded afterwards.
    pub(crate) fn digest(&self) -> u64 {
        self.inner.finish()
    }
}

pub(crate) fn hash_words(words: &[u64], basis: u64) -> u64 {
    let mut h = FxHasher::default();
    h.write_u64(basis);
    for w in words {
        h.write_u64(*w);
    }
    h.finish()
}

pub(crate) fn hash_metadata(metadata: u64) -> u64 {
    hash_words(&[metadata], 0)
}
