//------------ Field registry ------------------------------------------------
//
// The header space the classifier matches over is a flat array of u64
// words (see types/flow.rs). This module names the spans of that array
// that carry header fields: each field has a byte offset, a bit width and
// a stage category. The categories drive staged lookup: all fields of one
// category live in a contiguous word range, so a segment boundary between
// categories is also a boundary between words.
//
// The pad bytes in the L3 and L4 words are deliberately left out of the
// registry; a mask that pins them is rejected as invalid.

use std::fmt;

/// The lookup stage a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    /// Pipeline metadata: the `metadata` register, ingress port, mark.
    Metadata,
    /// Ethernet header fields.
    L2,
    /// IP header fields.
    L3,
    /// Transport header fields.
    L4,
}

/// Identifies one header field of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldId {
    Metadata,
    InPort,
    Mark,
    EthSrc,
    EthType,
    EthDst,
    VlanTci,
    Ipv4Src,
    Ipv4Dst,
    IpProto,
    IpTos,
    IpTtl,
    IpFrag,
    TpSrc,
    TpDst,
    TcpFlags,
}

/// The extent of a field inside the flow byte array.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub id: FieldId,
    /// Byte offset of the first byte of the field.
    pub offset: usize,
    /// Width of the field in bits. Always a multiple of eight here:
    /// sub-byte fields are widened to their own byte.
    pub n_bits: u8,
    pub category: FieldCategory,
}

const fn def(
    id: FieldId,
    offset: usize,
    n_bits: u8,
    category: FieldCategory,
) -> FieldDef {
    FieldDef {
        id,
        offset,
        n_bits,
        category,
    }
}

static FIELDS: [FieldDef; 16] = [
    def(FieldId::Metadata, 0, 64, FieldCategory::Metadata),
    def(FieldId::InPort, 8, 32, FieldCategory::Metadata),
    def(FieldId::Mark, 12, 32, FieldCategory::Metadata),
    def(FieldId::EthSrc, 16, 48, FieldCategory::L2),
    def(FieldId::EthType, 22, 16, FieldCategory::L2),
    def(FieldId::EthDst, 24, 48, FieldCategory::L2),
    def(FieldId::VlanTci, 30, 16, FieldCategory::L2),
    def(FieldId::Ipv4Src, 32, 32, FieldCategory::L3),
    def(FieldId::Ipv4Dst, 36, 32, FieldCategory::L3),
    def(FieldId::IpProto, 40, 8, FieldCategory::L3),
    def(FieldId::IpTos, 41, 8, FieldCategory::L3),
    def(FieldId::IpTtl, 42, 8, FieldCategory::L3),
    def(FieldId::IpFrag, 43, 8, FieldCategory::L3),
    def(FieldId::TpSrc, 48, 16, FieldCategory::L4),
    def(FieldId::TpDst, 50, 16, FieldCategory::L4),
    def(FieldId::TcpFlags, 52, 16, FieldCategory::L4),
];

impl FieldId {
    /// The extent and category of this field.
    pub fn def(self) -> &'static FieldDef {
        // FIELDS is indexed in declaration order of the enum.
        &FIELDS[self as usize]
    }

    pub fn all() -> &'static [FieldDef] {
        &FIELDS
    }
}

impl FieldDef {
    /// Number of whole bytes the field occupies.
    pub fn n_bytes(&self) -> usize {
        self.n_bits as usize / 8
    }

    /// Index of the flow word the field starts in.
    pub fn word(&self) -> usize {
        self.offset / 8
    }

    /// Whether the field can be bound to a prefix trie: its value must
    /// fit a 64-bit big-endian bit string.
    pub fn prefix_capable(&self) -> bool {
        self.n_bits <= 64
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FieldId::Metadata => "metadata",
            FieldId::InPort => "in_port",
            FieldId::Mark => "mark",
            FieldId::EthSrc => "eth_src",
            FieldId::EthType => "eth_type",
            FieldId::EthDst => "eth_dst",
            FieldId::VlanTci => "vlan_tci",
            FieldId::Ipv4Src => "ipv4_src",
            FieldId::Ipv4Dst => "ipv4_dst",
            FieldId::IpProto => "ip_proto",
            FieldId::IpTos => "ip_tos",
            FieldId::IpTtl => "ip_ttl",
            FieldId::IpFrag => "ip_frag",
            FieldId::TpSrc => "tp_src",
            FieldId::TpDst => "tp_dst",
            FieldId::TcpFlags => "tcp_flags",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_indexed_in_declaration_order() {
        for fd in FieldId::all() {
            assert_eq!(fd.id.def().offset, fd.offset);
        }
    }

    #[test]
    fn categories_occupy_contiguous_word_ranges() {
        let mut last = FieldCategory::Metadata;
        let mut last_word = 0;
        for fd in FieldId::all() {
            assert!(fd.word() >= last_word);
            if fd.category != last {
                // A category switch must land on a fresh word.
                assert!(fd.offset % 8 == 0);
            }
            last = fd.category;
            last_word = fd.word();
        }
    }
}
