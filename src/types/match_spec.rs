use std::fmt;

use crate::types::errors::ClassifierError;
use crate::types::field::FieldId;
use crate::types::flow::{
    flow_fields_mask, hash_words, Flow, FlowMask,
};

//------------ Match ---------------------------------------------------------

/// A value/mask pair over the flow words: the matching half of a rule.
///
/// Bit i of `mask` set means the rule requires bit i of a flow to equal
/// bit i of `value`. The value is kept canonical (`value == value & mask`)
/// so equality and hashing can work on the words directly. Two matches
/// with bitwise-equal masks have the same *shape* and land in the same
/// subtable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    value: Flow,
    mask: FlowMask,
}

impl Match {
    /// Create a match. Fails with `InvalidMatch` if the mask pins bits
    /// outside every registered field.
    pub fn new(
        value: Flow,
        mask: FlowMask,
    ) -> Result<Match, ClassifierError> {
        if !mask.is_subset_of(flow_fields_mask()) {
            return Err(ClassifierError::InvalidMatch);
        }
        Ok(Match {
            value: value.masked(&mask),
            mask,
        })
    }

    /// The match with an all-zero mask: matches every flow.
    pub fn catchall() -> Match {
        Match {
            value: Flow::new(),
            mask: FlowMask::new(),
        }
    }

    pub fn value(&self) -> &Flow {
        &self.value
    }

    pub fn mask(&self) -> &FlowMask {
        &self.mask
    }

    pub fn is_catchall(&self) -> bool {
        self.mask.is_zero()
    }

    /// Whether `flow` satisfies this match.
    pub fn matches(&self, flow: &Flow) -> bool {
        flow.equal_in_mask(&self.value, &self.mask)
    }

    /// Whether this match pins everything `criteria` pins, identically.
    /// Every flow matched by `self` is then also matched by `criteria`.
    pub fn is_loose_match(&self, criteria: &Match) -> bool {
        criteria.mask.is_subset_of(&self.mask)
            && self.value.equal_in_mask(&criteria.value, &criteria.mask)
    }

    /// Basis-seeded hash over mask and value words.
    pub fn hash(&self, basis: u64) -> u64 {
        let h = hash_words(self.mask.words(), basis);
        hash_words(self.value.words(), h)
    }

    /// Whether some flow satisfies both matches: wherever the masks
    /// share a pinned bit, the values agree.
    pub fn overlaps(&self, other: &Match) -> bool {
        self.mask
            .words()
            .iter()
            .zip(other.mask.words())
            .zip(self.value.words().iter().zip(other.value.words()))
            .all(|((m1, m2), (v1, v2))| m1 & m2 & (v1 ^ v2) == 0)
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_catchall() {
            return write!(f, "*");
        }
        let mut first = true;
        for fd in FieldId::all() {
            let mask_bytes = self.mask_field_bytes(fd.offset, fd.n_bytes());
            if mask_bytes.iter().all(|b| *b == 0) {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}=", fd.id)?;
            match (fd.id, self.mask.prefix_len(fd)) {
                (FieldId::Ipv4Src | FieldId::Ipv4Dst, Some(plen))
                    if plen > 0 =>
                {
                    let v = self.value.field_bytes(fd);
                    write!(
                        f,
                        "{}.{}.{}.{}/{}",
                        v[0], v[1], v[2], v[3], plen
                    )?;
                }
                _ => {
                    for b in self.value.field_bytes(fd) {
                        write!(f, "{:02x}", b)?;
                    }
                    if mask_bytes.iter().any(|b| *b != 0xff) {
                        write!(f, "/")?;
                        for b in mask_bytes {
                            write!(f, "{:02x}", b)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Match {
    fn mask_field_bytes(&self, offset: usize, n: usize) -> &[u8] {
        use zerocopy::IntoBytes;
        &self.mask.as_bytes()[offset..offset + n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn masks_outside_the_registry_are_rejected() {
        let mut mask = FlowMask::new();
        // Byte 44 is L3 padding, not a field.
        use zerocopy::IntoBytes;
        mask.as_mut_bytes()[44] = 0xff;
        assert_eq!(
            Match::new(Flow::new(), mask),
            Err(ClassifierError::InvalidMatch)
        );
    }

    #[test]
    fn values_are_canonicalized_under_the_mask() {
        let mut flow = Flow::new();
        flow.set_ipv4_src(Ipv4Addr::new(10, 0, 0, 1));
        flow.set_tp_src(443);
        let mut mask = FlowMask::new();
        mask.open_field(FieldId::Ipv4Src);

        let m = Match::new(flow, mask).unwrap();
        let mut expect = Flow::new();
        expect.set_ipv4_src(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(m.value(), &expect);

        let mut probe = Flow::new();
        probe.set_ipv4_src(Ipv4Addr::new(10, 0, 0, 1));
        probe.set_tp_src(80);
        assert!(m.matches(&probe));
    }

    #[test]
    fn loose_match_is_superset_matching() {
        let mut flow = Flow::new();
        flow.set_ipv4_dst(Ipv4Addr::new(10, 1, 0, 0));
        let mut wide_mask = FlowMask::new();
        wide_mask.open_field_prefix(FieldId::Ipv4Dst, 16);
        let wide = Match::new(flow, wide_mask).unwrap();

        flow.set_ipv4_dst(Ipv4Addr::new(10, 1, 2, 0));
        let mut narrow_mask = wide_mask;
        narrow_mask.open_field_prefix(FieldId::Ipv4Dst, 24);
        let narrow = Match::new(flow, narrow_mask).unwrap();

        assert!(narrow.is_loose_match(&wide));
        assert!(!wide.is_loose_match(&narrow));
        assert!(wide.is_loose_match(&Match::catchall()));
        assert!(narrow.is_loose_match(&narrow.clone()));
    }

    #[test]
    fn display_is_compact() {
        let mut flow = Flow::new();
        flow.set_ipv4_dst(Ipv4Addr::new(10, 1, 0, 0));
        let mut mask = FlowMask::new();
        mask.open_field_prefix(FieldId::Ipv4Dst, 16);
        let m = Match::new(flow, mask).unwrap();
        assert_eq!(m.to_string(), "ipv4_dst=10.1.0.0/16");
        assert_eq!(Match::catchall().to_string(), "*");
    }
}
