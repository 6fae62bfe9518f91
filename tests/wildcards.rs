//! Un-wildcarding behavior: the mask a lookup hands back must cover
//! everything the lookup examined and as little else as the staged
//! probes, partitions and tries allow.

use std::net::Ipv4Addr;
use std::sync::Arc;

use flow_classifier::prelude::*;
use zerocopy::IntoBytes;

mod common {
    #[allow(dead_code)]
    pub fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}

fn field_bytes(mask: &FlowMask, id: FieldId) -> &[u8] {
    let fd = id.def();
    &mask.as_bytes()[fd.offset..fd.offset + fd.n_bytes()]
}

fn assert_field_full(mask: &FlowMask, id: FieldId) {
    assert!(
        field_bytes(mask, id).iter().all(|b| *b == 0xff),
        "{} should be fully un-wildcarded",
        id
    );
}

fn assert_field_untouched(mask: &FlowMask, id: FieldId) {
    assert!(
        field_bytes(mask, id).iter().all(|b| *b == 0),
        "{} should remain wildcarded",
        id
    );
}

/// in_port + ipv4_src + tp_src, exact on all three.
fn port_src_rule(in_port: u32, src: Ipv4Addr, priority: u32) -> Arc<Rule> {
    let mut flow = Flow::new();
    flow.set_in_port(in_port);
    flow.set_ipv4_src(src);
    flow.set_tp_src(80);
    let mut mask = FlowMask::new();
    mask.open_field(FieldId::InPort);
    mask.open_field(FieldId::Ipv4Src);
    mask.open_field(FieldId::TpSrc);
    Arc::new(Rule::new(Match::new(flow, mask).unwrap(), priority))
}

fn eth_type_rule(eth_type: u16, priority: u32) -> Arc<Rule> {
    let mut flow = Flow::new();
    flow.set_eth_type(eth_type);
    let mut mask = FlowMask::new();
    mask.open_field(FieldId::EthType);
    Arc::new(Rule::new(Match::new(flow, mask).unwrap(), priority))
}

fn meta_src_rule(metadata: u64, src: Ipv4Addr, priority: u32) -> Arc<Rule> {
    let mut flow = Flow::new();
    flow.set_metadata(metadata);
    flow.set_ipv4_src(src);
    let mut mask = FlowMask::new();
    mask.open_field(FieldId::Metadata);
    mask.open_field(FieldId::Ipv4Src);
    Arc::new(Rule::new(Match::new(flow, mask).unwrap(), priority))
}

#[test]
fn staged_abort_stops_unwildcarding(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let cls = Classifier::default();
    for i in 0..1000u32 {
        cls.insert(&port_src_rule(
            5,
            Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8),
            100 + i,
        ))?;
    }
    let low = eth_type_rule(0x0800, 10);
    cls.insert(&low)?;

    // The flow disagrees on in_port, so the big subtable aborts at its
    // first stage; only the eth_type shape matches.
    let mut flow = Flow::new();
    flow.set_in_port(9);
    flow.set_eth_type(0x0800);
    flow.set_ipv4_src(Ipv4Addr::new(10, 0, 0, 1));
    flow.set_tp_src(80);

    let guard = &flow_classifier::epoch::pin();
    let mut wc = FlowWildcards::new();
    let hit = cls.lookup(&flow, &mut wc, guard).expect("eth_type rule");
    assert_eq!(hit.priority(), 10);

    assert_field_full(&wc.mask, FieldId::InPort);
    assert_field_full(&wc.mask, FieldId::EthType);
    assert_field_untouched(&wc.mask, FieldId::Ipv4Src);
    assert_field_untouched(&wc.mask, FieldId::TpSrc);
    Ok(())
}

#[test]
fn priority_cutoff_skips_whole_subtables(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let cls = Classifier::default();
    for i in 0..100u32 {
        cls.insert(&port_src_rule(
            5,
            Ipv4Addr::new(10, 0, 0, i as u8),
            100 + i,
        ))?;
    }
    let high = eth_type_rule(0x0800, 10_000);
    cls.insert(&high)?;

    let mut flow = Flow::new();
    flow.set_in_port(9);
    flow.set_eth_type(0x0800);

    let guard = &flow_classifier::epoch::pin();
    let mut wc = FlowWildcards::new();
    let hit = cls.lookup(&flow, &mut wc, guard).unwrap();
    assert_eq!(hit.priority(), 10_000);

    // The high-priority match came first; the port/src shape was never
    // examined, so none of its fields show up in the mask.
    assert_field_full(&wc.mask, FieldId::EthType);
    assert_field_untouched(&wc.mask, FieldId::InPort);
    assert_field_untouched(&wc.mask, FieldId::Ipv4Src);
    Ok(())
}

#[test]
fn trie_skip_examines_few_address_bits(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let cls = Classifier::default();
    cls.set_prefix_fields(&[FieldId::Ipv4Dst])?;

    let mut flow = Flow::new();
    flow.set_ipv4_dst(Ipv4Addr::new(10, 1, 0, 0));
    let mut mask = FlowMask::new();
    mask.open_field_prefix(FieldId::Ipv4Dst, 16);
    cls.insert(&Arc::new(Rule::new(Match::new(flow, mask)?, 7)))?;

    let mut probe = Flow::new();
    probe.set_ipv4_dst(Ipv4Addr::new(192, 168, 0, 1));

    let guard = &flow_classifier::epoch::pin();
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&probe, &mut wc, guard).is_none());

    // 192.x diverges from 10.x on the very first address bit; only
    // that bit justifies skipping the /16 subtable.
    assert_eq!(field_bytes(&wc.mask, FieldId::Ipv4Dst), &[0x80, 0, 0, 0]);

    // A probe inside 10.1/16 walks (and must reveal) the prefix.
    let mut wc = FlowWildcards::new();
    probe.set_ipv4_dst(Ipv4Addr::new(10, 1, 200, 9));
    let hit = cls.lookup(&probe, &mut wc, guard).unwrap();
    assert_eq!(hit.priority(), 7);
    assert_eq!(
        field_bytes(&wc.mask, FieldId::Ipv4Dst),
        &[0xff, 0xff, 0, 0]
    );
    Ok(())
}

#[test]
fn partition_skip_leaves_only_metadata(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let cls = Classifier::default();
    for i in 0..100u32 {
        cls.insert(&meta_src_rule(
            1,
            Ipv4Addr::new(10, 1, 0, i as u8),
            1000 + i,
        ))?;
        cls.insert(&meta_src_rule(
            2,
            Ipv4Addr::new(10, 2, 0, i as u8),
            2000 + i,
        ))?;
    }

    let mut flow = Flow::new();
    flow.set_metadata(3);
    flow.set_ipv4_src(Ipv4Addr::new(10, 1, 0, 5));

    let guard = &flow_classifier::epoch::pin();
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&flow, &mut wc, guard).is_none());

    // Partitions were consulted, so metadata is pinned; the skipped
    // subtables never exposed their address bits.
    assert_field_full(&wc.mask, FieldId::Metadata);
    assert_field_untouched(&wc.mask, FieldId::Ipv4Src);

    // A flow in partition 1 still finds its rule.
    flow.set_metadata(1);
    let mut wc = FlowWildcards::new();
    let hit = cls.lookup(&flow, &mut wc, guard).unwrap();
    assert_eq!(hit.priority(), 1005);
    Ok(())
}

#[test]
fn returned_mask_covers_the_winning_rule(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let cls = Classifier::default();
    cls.set_prefix_fields(&[FieldId::Ipv4Src])?;
    cls.insert(&Arc::new(Rule::new(Match::catchall(), 1)))?;
    for i in 0..50u32 {
        cls.insert(&port_src_rule(
            i,
            Ipv4Addr::new(10, 0, 0, i as u8),
            100 + i,
        ))?;
    }

    let guard = &flow_classifier::epoch::pin();
    for i in 0..50u32 {
        let mut flow = Flow::new();
        flow.set_in_port(i);
        flow.set_ipv4_src(Ipv4Addr::new(10, 0, 0, i as u8));
        flow.set_tp_src(80);
        let mut wc = FlowWildcards::new();
        let hit = cls.lookup(&flow, &mut wc, guard).unwrap();
        assert_eq!(hit.priority(), 100 + i);
        assert!(hit.match_spec().mask().is_subset_of(&wc.mask));
    }
    Ok(())
}
