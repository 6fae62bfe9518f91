//! Differential test: classifier lookups against a brute-force oracle
//! over randomly generated rule sets, plus the megaflow soundness
//! property (any flow covered by the returned mask gets the same
//! answer).

use std::net::Ipv4Addr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zerocopy::IntoBytes;

use flow_classifier::prelude::*;

mod common {
    #[allow(dead_code)]
    pub fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}

fn random_rule(rng: &mut StdRng, priority: u32) -> Arc<Rule> {
    let mut flow = Flow::new();
    let mut mask = FlowMask::new();

    if rng.gen_bool(0.3) {
        flow.set_metadata(rng.gen_range(0..4));
        mask.open_field(FieldId::Metadata);
    }
    let plen = [0u8, 8, 16, 24, 32][rng.gen_range(0..5)];
    if plen > 0 {
        flow.set_ipv4_src(Ipv4Addr::new(
            10,
            rng.gen_range(0..2),
            rng.gen_range(0..2),
            rng.gen_range(0..4),
        ));
        mask.open_field_prefix(FieldId::Ipv4Src, plen);
    }
    if rng.gen_bool(0.5) {
        flow.set_tp_dst([80u16, 443, 53][rng.gen_range(0..3)]);
        mask.open_field(FieldId::TpDst);
    }
    if rng.gen_bool(0.3) {
        flow.set_ip_proto([6u8, 17][rng.gen_range(0..2)]);
        mask.open_field(FieldId::IpProto);
    }

    Arc::new(Rule::new(Match::new(flow, mask).unwrap(), priority))
}

fn random_flow(rng: &mut StdRng) -> Flow {
    let mut flow = Flow::new();
    flow.set_metadata(rng.gen_range(0..5));
    flow.set_ipv4_src(Ipv4Addr::new(
        10,
        rng.gen_range(0..3),
        rng.gen_range(0..3),
        rng.gen_range(0..5),
    ));
    flow.set_tp_dst([80u16, 443, 53, 8080][rng.gen_range(0..4)]);
    flow.set_ip_proto([6u8, 17, 1][rng.gen_range(0..3)]);
    flow
}

fn oracle<'a>(rules: &'a [Arc<Rule>], flow: &Flow) -> Option<&'a Arc<Rule>> {
    rules
        .iter()
        .filter(|r| r.match_spec().matches(flow))
        .max_by_key(|r| r.priority())
}

#[test]
fn lookup_agrees_with_brute_force(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let mut rng = StdRng::seed_from_u64(42);
    let cls = Classifier::default();
    cls.set_prefix_fields(&[FieldId::Ipv4Src])?;

    // Unique priorities: equal-priority duplicates are a caller
    // contract violation and the oracle could not break ties anyway.
    let rules: Vec<_> =
        (0..200).map(|p| random_rule(&mut rng, p)).collect();
    for rule in &rules {
        cls.replace(rule)?;
    }
    let installed: Vec<_> =
        rules.iter().filter(|r| r.is_installed()).cloned().collect();

    let guard = &flow_classifier::epoch::pin();
    for _ in 0..500 {
        let flow = random_flow(&mut rng);
        let mut wc = FlowWildcards::new();
        let got = cls.lookup(&flow, &mut wc, guard);
        let want = oracle(&installed, &flow);
        assert_eq!(
            got.map(|r| r.priority()),
            want.map(|r| r.priority()),
            "mismatch for flow {:?}",
            flow
        );
        if let Some(hit) = got {
            assert!(hit.match_spec().matches(&flow));
            assert!(hit.match_spec().mask().is_subset_of(&wc.mask));
        }
    }
    Ok(())
}

#[test]
fn returned_masks_are_sound() -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let mut rng = StdRng::seed_from_u64(1337);
    let cls = Classifier::default();
    cls.set_prefix_fields(&[FieldId::Ipv4Src])?;

    let rules: Vec<_> =
        (0..150).map(|p| random_rule(&mut rng, p)).collect();
    for rule in &rules {
        cls.replace(rule)?;
    }

    let guard = &flow_classifier::epoch::pin();
    for _ in 0..200 {
        let flow = random_flow(&mut rng);
        let mut wc = FlowWildcards::new();
        let got = cls.lookup(&flow, &mut wc, guard).map(|r| r.priority());

        // Any flow agreeing with `flow` on the un-wildcarded bits must
        // classify identically; everything else may be arbitrary.
        let wc_bytes: Vec<u8> = wc.mask.as_bytes().to_vec();
        for _ in 0..5 {
            let mut variant = flow;
            for (i, b) in variant.as_mut_bytes().iter_mut().enumerate()
            {
                *b = (*b & wc_bytes[i])
                    | (rng.gen::<u8>() & !wc_bytes[i]);
            }
            let mut vwc = FlowWildcards::new();
            let vgot = cls
                .lookup(&variant, &mut vwc, guard)
                .map(|r| r.priority());
            assert_eq!(got, vgot, "false zero bit in returned mask");
        }
    }
    Ok(())
}

#[test]
fn round_trip_restores_prior_answers(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let mut rng = StdRng::seed_from_u64(7);
    let cls = Classifier::default();
    cls.set_prefix_fields(&[FieldId::Ipv4Src])?;

    let base: Vec<_> =
        (0..50).map(|p| random_rule(&mut rng, p)).collect();
    for rule in &base {
        cls.replace(rule)?;
    }
    let probes: Vec<_> =
        (0..100).map(|_| random_flow(&mut rng)).collect();

    let guard = &flow_classifier::epoch::pin();
    let before: Vec<_> = probes
        .iter()
        .map(|f| {
            let mut wc = FlowWildcards::new();
            cls.lookup(f, &mut wc, guard).map(|r| r.priority())
        })
        .collect();
    let count = cls.count();
    let shapes = cls.subtable_count();

    // Churn: a transient batch goes in and comes out again.
    let extra: Vec<_> =
        (1000..1100).map(|p| random_rule(&mut rng, p)).collect();
    for rule in &extra {
        cls.replace(rule)?;
    }
    for rule in extra.iter().rev() {
        if rule.is_installed() {
            cls.remove(rule)?;
        }
    }

    assert_eq!(cls.count(), count);
    assert_eq!(cls.subtable_count(), shapes);
    let after: Vec<_> = probes
        .iter()
        .map(|f| {
            let mut wc = FlowWildcards::new();
            cls.lookup(f, &mut wc, guard).map(|r| r.priority())
        })
        .collect();
    assert_eq!(before, after);
    Ok(())
}
