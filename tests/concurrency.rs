//! Lock-free readers against a mutating writer: lookups must never
//! observe a torn rule set, and any rule they return must really match
//! the flow they asked about.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flow_classifier::prelude::*;

mod common {
    #[allow(dead_code)]
    pub fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}

fn src_rule(addr: Ipv4Addr, plen: u8, priority: u32) -> Arc<Rule> {
    let mut flow = Flow::new();
    flow.set_ipv4_src(addr);
    let mut mask = FlowMask::new();
    mask.open_field_prefix(FieldId::Ipv4Src, plen);
    Arc::new(Rule::new(Match::new(flow, mask).unwrap(), priority))
}

fn random_flow(rng: &mut StdRng) -> Flow {
    let mut flow = Flow::new();
    flow.set_ipv4_src(Ipv4Addr::new(
        10,
        rng.gen_range(0..4),
        rng.gen_range(0..4),
        rng.gen_range(0..8),
    ));
    flow
}

#[test]
fn readers_race_one_writer() -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let cls = Arc::new(Classifier::default());
    cls.set_prefix_fields(&[FieldId::Ipv4Src])?;
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|seed| {
            let cls = cls.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("reader-{}", seed))
                .spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut hits = 0usize;
                    while !stop.load(Ordering::Acquire) {
                        let flow = random_flow(&mut rng);
                        let guard = &flow_classifier::epoch::pin();
                        let mut wc = FlowWildcards::new();
                        if let Some(hit) =
                            cls.lookup(&flow, &mut wc, guard)
                        {
                            // Whatever snapshot we hit, the rule must
                            // actually admit the flow and the mask
                            // must cover it.
                            assert!(hit.match_spec().matches(&flow));
                            assert!(hit
                                .match_spec()
                                .mask()
                                .is_subset_of(&wc.mask));
                            hits += 1;
                        }
                    }
                    hits
                })
                .unwrap()
        })
        .collect();

    // The writer churns prefixes of every length while readers run.
    let mut rng = StdRng::seed_from_u64(99);
    let mut priority = 0u32;
    for _round in 0..30 {
        let rules: Vec<_> = (0..64)
            .map(|_| {
                priority += 1;
                let plen = [8u8, 16, 24, 32][rng.gen_range(0..4)];
                src_rule(
                    Ipv4Addr::new(
                        10,
                        rng.gen_range(0..4),
                        rng.gen_range(0..4),
                        rng.gen_range(0..8),
                    ),
                    plen,
                    priority,
                )
            })
            .collect();
        for rule in &rules {
            cls.replace(rule)?;
        }
        for rule in rules.iter().step_by(2) {
            if rule.is_installed() {
                cls.remove(rule)?;
            }
        }
    }

    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    Ok(())
}
