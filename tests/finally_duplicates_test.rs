//! Duplicate-finally detection over hand-assembled try/finally bodies.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytelint::core::{Constant, Opcode, ValueKind};
use bytelint::{AnalysisCache, AnalysisConfig, EdgeKind};
use common::{class_of, descriptor_of, duplicated_finally_method, FixtureSource, MethodFixture};
use pretty_assertions::assert_eq;

fn cache_for(method: Arc<bytelint::MethodData>) -> (AnalysisCache, bytelint::MethodDescriptor) {
    let descriptor = descriptor_of("com/example/A", &method);
    let source = FixtureSource::new().with_class(class_of("com/example/A", vec![method]));
    (
        AnalysisCache::new(Arc::new(source), AnalysisConfig::default()),
        descriptor,
    )
}

#[test]
fn three_copies_form_one_group() {
    let (cache, descriptor) = cache_for(duplicated_finally_method());
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");
    assert!(!info.is_empty());
    assert_eq!(info.group_count(), 1);
}

#[test]
fn positions_translate_across_all_windows() {
    let (cache, descriptor) = cache_for(duplicated_finally_method());
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");

    // the comparison instruction of each copy
    let of_copy1 = info.duplicates_of(12);
    assert_eq!(of_copy1, BTreeSet::from([24, 37]));

    // window starts translate too
    assert_eq!(info.duplicates_of(9), BTreeSet::from([21, 34]));
}

#[test]
fn duplicates_are_symmetric() {
    let (cache, descriptor) = cache_for(duplicated_finally_method());
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");

    for pos in [12u32, 24, 37] {
        for other in info.duplicates_of(pos) {
            assert!(
                info.duplicates_of(other).contains(&pos),
                "{other} should map back to {pos}"
            );
        }
    }
}

#[test]
fn positions_outside_windows_have_no_duplicates() {
    let (cache, descriptor) = cache_for(duplicated_finally_method());
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");

    assert!(info.duplicates_of(0).is_empty());
    // the returns after each copy are not part of the duplicated body
    assert!(info.duplicates_of(20).is_empty());
    assert!(info.duplicates_of(32).is_empty());
}

#[test]
fn duplicate_edges_match_by_kind_and_window() {
    let (cache, descriptor) = cache_for(duplicated_finally_method());
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");
    let cfg = cache.get_cfg(&descriptor).unwrap().expect("cfg built");

    let copy1_edge = cfg
        .edges()
        .find(|&e| {
            cfg.edge_kind(e) == EdgeKind::IfCmp
                && cfg
                    .last_instruction(cfg.edge_source(e))
                    .map(|i| i.pos == 12)
                    .unwrap_or(false)
        })
        .expect("copy1 comparison edge");

    let duplicates = info.duplicate_edges(&cfg, copy1_edge);
    let mut positions: Vec<u32> = duplicates
        .iter()
        .map(|&e| cfg.last_instruction(cfg.edge_source(e)).unwrap().pos)
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, vec![24, 37]);
}

#[test]
fn handler_without_rethrow_is_unanalyzable() {
    // handler stores the exception but never rethrows it
    let method = MethodFixture::new("swallows", "()V")
        .ops(vec![
            (0, Opcode::InvokeStatic { index: 0 }),
            (3, Opcode::Goto { target: 8 }),
            (6, Opcode::Store { kind: ValueKind::Ref, slot: 1 }),
            (7, Opcode::Nop),
            (8, Opcode::Return { kind: None }),
        ])
        .catch(0, 3, 6, None)
        .constants(vec![Constant::MethodRef {
            class: "com/example/A".into(),
            name: "f".into(),
            signature: "()V".into(),
        }])
        .build();
    let (cache, descriptor) = cache_for(method);
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");
    assert!(info.is_empty());
}

#[test]
fn methods_without_finally_get_the_sentinel() {
    let method = MethodFixture::new("plain", "()V")
        .ops(vec![(0, Opcode::Return { kind: None })])
        .build();
    let (cache, descriptor) = cache_for(method);
    let info = cache
        .get_finally_duplicates(&descriptor)
        .unwrap()
        .expect("info computed");
    assert!(info.is_empty());
    assert!(info.duplicates_of(0).is_empty());
}
