mod common;

use common::{count, serial, Counters};
use meqcore::{symdeps, CachePolicy, ControlStatus, EvalMode, Request, ResultCode};
use std::sync::Arc;

#[test]
fn repeated_request_hits_the_cache() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 2.0).with_symdep(symdeps::DOMAIN)],
    );
    let a = forest.find("a").unwrap();

    let first = a.execute(&Arc::new(Request::new([0, 1, 1, 1])));
    assert!(first.code.has(ResultCode::UPDATED));
    assert_eq!(first.scalar(), Some(2.0));
    assert_eq!(first.code.depend_mask(), symdeps::default_mask("Domain").unwrap());

    let second = a.execute(&Arc::new(Request::new([0, 1, 1, 1])));
    assert!(Arc::ptr_eq(&first.result, &second.result));
    assert!(!second.code.has(ResultCode::UPDATED));
    assert!(a.control_status().has(ControlStatus::RETCACHE));
    assert_eq!(counters.get("a"), 1);
    assert_eq!(a.stats().cache_hits, 1);
}

#[test]
fn only_dependent_positions_invalidate() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 1.0).with_symdep(symdeps::DOMAIN)],
    );
    let a = forest.find("a").unwrap();

    a.execute(&Arc::new(Request::new([0, 1, 1, 1])));
    // Bit 0 is the last sub-id; Domain sits at bit 3.
    a.execute(&Arc::new(Request::new([0, 1, 1, 2])));
    assert_eq!(counters.get("a"), 1);

    a.execute(&Arc::new(Request::new([1, 1, 1, 1])));
    assert_eq!(counters.get("a"), 2);
}

#[test]
fn cache_always_keeps_result_for_identical_request() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 3.0).with_cache_policy(CachePolicy::Always)],
    );
    let a = forest.find("a").unwrap();

    a.execute(&Arc::new(Request::new([1, 2, 3])));
    let again = a.execute(&Arc::new(Request::new([1, 2, 3])));
    assert_eq!(again.scalar(), Some(3.0));
    assert_eq!(counters.get("a"), 1);
    assert!(a.control_status().has(ControlStatus::CACHED));
}

#[test]
fn cache_never_recomputes() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 1.0).with_cache_policy(CachePolicy::Never)],
    );
    let a = forest.find("a").unwrap();

    a.execute(&Arc::new(Request::new([1])));
    a.execute(&Arc::new(Request::new([1])));
    assert_eq!(counters.get("a"), 2);
    assert!(!a.has_cache());
}

#[test]
fn empty_request_id_is_never_cached() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 1.0).with_cache_policy(CachePolicy::Always)],
    );
    let a = forest.find("a").unwrap();

    a.execute(&Arc::new(Request::default()));
    a.execute(&Arc::new(Request::default()));
    assert_eq!(counters.get("a"), 2);
}

#[test]
fn plain_eval_reuses_result_with_derivatives() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 1.0).with_cache_policy(CachePolicy::Always)],
    );
    let a = forest.find("a").unwrap();

    let single = a.execute(&Arc::new(
        Request::new([1]).with_eval_mode(EvalMode::EvalSingle),
    ));
    assert!(single.result.has_derivatives());

    let plain = a.execute(&Arc::new(Request::new([1])));
    assert_eq!(counters.get("a"), 1);
    assert!(!plain.result.has_derivatives());
    assert_eq!(plain.scalar(), Some(1.0));
    // The cached copy keeps its derivatives.
    let (cached, _) = a.cached_result().unwrap();
    assert!(cached.has_derivatives());

    a.execute(&Arc::new(
        Request::new([1]).with_eval_mode(EvalMode::EvalDouble),
    ));
    assert_eq!(counters.get("a"), 2);
}

#[test]
fn smart_cache_uses_next_request_hint() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 1.0).with_symdep(symdeps::DOMAIN)],
    );
    let a = forest.find("a").unwrap();

    // Next request only steps the last sub-id: the result stays valid.
    a.execute(&Arc::new(Request::new([1, 1, 1, 1]).with_next_id([1, 1, 1, 2])));
    assert_eq!(a.stats().missing_next_hints, 0);
    a.execute(&Arc::new(Request::new([1, 1, 1, 2])));
    assert_eq!(counters.get("a"), 1);

    a.execute(&Arc::new(Request::new([2, 1, 1, 2])));
    assert_eq!(counters.get("a"), 2);
    assert_eq!(a.stats().missing_next_hints, 1);
}

#[test]
fn short_cache_released_after_every_parent_checks_in() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![
            count("c", 1.0),
            count("p1", 0.0).with_child("c"),
            count("p2", 0.0).with_child("c"),
        ],
    );
    let c = forest.find("c").unwrap();
    assert_eq!(c.num_parents(), 2);

    c.execute(&Arc::new(Request::new([1])));
    assert!(c.has_cache());

    c.hold_cache(true);
    assert!(c.has_cache());
    c.hold_cache(false);
    // Both parents checked in, one still holds.
    assert!(c.has_cache());
    c.hold_cache(false);
    assert!(!c.has_cache());
}

#[test]
fn minimal_cache_serves_second_parent_then_releases() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![
            count("c", 1.0).with_cache_policy(CachePolicy::Minimal),
            count("p1", 1.0)
                .with_child("c")
                .with_cache_policy(CachePolicy::Always),
            count("p2", 2.0)
                .with_child("c")
                .with_cache_policy(CachePolicy::Always),
        ],
    );
    let c = forest.find("c").unwrap();

    let one = forest.find("p1").unwrap().execute(&Arc::new(Request::new([1])));
    assert_eq!(one.scalar(), Some(2.0));
    assert!(c.has_cache());

    let two = forest.find("p2").unwrap().execute(&Arc::new(Request::new([1])));
    assert_eq!(two.scalar(), Some(3.0));
    assert_eq!(counters.get("c"), 1);
    assert!(!c.has_cache());
}

#[test]
fn parent_execution_releases_short_child_cache() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![
            count("c", 1.0).with_symdep(symdeps::DOMAIN),
            count("p", 0.0).with_child("c"),
        ],
    );
    let c = forest.find("c").unwrap();
    let p = forest.find("p").unwrap();

    // The next request steps the domain, so nothing below p outlives it.
    let out = p.execute(&Arc::new(Request::new([1, 1, 1, 1]).with_next_id([2, 1, 1, 1])));
    assert_eq!(out.scalar(), Some(1.0));
    assert!(!c.has_cache());
    assert!(!c.control_status().has(ControlStatus::CACHED));

    p.execute(&Arc::new(Request::new([2, 1, 1, 1]).with_next_id([3, 1, 1, 1])));
    assert_eq!(counters.get("c"), 2);
    assert!(!c.has_cache());
}

#[test]
fn child_result_still_valid_next_time_is_kept() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![
            count("c", 1.0).with_symdep(symdeps::DOMAIN),
            count("p", 0.0).with_child("c"),
        ],
    );
    let c = forest.find("c").unwrap();
    let p = forest.find("p").unwrap();

    p.execute(&Arc::new(Request::new([1, 1, 1, 1]).with_next_id([1, 1, 1, 2])));
    assert!(c.has_cache());
    p.execute(&Arc::new(Request::new([1, 1, 1, 2])));
    assert_eq!(counters.get("c"), 1);
}

#[test]
fn minimal_cache_with_single_parent_keeps_nothing() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![
            count("c", 1.0).with_cache_policy(CachePolicy::Minimal),
            count("p", 0.0).with_child("c"),
        ],
    );
    forest.find("p").unwrap().execute(&Arc::new(Request::new([1])));
    assert!(!forest.find("c").unwrap().has_cache());
}

#[test]
fn clear_cache_recurses_into_children() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![
            count("c", 1.0).with_cache_policy(CachePolicy::Always),
            count("p", 0.0)
                .with_child("c")
                .with_cache_policy(CachePolicy::Always),
        ],
    );
    let p = forest.find("p").unwrap();
    let c = forest.find("c").unwrap();
    p.execute(&Arc::new(Request::new([1])));
    assert!(p.has_cache() && c.has_cache());

    p.clear_cache(true);
    assert!(!p.has_cache());
    assert!(!c.has_cache());
    assert!(!c.control_status().has(ControlStatus::CACHED));
}

#[test]
fn state_snapshot_restores_cache() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 4.0).with_cache_policy(CachePolicy::Always)],
    );
    let a = forest.find("a").unwrap();
    a.execute(&Arc::new(Request::new([3, 1])));
    let snapshot = a.state();
    assert!(snapshot.get_path("cache.request_id").is_some());

    a.clear_cache(false);
    assert!(!a.has_cache());
    a.set_state(&snapshot).unwrap();
    assert!(a.has_cache());

    let out = a.execute(&Arc::new(Request::new([3, 1])));
    assert_eq!(out.scalar(), Some(4.0));
    assert_eq!(counters.get("a"), 1);
}
