mod common;

use common::{build, count, fail, serial, Counters};
use meqcore::{ChildErrorPolicy, ForestSettings, NodeSpec, Request};
use meqruntime::mtpool::Admission;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn mt_settings() -> ForestSettings {
    ForestSettings {
        brigade_size: 4,
        max_active_brigades: 2,
        ..ForestSettings::default()
    }
}

fn pair_settings() -> ForestSettings {
    ForestSettings {
        brigade_size: 2,
        max_active_brigades: 2,
        ..ForestSettings::default()
    }
}

fn wait_for(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// `roots` independent trees, each a root over four mid nodes over four
/// leaves of value 1.
fn fan_out(roots: usize, delay_ms: f64) -> Vec<NodeSpec> {
    let mut specs = Vec::new();
    for r in 0..roots {
        let mut mids = Vec::new();
        for m in 0..4 {
            let mut leaves = Vec::new();
            for l in 0..4 {
                let name = format!("leaf{}_{}_{}", r, m, l);
                specs.push(count(&name, 1.0).with_config("delay_ms", delay_ms));
                leaves.push(name);
            }
            let mid = format!("mid{}_{}", r, m);
            specs.push(count(&mid, 0.0).with_children(leaves));
            mids.push(mid);
        }
        specs.push(count(&format!("root{}", r), 0.0).with_children(mids));
    }
    specs
}

#[test]
fn admission_caps_concurrent_permits() {
    let admission = Admission::new(2);
    let first = admission.try_acquire().unwrap();
    let _second = admission.try_acquire().unwrap();
    assert!(admission.try_acquire().is_none());
    assert_eq!(admission.active(), 2);

    drop(first);
    assert_eq!(admission.active(), 1);
    assert!(admission.try_acquire().is_some());
    assert_eq!(admission.peak(), 2);
}

#[test]
fn multithreaded_poll_matches_serial_result() {
    let counters = Counters::default();
    let forest = build(mt_settings(), &counters, fan_out(1, 0.0));
    let out = forest.execute_named("root0", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), Some(16.0));

    let serial_counters = Counters::default();
    let reference = serial(&serial_counters, fan_out(1, 0.0));
    let expected = reference.execute_named("root0", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), expected.scalar());
    for l in 0..4 {
        assert_eq!(counters.get(&format!("leaf0_1_{}", l)), 1);
    }
}

#[test]
fn at_most_two_brigades_are_active() {
    let counters = Counters::default();
    let forest = Arc::new(build(mt_settings(), &counters, fan_out(4, 5.0)));

    let handles: Vec<_> = (0..4)
        .map(|r| {
            let forest = Arc::clone(&forest);
            thread::spawn(move || {
                forest
                    .execute_named(&format!("root{}", r), Request::new([1]))
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        let out = handle.join().unwrap();
        assert_eq!(out.scalar(), Some(16.0));
    }

    let stats = forest.scheduler_stats();
    assert!(stats.peak_active <= 2, "peak {}", stats.peak_active);
    assert_eq!(stats.max_active, 2);
}

#[test]
fn abort_interrupts_running_poll() {
    let counters = Counters::default();
    let forest = Arc::new(build(
        mt_settings(),
        &counters,
        vec![
            count("slow1", 1.0).with_config("delay_ms", 200.0),
            count("slow2", 1.0).with_config("delay_ms", 200.0),
            count("slow3", 1.0).with_config("delay_ms", 200.0),
            count("root", 0.0).with_children(["slow1", "slow2", "slow3"]),
        ],
    ));

    let started = Instant::now();
    let runner = {
        let forest = Arc::clone(&forest);
        thread::spawn(move || forest.execute_named("root", Request::new([1])).unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    forest.raise_abort_flag();
    let out = runner.join().unwrap();

    assert!(out.is_abort());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!forest.find("root").unwrap().has_cache());
    assert_eq!(counters.get("root"), 0);

    forest.clear_abort_flag();
    let out = forest.execute_named("root", Request::new([2])).unwrap();
    assert_eq!(out.scalar(), Some(3.0));
}

#[test]
fn aborted_forest_refuses_new_work() {
    let counters = Counters::default();
    let forest = build(mt_settings(), &counters, vec![count("a", 1.0)]);
    forest.raise_abort_flag();
    assert!(forest.is_aborted());
    let out = forest.execute_named("a", Request::new([1])).unwrap();
    assert!(out.is_abort());
    assert_eq!(counters.get("a"), 0);
}

#[test]
fn brigade_size_is_fixed_once_brigades_exist() {
    let counters = Counters::default();
    let forest = build(mt_settings(), &counters, fan_out(1, 0.0));
    forest.scheduler().set_brigade_size(3).unwrap();
    assert_eq!(forest.scheduler().brigade_size(), 3);

    forest.execute_named("root0", Request::new([1])).unwrap();
    assert!(forest.scheduler_stats().brigades > 0);
    assert!(forest.scheduler().set_brigade_size(2).is_err());
}

#[test]
fn shared_child_runs_once_for_concurrent_parents() {
    let counters = Counters::default();
    let forest = Arc::new(build(
        mt_settings(),
        &counters,
        vec![
            count("shared", 1.0)
                .with_config("delay_ms", 20.0)
                .with_cache_policy(meqcore::CachePolicy::Always),
            count("p1", 0.0).with_children(["shared"]),
            count("p2", 0.0).with_children(["shared"]),
        ],
    ));
    let handles: Vec<_> = ["p1", "p2"]
        .into_iter()
        .map(|name| {
            let forest = Arc::clone(&forest);
            thread::spawn(move || forest.execute_named(name, Request::new([1])).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().scalar(), Some(1.0));
    }
    assert_eq!(counters.get("shared"), 1);
}

#[test]
fn stepchildren_queued_on_a_brigade_still_run() {
    let counters = Counters::default();
    let forest = build(
        pair_settings(),
        &counters,
        vec![
            count("side1", 1.0).with_config("delay_ms", 100.0),
            count("side2", 1.0).with_config("delay_ms", 100.0),
            count("m1", 1.0).with_stepchild("side1"),
            count("m2", 1.0).with_stepchild("side2"),
            count("root", 0.0).with_children(["m1", "m2"]),
        ],
    );
    let out = forest.execute_named("root", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), Some(2.0));

    assert!(wait_for(|| counters.get("side1") == 1 && counters.get("side2") == 1));
    assert!(wait_for(|| forest
        .scheduler()
        .brigade_stats()
        .iter()
        .all(|b| b.queued == 0 && b.busy == 0)));
    // Workers with nothing left to run hand their permits back.
    assert!(wait_for(|| forest.scheduler_stats().active == 0));
}

#[test]
fn abandon_on_a_brigade_skips_remaining_children() {
    let counters = Counters::default();
    let forest = build(
        pair_settings(),
        &counters,
        vec![
            fail("f", "broken"),
            count("b", 1.0).with_config("delay_ms", 200.0),
            count("c", 1.0).with_config("delay_ms", 200.0),
            NodeSpec::new("test.count", "p")
                .with_children(["f", "b", "c"])
                .with_fail_policy(ChildErrorPolicy::AbandonPropagate),
        ],
    );
    let out = forest.execute_named("p", Request::new([1])).unwrap();

    assert!(out.code.is_fail());
    assert!(out.result.fail_records().any(|r| r.node == "f" && r.message.contains("broken")));
    assert_eq!(counters.get("p"), 0);
    assert_eq!(counters.get("c"), 0);
    assert!(counters.get("b") <= 1);
}

#[test]
fn async_poll_reports_each_child_once() {
    let counters = Counters::default();
    let forest = build(
        pair_settings(),
        &counters,
        vec![
            count("a", 1.0),
            count("b", 2.0).with_config("delay_ms", 30.0),
            count("c", 4.0),
        ],
    );
    let mut nursery = forest.nursery("driver");
    nursery.init(3, "driver");
    for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
        nursery.set_child(i, forest.find(name).unwrap(), name).unwrap();
    }
    nursery.set_label(2, "first");
    nursery.set_poll_order(&["first".to_string()]).unwrap();
    assert_eq!(nursery.labels(), vec!["a", "b", "first"]);

    let request = Arc::new(Request::new([1]));
    assert_eq!(nursery.start_async_poll(&request), 3);
    let mut seen = Vec::new();
    let mut sum = 0.0;
    while let Some((i, outcome)) = nursery.await_child_result() {
        sum += outcome.scalar().unwrap();
        seen.push(i);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(sum, 7.0);
    assert!(nursery.last_code(1).is_some_and(|code| !code.is_fail()));
}

#[test]
fn aborted_async_poll_yields_no_more_results() {
    let counters = Counters::default();
    let forest = build(
        pair_settings(),
        &counters,
        vec![
            count("x", 1.0).with_config("delay_ms", 50.0),
            count("y", 1.0).with_config("delay_ms", 50.0),
            count("z", 1.0).with_config("delay_ms", 50.0),
            count("root", 0.0).with_children(["x", "y", "z"]),
        ],
    );
    let mut nursery = forest.nursery("driver");
    nursery.init(3, "driver");
    for (i, name) in ["x", "y", "z"].into_iter().enumerate() {
        nursery.set_child(i, forest.find(name).unwrap(), name).unwrap();
    }

    let request = Arc::new(Request::new([1]));
    assert_eq!(nursery.start_async_poll(&request), 3);
    assert!(nursery.await_child_result().is_some());
    nursery.abort_poll();
    assert!(nursery.await_child_result().is_none());

    // The brigade is usable again once the abandoned orders drain.
    let out = forest.execute_named("root", Request::new([2])).unwrap();
    assert_eq!(out.scalar(), Some(3.0));
}

#[test]
fn lease_from_a_plain_thread_joins_a_pooled_brigade() {
    let counters = Counters::default();
    let forest = build(pair_settings(), &counters, fan_out(1, 0.0));
    let lease = forest.scheduler().lease_for_poll().unwrap();
    assert!(!lease.is_reused());
    let id = lease.brigade().id();
    let stats = forest.scheduler().brigade_stats();
    let mine = stats.iter().find(|b| b.id == id).unwrap();
    assert!(mine.active);
    assert!(mine.members >= 1);
    drop(lease);

    assert!(forest.scheduler_stats().idle >= 1);
    let out = forest.execute_named("root0", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), Some(16.0));
}
