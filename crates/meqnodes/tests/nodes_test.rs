mod common;

use common::{constant, forest, forest_with, solvable_parm};
use meqcore::{
    Axis, Cells, ChildErrorPolicy, EvalMode, ForestDefinition, ForestSettings, MeqError, NodeSpec,
    Request, RequestId, Service, Vells,
};
use meqnodes::{Funklet, Polc};
use meqruntime::Forest;
use std::collections::BTreeMap;

const EPS: f64 = 1e-9;

#[test]
fn standard_classes_are_registered() {
    let classes = meqnodes::standard_registry().list_classes();
    for class in [
        "meq.add",
        "meq.constant",
        "meq.fail",
        "meq.multiply",
        "meq.parm",
        "meq.sum_stream",
    ] {
        assert!(classes.iter().any(|c| c == class), "missing {}", class);
    }
}

#[test]
fn polc_is_linear_in_time() {
    let polc = Polc::new(vec![1.0, 2.0], [2, 1]).unwrap();
    let cells = Cells::new(vec![Axis::new("time", 0.0, 2.0, 2)]);
    let vs = polc.evaluate(Some(&cells), 1, 1e-6, 0).unwrap();
    // Centers at 0.5 and 1.5.
    assert_eq!(vs.value.unwrap().values(), vec![2.0, 4.0]);
    assert!(Polc::new(vec![1.0], [2, 2]).is_err());
}

#[test]
fn polc_double_sets_perturb_both_ways() {
    let polc = Polc::constant(3.0);
    let vs = polc.evaluate(None, 7, 0.5, 2).unwrap();
    assert_eq!(vs.perturbed(0, 7).and_then(Vells::as_scalar), Some(3.5));
    assert_eq!(vs.perturbed(1, 7).and_then(Vells::as_scalar), Some(2.5));
}

#[test]
fn arithmetic_on_constants() {
    let forest = forest(vec![
        constant("two", 2.0),
        constant("three", 3.0),
        NodeSpec::new("meq.add", "sum").with_children(["two", "three"]),
        NodeSpec::new("meq.multiply", "product").with_children(["two", "three"]),
    ]);
    let sum = forest.execute_named("sum", Request::new([1])).unwrap();
    assert_eq!(sum.scalar(), Some(5.0));
    let product = forest.execute_named("product", Request::new([1])).unwrap();
    assert_eq!(product.scalar(), Some(6.0));
}

#[test]
fn constant_array_broadcasts_against_scalar() {
    let forest = forest(vec![
        NodeSpec::new("meq.constant", "vec")
            .with_config("value", vec![1.0, 2.0, 3.0])
            .with_config("shape", vec![3.0]),
        constant("ten", 10.0),
        NodeSpec::new("meq.add", "sum").with_children(["vec", "ten"]),
    ]);
    let out = forest.execute_named("sum", Request::new([1])).unwrap();
    let value = out.result.vellsets[0].value.as_ref().unwrap();
    assert_eq!(value.values(), vec![11.0, 12.0, 13.0]);
}

#[test]
fn parm_evaluates_polc_on_cells() {
    let forest = forest(vec![NodeSpec::new("meq.parm", "p")
        .with_config("coeffs", vec![1.0, 2.0])
        .with_config("coeff_shape", vec![2.0, 1.0])]);
    let cells = Cells::time_freq((0.0, 4.0, 4), (1.0e8, 2.0e8, 2));
    let out = forest
        .execute_named("p", Request::new([1, 1, 1, 1]).with_cells(cells))
        .unwrap();
    let value = out.result.vellsets[0].value.as_ref().unwrap();
    assert_eq!(value.shape(), Some(&[4usize, 2][..]));
    assert_eq!(value.values(), vec![2.0, 2.0, 4.0, 4.0, 6.0, 6.0, 8.0, 8.0]);
    // A plain parm depends on the domain only.
    assert_eq!(out.code.depend_mask(), forest.symdep_mask("Domain").unwrap());
}

fn solve_tree() -> (Forest, i32) {
    let forest = forest(vec![
        solvable_parm("p", 2.0),
        constant("c", 3.0),
        NodeSpec::new("meq.multiply", "m").with_children(["p", "c"]),
    ]);
    let spid = forest.find_index("p").unwrap().0 as i32;
    (forest, spid)
}

#[test]
fn derivatives_propagate_through_functions() {
    let (forest, spid) = solve_tree();
    let out = forest
        .execute_named("m", Request::new([1, 1, 1, 1]).with_eval_mode(EvalMode::EvalDouble))
        .unwrap();
    let vs = &out.result.vellsets[0];
    assert_eq!(vs.spids, vec![spid]);
    assert_eq!(vs.perturbations, vec![meqnodes::DEFAULT_PERTURBATION]);
    let plus = vs.perturbed(0, spid).and_then(Vells::as_scalar).unwrap();
    let minus = vs.perturbed(1, spid).and_then(Vells::as_scalar).unwrap();
    assert!((plus - (2.0 + 1e-6) * 3.0).abs() < EPS);
    assert!((minus - (2.0 - 1e-6) * 3.0).abs() < EPS);
}

#[test]
fn non_solvable_parm_has_no_derivatives() {
    let forest = forest(vec![NodeSpec::new("meq.parm", "p").with_config("value", 1.0)]);
    let out = forest
        .execute_named("p", Request::new([1]).with_eval_mode(EvalMode::EvalSingle))
        .unwrap();
    assert!(!out.result.has_derivatives());
}

#[test]
fn spid_discovery_reaches_the_root() {
    let (forest, spid) = solve_tree();
    let out = forest
        .execute_named("m", Request::new([1, 1, 1, 1]).with_service(Service::DiscoverSpids))
        .unwrap();
    let info = out.result.spids.get(&spid).unwrap();
    assert_eq!(info.node, "p");
}

#[test]
fn parm_update_changes_later_evaluations() {
    let (forest, spid) = solve_tree();
    let mut rqid = RequestId::from(vec![1, 1, 1, 1]);
    let before = forest.execute_named("m", Request::new(rqid.clone())).unwrap();
    assert_eq!(before.scalar(), Some(6.0));
    assert!(forest.find("m").unwrap().depends_on_iteration());

    forest.incr_request_id(&mut rqid, "Iteration").unwrap();
    let updates = BTreeMap::from([(spid, 0.5)]);
    forest
        .execute_named(
            "m",
            Request::new(rqid.clone()).with_service(Service::ParmUpdate { updates }),
        )
        .unwrap();

    forest.incr_request_id(&mut rqid, "Iteration").unwrap();
    let after = forest.execute_named("m", Request::new(rqid)).unwrap();
    assert_eq!(after.scalar(), Some(7.5));
}

#[test]
fn fail_node_fails_its_parent() {
    let forest = forest(vec![
        constant("one", 1.0),
        NodeSpec::new("meq.fail", "broken").with_config("message", "no antenna"),
        NodeSpec::new("meq.add", "sum").with_children(["one", "broken"]),
    ]);
    let out = forest.execute_named("sum", Request::new([1])).unwrap();
    assert!(out.code.is_fail());
    assert_eq!(out.result.fail_records().next().unwrap().message, "no antenna");
}

#[test]
fn ignored_failures_leave_the_rest_of_the_sum() {
    let forest = forest(vec![
        constant("one", 1.0),
        NodeSpec::new("meq.fail", "broken"),
        NodeSpec::new("meq.add", "sum")
            .with_children(["one", "broken"])
            .with_fail_policy(ChildErrorPolicy::Ignore),
    ]);
    let out = forest.execute_named("sum", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), Some(1.0));
}

#[test]
fn classes_validate_their_children() {
    let forest = forest(vec![constant("one", 1.0)]);
    let err = forest
        .create(NodeSpec::new("meq.constant", "bad").with_child("one"))
        .unwrap_err();
    assert!(matches!(err, MeqError::CreateFailed { .. }));
    assert!(forest.create(NodeSpec::new("meq.add", "empty")).is_err());
}

fn stream_specs() -> Vec<NodeSpec> {
    vec![
        constant("a", 1.0),
        constant("b", 2.0),
        constant("c", 3.0),
        NodeSpec::new("meq.sum_stream", "s").with_children(["a", "b", "c"]),
    ]
}

#[test]
fn sum_stream_accumulates_serially() {
    let forest = forest(stream_specs());
    let out = forest.execute_named("s", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), Some(6.0));
}

#[test]
fn sum_stream_accumulates_on_a_brigade() {
    let settings = ForestSettings {
        brigade_size: 3,
        ..ForestSettings::default()
    };
    let forest = forest_with(settings, stream_specs());
    let first = forest.execute_named("s", Request::new([1])).unwrap();
    assert_eq!(first.scalar(), Some(6.0));
    forest.clear_all_caches();
    let second = forest.execute_named("s", Request::new([1])).unwrap();
    assert_eq!(second.scalar(), Some(6.0));
}

#[test]
fn forest_builds_from_json_definition() {
    let json = r#"{
        "name": "demo",
        "settings": { "mt_enabled": false },
        "nodes": [
            { "class": "meq.constant", "name": "x", "config": { "value": 4 } },
            { "class": "meq.parm", "name": "g", "config": { "value": 0.5 } },
            { "class": "meq.multiply", "name": "y", "children": ["x", "g"] }
        ]
    }"#;
    let def: ForestDefinition = serde_json::from_str(json).unwrap();
    let forest = Forest::from_definition(&def, meqnodes::standard_registry()).unwrap();
    let out = forest.execute_named("y", Request::new([1, 1, 1, 1])).unwrap();
    assert_eq!(out.scalar(), Some(2.0));
}
