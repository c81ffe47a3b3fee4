// crates/meqcore/tests/value_test.rs

use meqcore::{Cells, ForestDefinition, NodeResult, Record, Value, VellSet, Vells};

#[test]
fn test_record_copy_on_write() {
    let original = Record::new().with("a", 1.0).with("b", "x");
    let mut copy = original.clone();
    assert!(original.is_shared());

    copy.set("a", 2.0);
    assert_eq!(original.get_f64("a"), Some(1.0));
    assert_eq!(copy.get_f64("a"), Some(2.0));
    assert!(!original.is_shared());
}

#[test]
fn test_record_paths() {
    let mut rec = Record::new();
    rec.set_path("cache.policy", "smart");
    rec.set_path("cache.count", 3.0);
    assert_eq!(rec.get_path("cache.policy").and_then(Value::as_str), Some("smart"));
    assert_eq!(rec.get_path("cache.count").and_then(Value::as_f64), Some(3.0));
    assert!(rec.get_path("cache.missing").is_none());
}

#[test]
fn test_plain_json_values() {
    let rec: Record = serde_json::from_str(r#"{"value": [1, 2.5], "solvable": true, "name": "g"}"#).unwrap();
    assert_eq!(rec.get("value").and_then(Value::to_f64_vec), Some(vec![1.0, 2.5]));
    assert_eq!(rec.get_bool("solvable"), Some(true));
    assert_eq!(rec.get_str("name"), Some("g"));
}

#[test]
fn test_vells_broadcast_and_resample() {
    let a = Vells::array(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let sum = a.combine(&Vells::Scalar(1.0), |x, y| x + y).unwrap();
    assert_eq!(sum.values(), vec![2.0, 3.0, 4.0, 5.0]);

    let coarse = a.integrate(&[1, 2]).unwrap();
    assert_eq!(coarse.values(), vec![2.0, 3.0]);

    let fine = coarse.upsample(&[2, 4]).unwrap();
    assert_eq!(fine.values(), vec![2.0, 2.0, 3.0, 3.0, 2.0, 2.0, 3.0, 3.0]);

    assert!(a.integrate(&[3, 2]).is_err());
    let other = Vells::array(vec![4], vec![0.0; 4]).unwrap();
    assert!(a.combine(&other, |x, y| x + y).is_err());
}

#[test]
fn test_strip_derivatives_keeps_main_value() {
    let mut vs = VellSet::new(3.0);
    vs.spids = vec![7];
    vs.perturbations = vec![1e-6];
    vs.perturbed_sets = vec![meqcore::PerturbedSet {
        values: vec![Vells::Scalar(3.000001)],
    }];
    let result = NodeResult::new().with_vellset(vs);
    assert!(result.has_derivatives());

    let stripped = result.strip_derivatives();
    assert!(!stripped.has_derivatives());
    assert_eq!(stripped.scalar(), Some(3.0));
    assert!(result.has_derivatives());
}

#[test]
fn test_cells_grid() {
    let cells = Cells::time_freq((0.0, 10.0, 5), (100.0, 200.0, 2));
    assert_eq!(cells.shape(), vec![5, 2]);
    assert_eq!(cells.centers(0), vec![1.0, 3.0, 5.0, 7.0, 9.0]);
    assert!(cells.same_domain(&cells.with_shape(&[1, 1])));
    assert!(!cells.same_grid(&cells.with_shape(&[1, 1])));
}

#[test]
fn test_definition_defaults() {
    let def: ForestDefinition = serde_json::from_str(
        r#"{"name": "t", "nodes": [{"class": "meq.constant", "name": "c", "config": {"value": 2}}]}"#,
    )
    .unwrap();
    assert_eq!(def.settings.max_active_brigades, 2);
    assert!(def.settings.mt_enabled);
    let node = def.find_node("c").unwrap();
    assert!(node.mt_polling);
    assert_eq!(node.config.get_f64("value"), Some(2.0));
}
