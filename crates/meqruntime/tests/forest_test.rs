mod common;

use common::{count, serial, test_registry, Counters};
use meqcore::{
    BreakpointMask, DependMask, ForestDefinition, ForestEvent, ForestSettings, MeqError,
    MessageLevel, NodeIndex, NodeSpec, Request, RequestId,
};
use meqruntime::{
    load_definition, read_log, save_definition, validate_definition, Forest, LogMode,
};

#[test]
fn duplicate_names_are_rejected_and_counted() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![count("a", 1.0)]);
    assert_eq!(forest.error_count(), 0);

    let err = forest.create(count("a", 2.0)).unwrap_err();
    assert!(matches!(err, MeqError::DuplicateName(name) if name == "a"));
    assert_eq!(forest.error_count(), 1);

    let err = forest.create(NodeSpec::new("no.such.class", "b")).unwrap_err();
    assert!(matches!(err, MeqError::UnknownNodeClass(_)));
    assert_eq!(forest.error_count(), 2);
    assert_eq!(forest.num_nodes(), 1);
}

#[test]
fn lookups_report_bad_indices_and_names() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![count("a", 1.0)]);
    let a = forest.find_index("a").unwrap();
    assert_eq!(a, NodeIndex(1));
    assert_eq!(forest.get(a).unwrap().name(), "a");

    assert!(matches!(forest.get(NodeIndex(0)), Err(MeqError::InvalidNodeIndex(_))));
    assert!(matches!(forest.get(NodeIndex(99)), Err(MeqError::InvalidNodeIndex(_))));
    assert!(matches!(forest.find("zz"), Err(MeqError::NodeNotFound(_))));
    assert!(forest.execute_named("zz", Request::new([1])).is_err());
}

#[test]
fn explicit_indices_are_honoured() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("a", 1.0).with_index(NodeIndex(10))],
    );
    assert_eq!(forest.find_index("a").unwrap(), NodeIndex(10));
    assert_eq!(forest.max_index(), 11);

    let err = forest
        .create(count("b", 1.0).with_index(NodeIndex(10)))
        .unwrap_err();
    assert!(matches!(err, MeqError::IndexInUse(_)));
    // Fresh nodes go after the highest slot.
    assert_eq!(forest.create(count("c", 1.0)).unwrap(), NodeIndex(11));
}

#[test]
fn removing_trailing_nodes_shrinks_the_repository() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![count("a", 1.0), count("b", 1.0)]);
    assert_eq!(forest.max_index(), 3);

    let a = forest.remove(NodeIndex(1)).unwrap();
    assert_eq!(a.name(), "a");
    // Slot 1 is now a hole; b keeps its index.
    assert_eq!(forest.max_index(), 3);
    assert_eq!(forest.find_index("b").unwrap(), NodeIndex(2));

    forest.remove(NodeIndex(2)).unwrap();
    assert_eq!(forest.max_index(), 1);
    assert_eq!(forest.num_nodes(), 0);
    assert!(forest.remove(NodeIndex(2)).is_err());
}

#[test]
fn cycles_are_rejected_before_linking() {
    let counters = Counters::default();
    let forest = Forest::new(ForestSettings::single_threaded(), test_registry(&counters));
    forest.create(count("a", 1.0).with_child("b")).unwrap();
    forest.create(count("b", 1.0).with_child("a")).unwrap();

    let err = forest.resolve_children().unwrap_err();
    assert!(matches!(err, MeqError::CyclicDependency(_)));
    assert!(forest.find("a").unwrap().children().is_empty());
}

#[test]
fn unknown_child_fails_resolution() {
    let counters = Counters::default();
    let forest = Forest::new(ForestSettings::single_threaded(), test_registry(&counters));
    forest.create(count("a", 1.0).with_child("ghost")).unwrap();
    assert!(matches!(
        forest.resolve_children(),
        Err(MeqError::NodeNotFound(name)) if name == "ghost"
    ));
}

#[test]
fn symdeps_allocate_free_bits() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![]);
    assert_eq!(forest.symdep_mask("Domain").unwrap(), DependMask::new(0x08));
    assert_eq!(forest.symdep_mask("domain").unwrap(), DependMask::new(0x08));
    assert!(matches!(forest.symdep_mask("Beam"), Err(MeqError::UnknownSymdep(_))));

    let beam = forest.add_symdep("Beam").unwrap();
    assert_eq!(beam, DependMask::new(0x20));
    assert_eq!(forest.add_symdep("Beam").unwrap(), beam);

    let mut rqid = RequestId::from(vec![1, 1, 1, 1]);
    forest.incr_request_id(&mut rqid, "Domain").unwrap();
    assert_eq!(rqid, RequestId::from(vec![2, 1, 1, 1]));
    forest.incr_request_id(&mut rqid, "Iteration").unwrap();
    assert_eq!(rqid, RequestId::from(vec![2, 1, 1, 2]));
}

#[test]
fn node_symdeps_feed_the_own_mask() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![count("a", 1.0).with_symdep("Beam")]);
    let beam = forest.symdep_mask("Beam").unwrap();
    assert_eq!(forest.find("a").unwrap().own_mask(), beam);
}

#[test]
fn forest_state_round_trip() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![count("a", 1.0)]);
    forest.set_breakpoint(BreakpointMask::FAIL, false);

    let state = forest.state();
    assert_eq!(state.get_f64("num_nodes"), Some(1.0));
    assert_eq!(state.get_bool("mt_enabled"), Some(false));
    assert_eq!(state.get_path("symdeps.Domain").and_then(|v| v.as_f64()), Some(8.0));

    let other = serial(&counters, vec![]);
    other.set_state(&state).unwrap();
    assert_eq!(other.breakpoints().0, BreakpointMask::FAIL);
}

#[test]
fn logged_results_can_be_read_back() {
    let counters = Counters::default();
    let forest = serial(&counters, vec![count("a", 5.0).with_logging()]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.log");

    forest.open_log(&path, LogMode::Overwrite).unwrap();
    forest.execute_named("a", Request::new([1, 1])).unwrap();
    forest.execute_named("a", Request::new([1, 2])).unwrap();
    forest.close_log();

    let records = read_log(&path).unwrap();
    assert!(!records.is_empty());
    assert_eq!(records[0].name, "a");
    assert_eq!(records[0].request_id, RequestId::from(vec![1, 1]));
    assert_eq!(records[0].result.scalar(), Some(5.0));
}

#[test]
fn published_results_reach_subscribers() {
    let counters = Counters::default();
    let forest = serial(
        &counters,
        vec![count("quiet", 1.0), count("loud", 2.0).with_publish_level(1)],
    );
    let mut events = forest.subscribe_events();

    forest.execute_named("quiet", Request::new([1])).unwrap();
    forest.execute_named("loud", Request::new([1])).unwrap();
    forest.post_message(Some("loud"), "hello", MessageLevel::Info);

    match events.try_recv().unwrap() {
        ForestEvent::NodeResult { node, result, .. } => {
            assert_eq!(node, "loud");
            assert_eq!(result.scalar(), Some(2.0));
        }
        other => panic!("unexpected event {:?}", other),
    }
    match events.try_recv().unwrap() {
        ForestEvent::Message { message, .. } => assert_eq!(message, "hello"),
        other => panic!("unexpected event {:?}", other),
    }
}

fn sample_definition() -> ForestDefinition {
    let mut def = ForestDefinition::new("sample");
    def.settings = ForestSettings::single_threaded();
    def.nodes = vec![
        count("x", 1.0),
        count("y", 2.0),
        count("sum", 0.0).with_children(["x", "y"]),
    ];
    def
}

#[test]
fn definitions_validate_and_build() {
    let counters = Counters::default();
    let registry = test_registry(&counters);
    let def = sample_definition();
    validate_definition(&def, &registry).unwrap();

    let forest = Forest::from_definition(&def, registry).unwrap();
    let out = forest.execute_named("sum", Request::new([1])).unwrap();
    assert_eq!(out.scalar(), Some(3.0));
}

#[test]
fn invalid_definitions_are_reported() {
    let counters = Counters::default();
    let registry = test_registry(&counters);

    let mut def = sample_definition();
    def.nodes.push(count("x", 9.0));
    assert!(matches!(
        validate_definition(&def, &registry),
        Err(MeqError::DuplicateName(_))
    ));

    let mut def = sample_definition();
    def.nodes[0] = count("x", 1.0).with_child("sum");
    assert!(matches!(
        validate_definition(&def, &registry),
        Err(MeqError::CyclicDependency(_))
    ));

    let mut def = sample_definition();
    def.nodes.push(NodeSpec::new("meq.nothing", "z"));
    assert!(matches!(
        validate_definition(&def, &registry),
        Err(MeqError::UnknownNodeClass(_))
    ));
}

#[test]
fn definitions_survive_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forest.json");
    save_definition(&sample_definition(), &path).unwrap();

    let loaded = load_definition(&path).unwrap();
    assert_eq!(loaded.name, "sample");
    assert_eq!(loaded.nodes.len(), 3);
    assert_eq!(loaded.nodes[2].children.len(), 2);
    assert!(!loaded.settings.mt_enabled);
}
