#![allow(dead_code)]

use meqcore::{ForestSettings, NodeSpec};
use meqruntime::Forest;
use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

pub fn forest_with(settings: ForestSettings, specs: Vec<NodeSpec>) -> Forest {
    init_tracing();
    let forest = Forest::new(settings, meqnodes::standard_registry());
    for spec in specs {
        forest.create(spec).unwrap();
    }
    forest.resolve_children().unwrap();
    forest
}

pub fn forest(specs: Vec<NodeSpec>) -> Forest {
    forest_with(ForestSettings::single_threaded(), specs)
}

pub fn constant(name: &str, value: f64) -> NodeSpec {
    NodeSpec::new("meq.constant", name).with_config("value", value)
}

pub fn solvable_parm(name: &str, value: f64) -> NodeSpec {
    NodeSpec::new("meq.parm", name)
        .with_config("value", value)
        .with_config("solvable", true)
}
