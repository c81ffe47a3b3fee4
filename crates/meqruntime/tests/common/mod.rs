#![allow(dead_code)]

use meqcore::{
    EvalMode, ForestSettings, NodeError, NodeResult, NodeSpec, PerturbedSet, ResultRef, VellSet,
    Vells,
};
use meqruntime::{EvalContext, Forest, NodeKernel, NodeRegistry, Produced};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Installs a test-writer subscriber once per test binary. `RUST_LOG`
/// selects the level.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// Evaluation counters by node name.
#[derive(Clone, Default)]
pub struct Counters(Arc<Mutex<HashMap<String, Arc<AtomicUsize>>>>);

impl Counters {
    pub fn counter(&self, name: &str) -> Arc<AtomicUsize> {
        let mut map = self.0.lock().unwrap();
        Arc::clone(map.entry(name.to_string()).or_default())
    }

    pub fn get(&self, name: &str) -> usize {
        self.counter(name).load(Ordering::SeqCst)
    }
}

/// Adds its own `value` to the sum of its children's scalars, counting
/// every evaluation. With `delay_ms` it sleeps before answering.
pub struct CountingKernel {
    value: f64,
    delay: Option<Duration>,
    counter: Arc<AtomicUsize>,
}

impl NodeKernel for CountingKernel {
    fn class_name(&self) -> &str {
        "test.count"
    }

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let sum: f64 = self.value
            + children
                .iter()
                .flatten()
                .filter_map(|r| r.scalar())
                .sum::<f64>();
        let mut vs = VellSet::new(sum);
        let sets = ctx.eval_mode().num_perturbed_sets();
        if sets > 0 {
            vs.spids = vec![ctx.index.0 as i32];
            vs.perturbations = vec![1e-6];
            vs.perturbed_sets = (0..sets)
                .map(|k| PerturbedSet {
                    values: vec![Vells::Scalar(sum + 1e-6 * (k + 1) as f64)],
                })
                .collect();
        }
        Ok(Produced::new(NodeResult::new().with_vellset(vs)))
    }
}

/// Always fails; with `missing` it reports missing data instead.
pub struct FailKernel {
    message: String,
    missing: bool,
}

impl NodeKernel for FailKernel {
    fn class_name(&self) -> &str {
        "test.fail"
    }

    fn get_result(
        &mut self,
        _ctx: &EvalContext<'_>,
        _children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        if self.missing {
            Err(NodeError::MissingData(self.message.clone()))
        } else {
            Err(NodeError::Evaluation(self.message.clone()))
        }
    }
}

/// Produces ones on a grid of the configured `shape` over the request domain.
pub struct GridKernel {
    shape: Vec<usize>,
}

impl NodeKernel for GridKernel {
    fn class_name(&self) -> &str {
        "test.grid"
    }

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        let cells = ctx.require_cells()?;
        if children.is_empty() {
            let n = self.shape.iter().product();
            let value = Vells::array(self.shape.clone(), vec![1.0; n])?;
            let result = NodeResult::new()
                .with_vellset(VellSet::new(value))
                .with_cells(Some(Arc::new(cells.with_shape(&self.shape))));
            return Ok(Produced::new(result));
        }
        // Parent: sums the children's grids, which must agree by now.
        let mut total: Option<Vells> = None;
        let mut grid = None;
        for child in children.iter().flatten() {
            let Some(value) = child.vellsets.first().and_then(|vs| vs.value.clone()) else {
                continue;
            };
            total = Some(match total {
                None => value,
                Some(acc) => acc.combine(&value, |a, b| a + b)?,
            });
            grid = grid.or_else(|| child.cells.clone());
        }
        let result = NodeResult::new()
            .with_vellset(VellSet::new(total.unwrap_or(Vells::Scalar(0.0))))
            .with_cells(grid);
        Ok(Produced::new(result))
    }
}

pub fn test_registry(counters: &Counters) -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    let c = counters.clone();
    registry.register_fn("test.count", move |spec: &NodeSpec| {
        let delay = spec
            .config
            .get_f64("delay_ms")
            .map(|ms| Duration::from_millis(ms as u64));
        Ok(Box::new(CountingKernel {
            value: spec.config.get_f64("value").unwrap_or(0.0),
            delay,
            counter: c.counter(&spec.name),
        }) as Box<dyn NodeKernel>)
    });
    registry.register_fn("test.fail", |spec: &NodeSpec| {
        Ok(Box::new(FailKernel {
            message: spec.config.get_str("message").unwrap_or("failed").to_string(),
            missing: spec.config.get_bool("missing").unwrap_or(false),
        }) as Box<dyn NodeKernel>)
    });
    registry.register_fn("test.grid", |spec: &NodeSpec| {
        let shape = spec
            .config
            .get("shape")
            .and_then(|v| v.to_f64_vec())
            .map(|dims| dims.into_iter().map(|d| d as usize).collect())
            .unwrap_or_else(|| vec![1, 1]);
        Ok(Box::new(GridKernel { shape }) as Box<dyn NodeKernel>)
    });
    Arc::new(registry)
}

pub fn count(name: &str, value: f64) -> NodeSpec {
    NodeSpec::new("test.count", name).with_config("value", value)
}

pub fn fail(name: &str, message: &str) -> NodeSpec {
    NodeSpec::new("test.fail", name).with_config("message", message)
}

/// Builds a forest from `specs` and links the children.
pub fn build(settings: ForestSettings, counters: &Counters, specs: Vec<NodeSpec>) -> Forest {
    init_tracing();
    let forest = Forest::new(settings, test_registry(counters));
    for spec in specs {
        forest.create(spec).unwrap();
    }
    forest.resolve_children().unwrap();
    forest
}

pub fn serial(counters: &Counters, specs: Vec<NodeSpec>) -> Forest {
    build(ForestSettings::single_threaded(), counters, specs)
}

pub fn eval_mode_of(result: &NodeResult) -> EvalMode {
    match result.num_perturbed_sets() {
        0 => EvalMode::Eval,
        1 => EvalMode::EvalSingle,
        _ => EvalMode::EvalDouble,
    }
}
