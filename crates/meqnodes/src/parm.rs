//! Solvable parameters
//!
//! A parm holds a [`Funklet`] and evaluates it over the request cells. A
//! solvable parm registers itself under its node index as spid, adds
//! perturbed values when the request asks for derivatives and takes
//! solution increments from parm update requests.

use meqcore::{
    symdeps, NodeError, NodeResult, NodeSpec, Record, ResultRef, SpidInfo, Value,
};
use meqruntime::{ConfigField, EvalContext, NodeFactory, NodeKernel, NodeMetadata, Produced};
use std::collections::BTreeMap;

use crate::funklet::{Funklet, Polc};

pub const DEFAULT_PERTURBATION: f64 = 1e-6;

pub struct ParmNode {
    polc: Polc,
    solvable: bool,
    perturbation: f64,
}

impl ParmNode {
    pub fn new(polc: Polc, solvable: bool) -> Self {
        Self {
            polc,
            solvable,
            perturbation: DEFAULT_PERTURBATION,
        }
    }

    fn from_config(config: &Record) -> Result<Self, NodeError> {
        let polc = match config.get("polc") {
            Some(v) => parse_polc(v)?,
            None => match config.get("coeffs").and_then(Value::to_f64_vec) {
                Some(coeffs) => {
                    let shape = match config.get("coeff_shape").and_then(Value::to_f64_vec).as_deref() {
                        Some([nt, nf]) => [*nt as usize, *nf as usize],
                        Some([nt]) => [*nt as usize, 1],
                        _ => [coeffs.len(), 1],
                    };
                    Polc::new(coeffs, shape)?
                }
                None => Polc::constant(config.get_f64("value").unwrap_or(0.0)),
            },
        };
        let perturbation = config.get_f64("perturbation").unwrap_or(DEFAULT_PERTURBATION);
        if perturbation == 0.0 || !perturbation.is_finite() {
            return Err(NodeError::Configuration(format!("invalid perturbation {}", perturbation)));
        }
        Ok(Self {
            polc,
            solvable: config.get_bool("solvable").unwrap_or(false),
            perturbation,
        })
    }

    pub fn polc(&self) -> &Polc {
        &self.polc
    }
}

fn parse_polc(value: &Value) -> Result<Polc, NodeError> {
    let polc: Polc = value
        .to_deserialize()
        .map_err(|e| NodeError::Configuration(format!("bad polc: {}", e)))?;
    Ok(Polc::new(polc.coeffs, polc.shape)?.with_offset(polc.offset, polc.scale))
}

impl NodeKernel for ParmNode {
    fn class_name(&self) -> &str {
        "meq.parm"
    }

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        _children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        let sets = if self.solvable { ctx.eval_mode().num_perturbed_sets() } else { 0 };
        let vs = self
            .polc
            .evaluate(ctx.cells(), ctx.index.0 as i32, self.perturbation, sets)?;
        Ok(Produced::new(NodeResult::new().with_vellset(vs)))
    }

    fn discover_spids(
        &mut self,
        ctx: &EvalContext<'_>,
        _children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        let mut result = NodeResult::new();
        if self.solvable {
            result.spids.insert(
                ctx.index.0 as i32,
                SpidInfo {
                    node: ctx.node.to_string(),
                    perturbation: self.perturbation,
                },
            );
        }
        Ok(Produced::new(result))
    }

    fn apply_update(&mut self, ctx: &EvalContext<'_>, updates: &BTreeMap<i32, f64>) -> Result<(), NodeError> {
        if !self.solvable {
            return Ok(());
        }
        if let Some(&delta) = updates.get(&(ctx.index.0 as i32)) {
            self.polc.update(delta);
            tracing::debug!(node = ctx.node, delta, c0 = self.polc.coeffs[0], "parm updated");
        }
        Ok(())
    }

    fn inherent_symdeps(&self) -> Vec<String> {
        let mut deps = vec![symdeps::DOMAIN.to_string()];
        if self.solvable {
            deps.push(symdeps::ITERATION.to_string());
        }
        deps
    }

    fn check_children(&self, count: usize) -> Result<(), NodeError> {
        if count > 0 {
            return Err(NodeError::Configuration("a parm has no children".to_string()));
        }
        Ok(())
    }

    fn state(&self) -> Record {
        let polc = Value::from_serialize(&self.polc).unwrap_or(Value::Null);
        Record::new()
            .with("polc", polc)
            .with("solvable", self.solvable)
            .with("perturbation", self.perturbation)
    }

    fn set_state(&mut self, state: &Record) -> Result<(), NodeError> {
        if let Some(v) = state.get("polc") {
            self.polc = parse_polc(v)?;
        }
        if let Some(solvable) = state.get_bool("solvable") {
            self.solvable = solvable;
        }
        if let Some(p) = state.get_f64("perturbation") {
            self.perturbation = p;
        }
        Ok(())
    }
}

pub struct ParmNodeFactory;

impl NodeFactory for ParmNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> {
        Ok(Box::new(ParmNode::from_config(&spec.config)?))
    }

    fn class_name(&self) -> &str {
        "meq.parm"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Polynomial parameter, optionally solvable".to_string(),
            category: "source".to_string(),
            min_children: 0,
            max_children: Some(0),
            config: vec![
                ConfigField::new("value", "constant coefficient", false),
                ConfigField::new("coeffs", "polynomial coefficients, time-major", false),
                ConfigField::new("coeff_shape", "[ntime, nfreq] coefficient counts", false),
                ConfigField::new("polc", "full polc record", false),
                ConfigField::new("solvable", "produce derivatives and accept updates", false),
                ConfigField::new("perturbation", "perturbation of the constant term", false),
            ],
        }
    }
}
