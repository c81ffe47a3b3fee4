//! Element-wise functions of the children
//!
//! Derivatives are propagated by substitution: for every spid found among
//! the children, the perturbed output is the function applied with each
//! child replaced by its own perturbed value for that spid, or its main
//! value if it does not depend on it.

use meqcore::{NodeError, NodeResult, NodeSpec, PerturbedSet, ResultRef, VellSet, Vells};
use meqruntime::{EvalContext, NodeFactory, NodeKernel, NodeMetadata, Produced};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Multiply,
}

impl Op {
    fn class_name(self) -> &'static str {
        match self {
            Op::Add => "meq.add",
            Op::Multiply => "meq.multiply",
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Op::Add => a + b,
            Op::Multiply => a * b,
        }
    }

    fn fold(self, values: &[&Vells]) -> Result<Vells, NodeError> {
        let mut iter = values.iter();
        let Some(first) = iter.next() else {
            return Ok(Vells::Scalar(0.0));
        };
        iter.try_fold((*first).clone(), |acc, v| acc.combine(v, |a, b| self.apply(a, b)))
    }
}

pub struct FunctionNode {
    op: Op,
}

impl FunctionNode {
    pub fn new(op: Op) -> Self {
        Self { op }
    }
}

impl NodeKernel for FunctionNode {
    fn class_name(&self) -> &str {
        self.op.class_name()
    }

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        let mut inputs: Vec<&VellSet> = Vec::with_capacity(children.len());
        for (i, child) in children.iter().enumerate() {
            let Some(child) = child else { continue };
            let vs = child
                .vellsets
                .first()
                .filter(|vs| vs.value.is_some())
                .ok_or_else(|| NodeError::InvalidInput {
                    child: i,
                    reason: "result has no value".to_string(),
                })?;
            inputs.push(vs);
        }
        if inputs.is_empty() {
            return Err(NodeError::MissingData(format!("{}: no usable child results", ctx.node)));
        }

        let mains: Vec<&Vells> = inputs.iter().filter_map(|vs| vs.value.as_ref()).collect();
        let mut out = VellSet::new(self.op.fold(&mains)?);

        let mut spids: Vec<(i32, f64)> = Vec::new();
        for vs in &inputs {
            for (k, &spid) in vs.spids.iter().enumerate() {
                if !spids.iter().any(|(s, _)| *s == spid) {
                    spids.push((spid, vs.perturbations.get(k).copied().unwrap_or(0.0)));
                }
            }
        }
        let sets = inputs.iter().map(|vs| vs.num_perturbed_sets()).max().unwrap_or(0);
        if !spids.is_empty() && sets > 0 {
            spids.sort_by_key(|(s, _)| *s);
            let mut perturbed_sets = Vec::with_capacity(sets);
            for set in 0..sets {
                let mut values = Vec::with_capacity(spids.len());
                for (spid, _) in &spids {
                    let substituted: Vec<&Vells> = inputs
                        .iter()
                        .zip(&mains)
                        .map(|(vs, &main)| vs.perturbed(set, *spid).unwrap_or(main))
                        .collect();
                    values.push(self.op.fold(&substituted)?);
                }
                perturbed_sets.push(PerturbedSet { values });
            }
            out.spids = spids.iter().map(|(s, _)| *s).collect();
            out.perturbations = spids.iter().map(|(_, p)| *p).collect();
            out.perturbed_sets = perturbed_sets;
        }

        let cells = children.iter().flatten().find_map(|c| c.cells.clone());
        Ok(Produced::new(NodeResult::new().with_vellset(out).with_cells(cells)))
    }

    fn check_children(&self, count: usize) -> Result<(), NodeError> {
        if count == 0 {
            return Err(NodeError::Configuration(format!(
                "{} needs at least one child",
                self.op.class_name()
            )));
        }
        Ok(())
    }
}

pub struct FunctionNodeFactory {
    op: Op,
}

impl FunctionNodeFactory {
    pub fn new(op: Op) -> Self {
        Self { op }
    }
}

impl NodeFactory for FunctionNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> {
        Ok(Box::new(FunctionNode::new(self.op)))
    }

    fn class_name(&self) -> &str {
        self.op.class_name()
    }

    fn metadata(&self) -> NodeMetadata {
        let description = match self.op {
            Op::Add => "Element-wise sum of the children",
            Op::Multiply => "Element-wise product of the children",
        };
        NodeMetadata {
            description: description.to_string(),
            category: "function".to_string(),
            min_children: 1,
            ..NodeMetadata::default()
        }
    }
}
