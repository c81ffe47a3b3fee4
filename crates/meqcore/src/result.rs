use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Cells, RequestId, Vells};

/// Shared, copy-on-write handle to a computed result.
pub type ResultRef = Arc<NodeResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailKind {
    Fail,
    Missing,
}

/// One entry of a result's causal failure chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRecord {
    pub kind: FailKind,
    pub message: String,
    pub node: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl FailRecord {
    pub fn fail(message: impl Into<String>, node: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            kind: FailKind::Fail,
            message: message.into(),
            node: node.into(),
            class: class.into(),
            origin: None,
        }
    }

    pub fn missing(message: impl Into<String>, node: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            kind: FailKind::Missing,
            ..Self::fail(message, node, class)
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Values of one perturbed evaluation, one entry per spid of the owning vellset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerturbedSet {
    pub values: Vec<Vells>,
}

/// Main value plus perturbed values for each solvable parameter, or a list
/// of fail records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VellSet {
    pub value: Option<Vells>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perturbations: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perturbed_sets: Vec<PerturbedSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fails: Vec<FailRecord>,
}

impl VellSet {
    pub fn new(value: impl Into<Vells>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn from_fails(fails: Vec<FailRecord>) -> Self {
        Self {
            fails,
            ..Self::default()
        }
    }

    pub fn is_fail(&self) -> bool {
        !self.fails.is_empty()
    }

    pub fn num_perturbed_sets(&self) -> usize {
        self.perturbed_sets.len()
    }

    /// Perturbed value for `spid` in set `set`, if this vellset carries one.
    pub fn perturbed(&self, set: usize, spid: i32) -> Option<&Vells> {
        let pos = self.spids.iter().position(|&s| s == spid)?;
        self.perturbed_sets.get(set)?.values.get(pos)
    }

    pub fn strip_derivatives(&mut self) {
        self.spids.clear();
        self.perturbations.clear();
        self.perturbed_sets.clear();
    }
}

/// Description of a solvable parameter reported by spid discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpidInfo {
    pub node: String,
    pub perturbation: f64,
}

/// Result of one node evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub vellsets: Vec<VellSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells: Option<Arc<Cells>>,
    #[serde(default)]
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub spids: BTreeMap<i32, SpidInfo>,
}

impl NodeResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vellset(mut self, vs: VellSet) -> Self {
        self.vellsets.push(vs);
        self
    }

    pub fn with_cells(mut self, cells: Option<Arc<Cells>>) -> Self {
        self.cells = cells;
        self
    }

    pub fn from_fails(fails: Vec<FailRecord>) -> Self {
        Self::new().with_vellset(VellSet::from_fails(fails))
    }

    pub fn is_empty(&self) -> bool {
        self.vellsets.is_empty() && self.spids.is_empty()
    }

    pub fn is_fail(&self) -> bool {
        self.vellsets
            .iter()
            .flat_map(|vs| vs.fails.iter())
            .any(|f| f.kind == FailKind::Fail)
    }

    pub fn is_missing(&self) -> bool {
        self.vellsets
            .iter()
            .flat_map(|vs| vs.fails.iter())
            .any(|f| f.kind == FailKind::Missing)
    }

    pub fn fail_records(&self) -> impl Iterator<Item = &FailRecord> {
        self.vellsets.iter().flat_map(|vs| vs.fails.iter())
    }

    pub fn num_perturbed_sets(&self) -> usize {
        self.vellsets
            .iter()
            .map(VellSet::num_perturbed_sets)
            .max()
            .unwrap_or(0)
    }

    pub fn has_derivatives(&self) -> bool {
        self.vellsets.iter().any(|vs| !vs.perturbed_sets.is_empty())
    }

    /// Copy of this result with every perturbed value removed.
    pub fn strip_derivatives(&self) -> NodeResult {
        let mut out = self.clone();
        for vs in &mut out.vellsets {
            vs.strip_derivatives();
        }
        out
    }

    /// Main value of the first vellset as a scalar, if it is one.
    pub fn scalar(&self) -> Option<f64> {
        self.vellsets.first()?.value.as_ref()?.as_scalar()
    }
}
