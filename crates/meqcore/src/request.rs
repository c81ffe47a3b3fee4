use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::{BreakpointMask, CachePolicy, Cells, NodeIndex, Record, RequestId};

/// Number of perturbed evaluations a request asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    #[default]
    Eval = 0,
    EvalSingle = 1,
    EvalDouble = 2,
}

impl EvalMode {
    pub fn num_perturbed_sets(self) -> usize {
        self as usize
    }
}

/// What the request asks the tree to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Service {
    #[default]
    Evaluate,
    /// Collect the solvable parameters below each node.
    DiscoverSpids,
    /// Apply solution increments, keyed by spid.
    ParmUpdate { updates: BTreeMap<i32, f64> },
}

/// Command carried by a request rider, applied by the addressed nodes before
/// they poll their children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum NodeCommand {
    ClearCache,
    SetActive { active: bool },
    SetBreakpoint {
        mask: BreakpointMask,
        #[serde(default)]
        single_shot: bool,
    },
    ClearBreakpoint { mask: BreakpointMask },
    SetPublishLevel { level: u8 },
    SetCachePolicy { policy: CachePolicy },
    SetState { state: Record },
}

/// Node commands addressed to every node, by name, or by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rider {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<NodeCommand>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_name: HashMap<String, Vec<NodeCommand>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_index: HashMap<NodeIndex, Vec<NodeCommand>>,
}

impl Rider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_all(mut self, cmd: NodeCommand) -> Self {
        self.all.push(cmd);
        self
    }

    pub fn for_name(mut self, name: impl Into<String>, cmd: NodeCommand) -> Self {
        self.by_name.entry(name.into()).or_default().push(cmd);
        self
    }

    pub fn for_index(mut self, index: NodeIndex, cmd: NodeCommand) -> Self {
        self.by_index.entry(index).or_default().push(cmd);
        self
    }

    /// Commands applying to the given node, broadcast ones first.
    pub fn commands_for(&self, index: NodeIndex, name: &str) -> Vec<&NodeCommand> {
        let mut out: Vec<&NodeCommand> = self.all.iter().collect();
        if let Some(cmds) = self.by_name.get(name) {
            out.extend(cmds);
        }
        if let Some(cmds) = self.by_index.get(&index) {
            out.extend(cmds);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_name.is_empty() && self.by_index.is_empty()
    }
}

/// A request for evaluation, passed down the tree unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Id of the request the generator intends to issue next, used to decide
    /// whether a result is worth keeping past this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells: Option<Arc<Cells>>,
    #[serde(default)]
    pub eval_mode: EvalMode,
    #[serde(default)]
    pub service: Service,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rider: Option<Rider>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_cells(mut self, cells: Cells) -> Self {
        self.cells = Some(Arc::new(cells));
        self
    }

    pub fn with_shared_cells(mut self, cells: Arc<Cells>) -> Self {
        self.cells = Some(cells);
        self
    }

    pub fn with_next_id(mut self, next: impl Into<RequestId>) -> Self {
        self.next_id = Some(next.into());
        self
    }

    pub fn with_eval_mode(mut self, mode: EvalMode) -> Self {
        self.eval_mode = mode;
        self
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.service = service;
        self
    }

    pub fn with_rider(mut self, rider: Rider) -> Self {
        self.rider = Some(rider);
        self
    }

    pub fn has_cells(&self) -> bool {
        self.cells.is_some()
    }

    pub fn is_parm_update(&self) -> bool {
        matches!(self.service, Service::ParmUpdate { .. })
    }

    pub fn is_discover_spids(&self) -> bool {
        matches!(self.service, Service::DiscoverSpids)
    }
}
