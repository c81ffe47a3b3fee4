use meqcore::{
    Cells, EvalMode, EventEmitter, NodeError, NodeIndex, NodeResult, Record, Request, ResultCode,
    ResultRef, VellSet, Vells,
};
use std::collections::BTreeMap;

/// How a node wants its children polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Poll every child, then hand all results to `get_result`.
    Sync,
    /// Stream child results one at a time through `accept_child_result`.
    Async,
}

/// Read-only view of the node and request a kernel is evaluating for.
pub struct EvalContext<'a> {
    pub node: &'a str,
    pub index: NodeIndex,
    pub request: &'a Request,
    pub child_labels: &'a [String],
    pub events: &'a EventEmitter,
}

impl<'a> EvalContext<'a> {
    pub fn cells(&self) -> Option<&Cells> {
        self.request.cells.as_deref()
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.request.eval_mode
    }

    /// Cells shape of the request, or an evaluation error if it has none.
    pub fn require_cells(&self) -> Result<&Cells, NodeError> {
        self.cells()
            .ok_or_else(|| NodeError::Evaluation(format!("{}: request has no cells", self.node)))
    }
}

/// What a kernel returns: its result plus any code bits of its own.
#[derive(Debug, Clone, Default)]
pub struct Produced {
    pub result: NodeResult,
    pub code: ResultCode,
}

impl Produced {
    pub fn new(result: NodeResult) -> Self {
        Self {
            result,
            code: ResultCode::NONE,
        }
    }

    pub fn value(value: impl Into<Vells>) -> Self {
        Self::new(NodeResult::new().with_vellset(VellSet::new(value)))
    }

    pub fn empty() -> Self {
        Self::new(NodeResult::new())
    }

    pub fn with_code(mut self, code: ResultCode) -> Self {
        self.code |= code;
        self
    }
}

/// Class-specific behaviour of a node. The engine owns caching, polling
/// and status; the kernel only turns child results into its own.
///
/// Children a policy chose to ignore arrive as `None`.
pub trait NodeKernel: Send {
    fn class_name(&self) -> &str;

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError>;

    /// Answers a spid discovery request. The default merges the spid maps
    /// reported by the children.
    fn discover_spids(
        &mut self,
        _ctx: &EvalContext<'_>,
        children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        let mut result = NodeResult::new();
        for child in children.iter().flatten() {
            for (spid, info) in &child.spids {
                result.spids.entry(*spid).or_insert_with(|| info.clone());
            }
        }
        Ok(Produced::new(result))
    }

    /// Applies solution increments carried by a parm update request.
    fn apply_update(
        &mut self,
        _ctx: &EvalContext<'_>,
        _updates: &BTreeMap<i32, f64>,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    fn poll_mode(&self) -> PollMode {
        PollMode::Sync
    }

    /// Receives one child result during an async poll.
    fn accept_child_result(
        &mut self,
        _ctx: &EvalContext<'_>,
        _child: usize,
        _result: &ResultRef,
        _code: ResultCode,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    fn state(&self) -> Record {
        Record::new()
    }

    fn set_state(&mut self, _state: &Record) -> Result<(), NodeError> {
        Ok(())
    }

    /// Symdeps the class always depends on, in addition to the ones its
    /// definition declares.
    fn inherent_symdeps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Validates the number of children at creation time.
    fn check_children(&self, _count: usize) -> Result<(), NodeError> {
        Ok(())
    }
}
