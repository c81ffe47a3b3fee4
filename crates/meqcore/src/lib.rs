//! Core abstractions for the MeqTree engine
//!
//! This crate provides the data model every other component depends on:
//! request ids and dependency masks, cells and results, control status
//! words, policies and forest definitions. Execution lives in `meqruntime`.

mod cells;
mod control;
mod definition;
mod depend;
mod error;
pub mod events;
mod policy;
mod request;
mod request_id;
mod result;
mod result_code;
mod value;
mod vells;

pub use cells::{Axis, Cells, FREQ, TIME};
pub use control::{BreakpointMask, ControlStatus, ExecState, ResultType};
pub use definition::{ChildRef, ForestDefinition, ForestSettings, NodeSpec};
pub use depend::{symdeps, DependMask, RQIDM_NBITS};
pub use error::{MeqError, NodeError};
pub use policy::{CachePolicy, ChildErrorPolicy, ResamplePolicy};
pub use request::{EvalMode, NodeCommand, Request, Rider, Service};
pub use request_id::RequestId;
pub use result::{FailKind, FailRecord, NodeResult, PerturbedSet, ResultRef, SpidInfo, VellSet};
pub use result_code::ResultCode;
pub use value::{Record, Value};
pub use vells::Vells;
pub use events::*;

/// Result type for engine bookkeeping operations
pub type Result<T> = std::result::Result<T, MeqError>;

/// Handle of a node in the forest repository. Index 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    pub const INVALID: NodeIndex = NodeIndex(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn slot(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
