use thiserror::Error;

use crate::NodeIndex;

#[derive(Error, Debug)]
pub enum MeqError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Invalid node index: {0}")]
    InvalidNodeIndex(NodeIndex),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown node class: {0}")]
    UnknownNodeClass(String),

    #[error("Duplicate node name: {0}")]
    DuplicateName(String),

    #[error("Node index {0} already in use")]
    IndexInUse(NodeIndex),

    #[error("Failed to create node '{name}': {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Child {child} of node '{node}' is already set")]
    ChildAlreadySet { node: String, child: usize },

    #[error("Node '{node}' has no child slot {child}")]
    NoSuchChild { node: String, child: usize },

    #[error("Cyclic dependency detected involving node '{0}'")]
    CyclicDependency(String),

    #[error("Unknown symdep: {0}")]
    UnknownSymdep(String),

    #[error("Dependency mask exhausted, cannot add symdep '{0}'")]
    SymdepsExhausted(String),

    #[error("Invalid state record: {0}")]
    InvalidState(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Invalid request id: {0}")]
    InvalidRequestId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures raised while a node computes its result. These never cross a
/// node boundary as errors: `Node::execute` turns them into FAIL (or MISSING)
/// results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("{0}")]
    Evaluation(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Invalid input from child {child}: {reason}")]
    InvalidInput { child: usize, reason: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Cells mismatch: {0}")]
    CellsMismatch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn is_missing_data(&self) -> bool {
        matches!(self, NodeError::MissingData(_))
    }
}
