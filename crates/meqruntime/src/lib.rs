//! Forest execution runtime
//!
//! This crate provides the engine that evaluates node trees: the brigade
//! thread pool, child polling, per-node caching and breakpoints, and the
//! forest that owns every node.

mod forest;
mod kernel;
pub mod loader;
pub mod mtpool;
mod node;
mod nursery;
mod registry;

pub use forest::{read_log, Forest, ForestObserver, LogMode, LogRecord, StopSignal};
pub use loader::{load_definition, save_definition, validate_definition};
pub use mtpool::{Scheduler, SchedulerStats};
pub use kernel::{EvalContext, NodeKernel, PollMode, Produced};
pub use node::{ExecOutcome, Node, NodeRef, NodeStats};
pub use nursery::{NodeNursery, PollOutcome};
pub use registry::{ConfigField, FnFactory, NodeFactory, NodeMetadata, NodeRegistry};
