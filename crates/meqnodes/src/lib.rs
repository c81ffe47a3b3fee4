//! Standard node library
//!
//! Basic node classes for building and exercising forests: sources,
//! element-wise functions and a streaming sum.

mod constant;
mod fail;
pub mod funklet;
mod function;
mod parm;
mod stream;

pub use constant::{ConstantNode, ConstantNodeFactory};
pub use fail::{FailNode, FailNodeFactory};
pub use funklet::{Funklet, Polc};
pub use function::{FunctionNode, FunctionNodeFactory, Op};
pub use parm::{ParmNode, ParmNodeFactory, DEFAULT_PERTURBATION};
pub use stream::{SumStreamNode, SumStreamNodeFactory};
use meqruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(ConstantNodeFactory));
    registry.register(Arc::new(ParmNodeFactory));
    registry.register(Arc::new(FunctionNodeFactory::new(Op::Add)));
    registry.register(Arc::new(FunctionNodeFactory::new(Op::Multiply)));
    registry.register(Arc::new(FailNodeFactory));
    registry.register(Arc::new(SumStreamNodeFactory));
}

/// A registry holding the standard classes.
pub fn standard_registry() -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    Arc::new(registry)
}
