use crate::kernel::NodeKernel;
use meqcore::{MeqError, NodeError, NodeSpec};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node kernels
pub trait NodeFactory: Send + Sync {
    /// Create a new kernel from the node's definition
    fn create(&self, spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError>;

    /// Class name, e.g. "meq.parm"
    fn class_name(&self) -> &str;

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node class
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub min_children: usize,
    pub max_children: Option<usize>,
    pub config: Vec<ConfigField>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            min_children: 0,
            max_children: None,
            config: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ConfigField {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }
}

type CreateFn = dyn Fn(&NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> + Send + Sync;

/// Factory backed by a closure.
pub struct FnFactory {
    class: String,
    metadata: NodeMetadata,
    create: Box<CreateFn>,
}

impl FnFactory {
    pub fn new<F>(class: impl Into<String>, create: F) -> Self
    where
        F: Fn(&NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> + Send + Sync + 'static,
    {
        Self {
            class: class.into(),
            metadata: NodeMetadata::default(),
            create: Box::new(create),
        }
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl NodeFactory for FnFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> {
        (self.create)(spec)
    }

    fn class_name(&self) -> &str {
        &self.class
    }

    fn metadata(&self) -> NodeMetadata {
        self.metadata.clone()
    }
}

/// Registry of available node classes
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let class = factory.class_name().to_string();
        tracing::info!("Registering node class: {}", class);
        self.factories.insert(class, factory);
    }

    pub fn register_fn<F>(&mut self, class: impl Into<String>, create: F)
    where
        F: Fn(&NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory::new(class, create)));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Create a kernel for the class named in the `NodeSpec`
    pub fn create_kernel(&self, spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, MeqError> {
        let factory = self
            .factories
            .get(&spec.class)
            .ok_or_else(|| MeqError::UnknownNodeClass(spec.class.clone()))?;

        factory.create(spec).map_err(|e| MeqError::CreateFailed {
            name: spec.name.clone(),
            reason: e.to_string(),
        })
    }

    /// All registered class names, sorted
    pub fn list_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn metadata(&self, class: &str) -> Option<NodeMetadata> {
        self.factories.get(class).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
