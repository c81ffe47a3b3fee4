use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{BreakpointMask, CachePolicy, ChildErrorPolicy, NodeIndex, Record, ResamplePolicy, Value};

/// Complete forest definition, as loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForestDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: ForestSettings,
    pub nodes: Vec<NodeSpec>,
}

impl ForestDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Reference to a child, by name or by node index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildRef {
    Index(NodeIndex),
    Name(String),
}

impl From<&str> for ChildRef {
    fn from(s: &str) -> Self {
        ChildRef::Name(s.to_string())
    }
}

impl From<String> for ChildRef {
    fn from(s: String) -> Self {
        ChildRef::Name(s)
    }
}

impl From<NodeIndex> for ChildRef {
    fn from(i: NodeIndex) -> Self {
        ChildRef::Index(i)
    }
}

impl std::fmt::Display for ChildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildRef::Index(i) => write!(f, "{}", i),
            ChildRef::Name(n) => f.write_str(n),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Init record of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub class: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_index: Option<NodeIndex>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildRef>,
    /// Labels of the children, by position; unlabeled children get their index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_labels: Vec<String>,
    /// Children polled in the background; their results are discarded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stepchildren: Vec<ChildRef>,
    /// Poll order by child label; children not named are polled afterwards
    /// in index order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poll_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_policy: Option<CachePolicy>,
    #[serde(default)]
    pub fail_policy: ChildErrorPolicy,
    #[serde(default)]
    pub missing_policy: ChildErrorPolicy,
    #[serde(default)]
    pub auto_resample: ResamplePolicy,
    /// Symbolic dependencies this node declares active.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symdeps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_parents: Option<usize>,
    #[serde(default = "default_true")]
    pub mt_polling: bool,
    #[serde(default)]
    pub publish_level: u8,
    #[serde(default)]
    pub log_results: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<BreakpointMask>,
    #[serde(default)]
    pub config: Record,
}

impl NodeSpec {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            node_index: None,
            children: Vec::new(),
            child_labels: Vec::new(),
            stepchildren: Vec::new(),
            poll_order: Vec::new(),
            cache_policy: None,
            fail_policy: ChildErrorPolicy::default(),
            missing_policy: ChildErrorPolicy::default(),
            auto_resample: ResamplePolicy::default(),
            symdeps: Vec::new(),
            active_parents: None,
            mt_polling: true,
            publish_level: 0,
            log_results: false,
            breakpoint: None,
            config: Record::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn with_child(mut self, child: impl Into<ChildRef>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_children<I, C>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChildRef>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    pub fn with_stepchild(mut self, child: impl Into<ChildRef>) -> Self {
        self.stepchildren.push(child.into());
        self
    }

    pub fn with_index(mut self, index: NodeIndex) -> Self {
        self.node_index = Some(index);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn with_fail_policy(mut self, policy: ChildErrorPolicy) -> Self {
        self.fail_policy = policy;
        self
    }

    pub fn with_missing_policy(mut self, policy: ChildErrorPolicy) -> Self {
        self.missing_policy = policy;
        self
    }

    pub fn with_resample(mut self, policy: ResamplePolicy) -> Self {
        self.auto_resample = policy;
        self
    }

    pub fn with_symdep(mut self, symdep: impl Into<String>) -> Self {
        self.symdeps.push(symdep.into());
        self
    }

    pub fn with_poll_order<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.poll_order = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_active_parents(mut self, n: usize) -> Self {
        self.active_parents = Some(n);
        self
    }

    pub fn without_mt(mut self) -> Self {
        self.mt_polling = false;
        self
    }

    pub fn with_breakpoint(mut self, mask: BreakpointMask) -> Self {
        self.breakpoint = Some(mask);
        self
    }

    pub fn with_publish_level(mut self, level: u8) -> Self {
        self.publish_level = level;
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.log_results = true;
        self
    }

    /// Label of child `i`.
    pub fn child_label(&self, i: usize) -> String {
        self.child_labels
            .get(i)
            .cloned()
            .unwrap_or_else(|| i.to_string())
    }
}

fn default_brigade_size() -> usize {
    4
}

fn default_max_active() -> usize {
    2
}

fn default_event_buffer() -> usize {
    1000
}

/// Global forest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestSettings {
    /// Threads per brigade, counting the thread that joins it.
    #[serde(default = "default_brigade_size")]
    pub brigade_size: usize,
    /// Cap on brigades dispatching work at the same time.
    #[serde(default = "default_max_active")]
    pub max_active_brigades: usize,
    #[serde(default = "default_true")]
    pub mt_enabled: bool,
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,
    #[serde(default)]
    pub default_cache_policy: CachePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_append: bool,
}

impl Default for ForestSettings {
    fn default() -> Self {
        Self {
            brigade_size: default_brigade_size(),
            max_active_brigades: default_max_active(),
            mt_enabled: true,
            event_buffer_size: default_event_buffer(),
            default_cache_policy: CachePolicy::default(),
            log_file: None,
            log_append: false,
        }
    }
}

impl ForestSettings {
    /// Settings with multithreaded polling switched off.
    pub fn single_threaded() -> Self {
        Self {
            mt_enabled: false,
            ..Self::default()
        }
    }
}
