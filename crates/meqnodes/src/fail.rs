use meqcore::{NodeError, NodeSpec, ResultRef};
use meqruntime::{ConfigField, EvalContext, NodeFactory, NodeKernel, NodeMetadata, Produced};

/// Always fails, or reports missing data with `missing`. Children are
/// polled but ignored.
pub struct FailNode {
    message: String,
    missing: bool,
}

impl NodeKernel for FailNode {
    fn class_name(&self) -> &str {
        "meq.fail"
    }

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        _children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        ctx.events.warn(format!("failing on purpose: {}", self.message));
        if self.missing {
            Err(NodeError::MissingData(self.message.clone()))
        } else {
            Err(NodeError::Evaluation(self.message.clone()))
        }
    }
}

pub struct FailNodeFactory;

impl NodeFactory for FailNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> {
        Ok(Box::new(FailNode {
            message: spec.config.get_str("message").unwrap_or("failed").to_string(),
            missing: spec.config.get_bool("missing").unwrap_or(false),
        }))
    }

    fn class_name(&self) -> &str {
        "meq.fail"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Fails with a configured message".to_string(),
            category: "debug".to_string(),
            config: vec![
                ConfigField::new("message", "fail message", false),
                ConfigField::new("missing", "report missing data instead of a failure", false),
            ],
            ..NodeMetadata::default()
        }
    }
}
