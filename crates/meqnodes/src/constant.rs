use meqcore::{NodeError, NodeSpec, Record, ResultRef, Value, Vells};
use meqruntime::{ConfigField, EvalContext, NodeFactory, NodeKernel, NodeMetadata, Produced};

/// A fixed scalar or array value
pub struct ConstantNode {
    value: Vells,
}

impl ConstantNode {
    pub fn new(value: Vells) -> Self {
        Self { value }
    }

    fn from_config(config: &Record) -> Result<Self, NodeError> {
        let value = match config.get("value") {
            None => Vells::Scalar(0.0),
            Some(v) => parse_value(v, config.get("shape"))?,
        };
        Ok(Self { value })
    }
}

fn parse_value(value: &Value, shape: Option<&Value>) -> Result<Vells, NodeError> {
    if let Some(x) = value.as_f64() {
        return Ok(Vells::Scalar(x));
    }
    let data = value
        .to_f64_vec()
        .ok_or_else(|| NodeError::Configuration("value must be a number or a list of numbers".to_string()))?;
    let shape = match shape.and_then(Value::to_f64_vec) {
        Some(dims) => dims.into_iter().map(|d| d as usize).collect(),
        None => vec![data.len()],
    };
    Vells::array(shape, data)
}

impl NodeKernel for ConstantNode {
    fn class_name(&self) -> &str {
        "meq.constant"
    }

    fn get_result(
        &mut self,
        _ctx: &EvalContext<'_>,
        _children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        Ok(Produced::value(self.value.clone()))
    }

    fn check_children(&self, count: usize) -> Result<(), NodeError> {
        if count > 0 {
            return Err(NodeError::Configuration("a constant has no children".to_string()));
        }
        Ok(())
    }

    fn state(&self) -> Record {
        match &self.value {
            Vells::Scalar(v) => Record::new().with("value", *v),
            Vells::Array { shape, data } => Record::new()
                .with("value", data.as_ref().clone())
                .with("shape", shape.iter().map(|&d| d as f64).collect::<Vec<_>>()),
        }
    }

    fn set_state(&mut self, state: &Record) -> Result<(), NodeError> {
        if let Some(value) = state.get("value") {
            self.value = parse_value(value, state.get("shape"))?;
        }
        Ok(())
    }
}

pub struct ConstantNodeFactory;

impl NodeFactory for ConstantNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> {
        Ok(Box::new(ConstantNode::from_config(&spec.config)?))
    }

    fn class_name(&self) -> &str {
        "meq.constant"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Constant scalar or array value".to_string(),
            category: "source".to_string(),
            min_children: 0,
            max_children: Some(0),
            config: vec![
                ConfigField::new("value", "number or list of numbers", false),
                ConfigField::new("shape", "array shape for a list value", false),
            ],
        }
    }
}
