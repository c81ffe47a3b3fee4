use meqcore::{NodeError, NodeSpec, RequestId, ResultCode, ResultRef, Vells};
use meqruntime::{EvalContext, NodeFactory, NodeKernel, NodeMetadata, PollMode, Produced};

/// Sums its children as their results arrive, without holding on to them.
#[derive(Default)]
pub struct SumStreamNode {
    request: Option<RequestId>,
    total: Option<Vells>,
    received: usize,
}

impl SumStreamNode {
    fn reset_for(&mut self, id: &RequestId) {
        if self.request.as_ref() != Some(id) {
            self.request = Some(id.clone());
            self.total = None;
            self.received = 0;
        }
    }
}

impl NodeKernel for SumStreamNode {
    fn class_name(&self) -> &str {
        "meq.sum_stream"
    }

    fn poll_mode(&self) -> PollMode {
        PollMode::Async
    }

    fn accept_child_result(
        &mut self,
        ctx: &EvalContext<'_>,
        child: usize,
        result: &ResultRef,
        _code: ResultCode,
    ) -> Result<(), NodeError> {
        self.reset_for(&ctx.request.id);
        let value = result
            .vellsets
            .first()
            .and_then(|vs| vs.value.as_ref())
            .ok_or_else(|| NodeError::InvalidInput {
                child,
                reason: "result has no value".to_string(),
            })?;
        self.total = Some(match self.total.take() {
            None => value.clone(),
            Some(acc) => acc.combine(value, |a, b| a + b)?,
        });
        self.received += 1;
        tracing::trace!(node = ctx.node, child, received = self.received, "accepted child result");
        Ok(())
    }

    fn get_result(
        &mut self,
        ctx: &EvalContext<'_>,
        _children: &[Option<ResultRef>],
    ) -> Result<Produced, NodeError> {
        self.reset_for(&ctx.request.id);
        let total = self.total.take().unwrap_or(Vells::Scalar(0.0));
        // The next execution starts from scratch, even for the same id.
        self.request = None;
        Ok(Produced::value(total))
    }
}

pub struct SumStreamNodeFactory;

impl NodeFactory for SumStreamNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Box<dyn NodeKernel>, NodeError> {
        Ok(Box::new(SumStreamNode::default()))
    }

    fn class_name(&self) -> &str {
        "meq.sum_stream"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Sums child results one at a time as they complete".to_string(),
            category: "function".to_string(),
            ..NodeMetadata::default()
        }
    }
}
