use meqcore::{
    ChildErrorPolicy, FailRecord, MeqError, NodeError, NodeResult, Request, ResultCode, ResultRef,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::forest::ForestShared;
use crate::mtpool::{self, BrigadeLease, PollSink, WorkOrder};
use crate::node::{ExecOutcome, NodeRef};

/// How long a polling thread sleeps on its sink between checks for abort
/// and for orders it can run itself.
const POLL_WAIT: Duration = Duration::from_millis(5);

/// Flags a child can pass up to its parent.
const PROPAGATED: ResultCode = ResultCode::from_bits(
    ResultCode::WAIT.bits()
        | ResultCode::FAIL.bits()
        | ResultCode::MISSING.bits()
        | ResultCode::ABORT.bits(),
);

struct ChildSlot {
    node: Option<NodeRef>,
    label: String,
    enabled: bool,
    last_code: ResultCode,
}

/// Result of polling a node's children.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    /// Children's dependency bits and propagated flags, after policy.
    pub code: ResultCode,
    /// Results by child index; `None` for children not polled, ignored by
    /// policy, or streamed.
    pub results: Vec<Option<ResultRef>>,
    /// Aggregate of every fail record, when FAIL or MISSING propagates.
    pub fail: Option<NodeResult>,
    pub executed: usize,
    pub ignored: usize,
    pub abandoned: bool,
}

impl PollOutcome {
    fn aborted(slots: usize) -> Self {
        Self {
            code: ResultCode::ABORT,
            results: vec![None; slots],
            ..Self::default()
        }
    }
}

enum AsyncMode {
    Serial(VecDeque<usize>),
    Brigade {
        lease: BrigadeLease,
        sink: Arc<PollSink>,
    },
}

struct AsyncPoll {
    request: Arc<Request>,
    mode: AsyncMode,
}

/// Children of one node and the machinery to poll them.
pub struct NodeNursery {
    name: String,
    shared: Arc<ForestShared>,
    slots: Vec<ChildSlot>,
    poll_order: Vec<usize>,
    fail_policy: ChildErrorPolicy,
    missing_policy: ChildErrorPolicy,
    mt_polling: bool,
    async_poll: Option<AsyncPoll>,
}

impl NodeNursery {
    pub(crate) fn new(name: impl Into<String>, shared: Arc<ForestShared>) -> Self {
        Self {
            name: name.into(),
            shared,
            slots: Vec::new(),
            poll_order: Vec::new(),
            fail_policy: ChildErrorPolicy::default(),
            missing_policy: ChildErrorPolicy::default(),
            mt_polling: true,
            async_poll: None,
        }
    }

    /// Allocates `num_children` unbound slots.
    pub fn init(&mut self, num_children: usize, name: impl Into<String>) {
        self.name = name.into();
        self.slots = (0..num_children)
            .map(|i| ChildSlot {
                node: None,
                label: i.to_string(),
                enabled: false,
                last_code: ResultCode::NONE,
            })
            .collect();
        self.poll_order = (0..num_children).collect();
        self.async_poll = None;
    }

    pub fn set_child(&mut self, n: usize, child: NodeRef, label: impl Into<String>) -> meqcore::Result<()> {
        let slot = self.slots.get_mut(n).ok_or_else(|| MeqError::NoSuchChild {
            node: self.name.clone(),
            child: n,
        })?;
        if slot.node.is_some() {
            return Err(MeqError::ChildAlreadySet {
                node: self.name.clone(),
                child: n,
            });
        }
        slot.node = Some(child);
        slot.label = label.into();
        slot.enabled = true;
        Ok(())
    }

    /// Polls the labelled children first, in the given order; the rest
    /// follow in index order.
    pub fn set_poll_order(&mut self, labels: &[String]) -> meqcore::Result<()> {
        let mut order = Vec::with_capacity(self.slots.len());
        for label in labels {
            let i = self
                .slots
                .iter()
                .position(|s| &s.label == label)
                .ok_or_else(|| MeqError::NodeNotFound(format!("{}: child '{}'", self.name, label)))?;
            if !order.contains(&i) {
                order.push(i);
            }
        }
        for i in 0..self.slots.len() {
            if !order.contains(&i) {
                order.push(i);
            }
        }
        self.poll_order = order;
        Ok(())
    }

    pub fn set_label(&mut self, n: usize, label: impl Into<String>) {
        if let Some(slot) = self.slots.get_mut(n) {
            slot.label = label.into();
        }
    }

    pub fn enable_child(&mut self, n: usize, on: bool) {
        if let Some(slot) = self.slots.get_mut(n) {
            slot.enabled = on && slot.node.is_some();
        }
    }

    pub fn set_fail_policy(&mut self, policy: ChildErrorPolicy) {
        self.fail_policy = policy;
    }

    pub fn set_missing_policy(&mut self, policy: ChildErrorPolicy) {
        self.missing_policy = policy;
    }

    pub fn fail_policy(&self) -> ChildErrorPolicy {
        self.fail_policy
    }

    pub fn missing_policy(&self) -> ChildErrorPolicy {
        self.missing_policy
    }

    pub fn set_mt_polling(&mut self, on: bool) {
        self.mt_polling = on;
    }

    pub fn mt_polling(&self) -> bool {
        self.mt_polling
    }

    pub fn num_children(&self) -> usize {
        self.slots.len()
    }

    /// Bound children, by index.
    pub fn children(&self) -> Vec<NodeRef> {
        self.slots.iter().filter_map(|s| s.node.clone()).collect()
    }

    pub fn child(&self, n: usize) -> Option<&NodeRef> {
        self.slots.get(n).and_then(|s| s.node.as_ref())
    }

    pub fn labels(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.label.clone()).collect()
    }

    pub fn last_code(&self, n: usize) -> Option<ResultCode> {
        self.slots.get(n).map(|s| s.last_code)
    }

    fn active_order(&self) -> Vec<usize> {
        self.poll_order
            .iter()
            .copied()
            .filter(|&i| self.slots[i].enabled && self.slots[i].node.is_some())
            .collect()
    }

    fn abandon_mask(&self) -> ResultCode {
        let mut mask = ResultCode::NONE;
        if self.fail_policy == ChildErrorPolicy::AbandonPropagate {
            mask |= ResultCode::FAIL;
        }
        if self.missing_policy == ChildErrorPolicy::AbandonPropagate {
            mask |= ResultCode::MISSING;
        }
        mask
    }

    fn is_ignored(&self, code: ResultCode) -> bool {
        if code.is_fail() {
            self.fail_policy == ChildErrorPolicy::Ignore
        } else if code.is_missing() {
            self.missing_policy == ChildErrorPolicy::Ignore
        } else {
            false
        }
    }

    /// Decides whether a poll of `count` children may use a brigade.
    fn check_brigade_availability(&self, count: usize) -> Option<BrigadeLease> {
        let scheduler = self.shared.scheduler();
        if !self.mt_polling
            || !self.shared.settings().mt_enabled
            || count < 2
            || scheduler.brigade_size() < 2
        {
            return None;
        }
        scheduler.lease_for_poll()
    }

    fn child_node(&self, i: usize) -> Option<NodeRef> {
        self.slots.get(i).and_then(|s| s.node.clone())
    }

    /// Runs every enabled child with `request` and collects the results.
    pub fn sync_poll(&mut self, request: &Arc<Request>) -> PollOutcome {
        if self.async_poll.is_some() {
            self.finish_poll();
        }
        let slots = self.slots.len();
        if self.shared.is_aborted() {
            return PollOutcome::aborted(slots);
        }
        let order = self.active_order();
        if order.is_empty() {
            return PollOutcome {
                results: vec![None; slots],
                ..PollOutcome::default()
            };
        }

        let (outcomes, abandoned, aborted) = match self.check_brigade_availability(order.len()) {
            Some(lease) => self.poll_on_brigade(&lease, &order, request),
            None => self.poll_serial(&order, request),
        };
        self.collect(outcomes, &order, abandoned, aborted)
    }

    fn poll_serial(
        &self,
        order: &[usize],
        request: &Arc<Request>,
    ) -> (Vec<Option<ExecOutcome>>, bool, bool) {
        let abandon_on = self.abandon_mask();
        let mut outcomes = vec![None; self.slots.len()];
        for &i in order {
            if self.shared.is_aborted() {
                return (outcomes, false, true);
            }
            let Some(child) = self.child_node(i) else {
                continue;
            };
            let outcome = child.execute(request);
            let stop = outcome.code.has(abandon_on);
            outcomes[i] = Some(outcome);
            if stop {
                tracing::debug!(node = %self.name, child = i, "abandoning poll");
                return (outcomes, true, false);
            }
        }
        (outcomes, false, false)
    }

    fn poll_on_brigade(
        &self,
        lease: &BrigadeLease,
        order: &[usize],
        request: &Arc<Request>,
    ) -> (Vec<Option<ExecOutcome>>, bool, bool) {
        let brigade = lease.brigade();
        let sink = PollSink::new(self.slots.len(), order.len(), self.abandon_mask());
        brigade.place_work_orders(self.work_orders(order, request, &sink));
        tracing::trace!(node = %self.name, brigade = brigade.id(), orders = order.len(), "dispatched poll");

        let mut aborted = false;
        loop {
            if self.shared.is_aborted() {
                brigade.purge(sink.id());
                sink.abandon();
                aborted = true;
                break;
            }
            if sink.is_abandoned() {
                brigade.purge(sink.id());
            }
            if sink.is_done() {
                break;
            }
            if let Some(own) = brigade.take_order_for(sink.id()) {
                own.run();
                continue;
            }
            sink.wait(POLL_WAIT);
        }
        let abandoned = !aborted && sink.is_abandoned();
        (sink.take_outcomes(), abandoned, aborted)
    }

    /// Orders for the children in `order`. The queue is LIFO, so the first
    /// child in poll order is built last.
    fn work_orders(
        &self,
        order: &[usize],
        request: &Arc<Request>,
        sink: &Arc<PollSink>,
    ) -> Vec<WorkOrder> {
        let mut orders = Vec::with_capacity(order.len());
        for &i in order.iter().rev() {
            match self.child_node(i) {
                Some(child) => {
                    orders.push(WorkOrder::new(child, Arc::clone(request), i, Arc::clone(sink)))
                }
                None => sink.cancel(i),
            }
        }
        orders
    }

    fn collect(
        &mut self,
        outcomes: Vec<Option<ExecOutcome>>,
        order: &[usize],
        abandoned: bool,
        aborted: bool,
    ) -> PollOutcome {
        let mut poll = PollOutcome {
            results: vec![None; self.slots.len()],
            abandoned,
            ..PollOutcome::default()
        };
        let mut fails = Vec::new();
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(outcome) => {
                    poll.executed += 1;
                    if let Some(slot) = self.slots.get_mut(i) {
                        slot.last_code = outcome.code;
                    }
                    self.absorb(&mut poll, &mut fails, i, outcome, true);
                }
                None if order.contains(&i) && !abandoned => poll.code |= ResultCode::ABORT,
                None => {}
            }
        }
        if aborted {
            poll.code |= ResultCode::ABORT;
        }
        self.finish_codes(&mut poll, fails);
        poll
    }

    /// Folds one child outcome into the poll. Returns true if the outcome
    /// should be handed to the kernel.
    fn absorb(
        &self,
        poll: &mut PollOutcome,
        fails: &mut Vec<FailRecord>,
        i: usize,
        outcome: ExecOutcome,
        keep: bool,
    ) -> bool {
        let code = outcome.code;
        if self.is_ignored(code) {
            poll.ignored += 1;
            poll.code |= code.depend_mask();
            return false;
        }
        poll.code |= code.depend_mask();
        poll.code |= ResultCode::from_bits(code.bits() & PROPAGATED.bits());
        if code.is_fail() || code.is_missing() {
            fails.extend(outcome.result.fail_records().cloned());
            if keep {
                poll.results[i] = Some(outcome.result);
            }
            return false;
        }
        if keep {
            poll.results[i] = Some(outcome.result);
        }
        true
    }

    fn finish_codes(&self, poll: &mut PollOutcome, fails: Vec<FailRecord>) {
        if self.fail_policy == ChildErrorPolicy::Ignore {
            poll.code = poll.code.without(ResultCode::FAIL);
        }
        if self.missing_policy == ChildErrorPolicy::Ignore {
            poll.code = poll.code.without(ResultCode::MISSING);
        }
        if poll.code.is_fail() || poll.code.is_missing() {
            let fails = if fails.is_empty() {
                vec![FailRecord::fail(
                    "child reported failure without fail records",
                    &self.name,
                    "",
                )]
            } else {
                fails
            };
            poll.fail = Some(NodeResult::from_fails(fails));
        }
    }

    /// Starts polling the enabled children one result at a time. Returns
    /// the number of results to await.
    pub fn start_async_poll(&mut self, request: &Arc<Request>) -> usize {
        if self.async_poll.is_some() {
            self.finish_poll();
        }
        if self.shared.is_aborted() {
            return 0;
        }
        let order = self.active_order();
        if order.is_empty() {
            return 0;
        }
        let count = order.len();
        let mode = match self.check_brigade_availability(count) {
            Some(lease) => {
                let sink = PollSink::new(self.slots.len(), count, self.abandon_mask());
                lease
                    .brigade()
                    .place_work_orders(self.work_orders(&order, request, &sink));
                AsyncMode::Brigade { lease, sink }
            }
            None => AsyncMode::Serial(order.into_iter().collect()),
        };
        self.async_poll = Some(AsyncPoll {
            request: Arc::clone(request),
            mode,
        });
        count
    }

    /// Next child result of the current async poll, as `(child, outcome)`.
    /// `None` once every child has reported or the poll was aborted.
    pub fn await_child_result(&mut self) -> Option<(usize, ExecOutcome)> {
        let poll = self.async_poll.as_mut()?;
        let next = match &mut poll.mode {
            AsyncMode::Serial(pending) => {
                if self.shared.is_aborted() {
                    pending.clear();
                    None
                } else {
                    pending.pop_front().and_then(|i| {
                        let child = self.slots.get(i).and_then(|s| s.node.clone())?;
                        Some((i, child.execute(&poll.request)))
                    })
                }
            }
            AsyncMode::Brigade { lease, sink } => loop {
                if let Some(done) = sink.next_completed() {
                    break Some(done);
                }
                if self.shared.is_aborted() {
                    lease.brigade().purge(sink.id());
                    sink.abandon();
                    break None;
                }
                if sink.is_done() {
                    break None;
                }
                if let Some(own) = lease.brigade().take_order_for(sink.id()) {
                    own.run();
                    continue;
                }
                sink.wait(POLL_WAIT);
            },
        };
        if let Some((i, outcome)) = &next {
            if let Some(slot) = self.slots.get_mut(*i) {
                slot.last_code = outcome.code;
            }
        }
        next
    }

    /// Streams every child result through `accept`, applying the same
    /// policies as `sync_poll`. Results are not retained. An error from
    /// `accept` aborts the poll.
    pub fn stream_poll<F>(&mut self, request: &Arc<Request>, mut accept: F) -> Result<PollOutcome, NodeError>
    where
        F: FnMut(usize, &ExecOutcome) -> Result<(), NodeError>,
    {
        let slots = self.slots.len();
        if self.shared.is_aborted() {
            return Ok(PollOutcome::aborted(slots));
        }
        let expected = self.start_async_poll(request);
        let abandon_on = self.abandon_mask();
        let mut poll = PollOutcome {
            results: vec![None; slots],
            ..PollOutcome::default()
        };
        let mut fails = Vec::new();
        let mut received = 0;
        while let Some((i, outcome)) = self.await_child_result() {
            received += 1;
            poll.executed += 1;
            let stop = outcome.code.has(abandon_on);
            let shown = outcome.clone();
            if self.absorb(&mut poll, &mut fails, i, outcome, false) {
                if let Err(e) = accept(i, &shown) {
                    self.abort_poll();
                    return Err(e);
                }
            }
            if stop {
                poll.abandoned = true;
                self.abort_poll();
                break;
            }
        }
        if !poll.abandoned && received < expected {
            poll.code |= ResultCode::ABORT;
        }
        self.finish_poll();
        self.finish_codes(&mut poll, fails);
        Ok(poll)
    }

    /// Fire-and-forget poll; results are discarded.
    pub fn background_poll(&mut self, request: &Arc<Request>) {
        let order = self.active_order();
        if order.is_empty() || self.shared.is_aborted() {
            return;
        }
        let brigade = mtpool::current()
            .filter(|b| self.mt_polling && self.shared.settings().mt_enabled && b.stats().active);
        match brigade {
            Some(brigade) => {
                let sink = PollSink::new(self.slots.len(), order.len(), ResultCode::NONE);
                for wo in self.work_orders(&order, request, &sink) {
                    brigade.place_work_order(wo);
                }
            }
            None => {
                for &i in &order {
                    if self.shared.is_aborted() {
                        break;
                    }
                    if let Some(child) = self.child_node(i) {
                        let outcome = child.execute(request);
                        if let Some(slot) = self.slots.get_mut(i) {
                            slot.last_code = outcome.code;
                        }
                    }
                }
            }
        }
    }

    /// Ends the current async poll, waiting for orders already running.
    pub fn finish_poll(&mut self) {
        let Some(poll) = self.async_poll.take() else {
            return;
        };
        if let AsyncMode::Brigade { lease, sink } = poll.mode {
            lease.brigade().purge(sink.id());
            while !sink.wait(POLL_WAIT) {
                if self.shared.is_aborted() {
                    break;
                }
            }
            drop(lease);
        }
    }

    /// Ends the current async poll without waiting for running orders.
    pub fn abort_poll(&mut self) {
        let Some(poll) = self.async_poll.take() else {
            return;
        };
        if let AsyncMode::Brigade { lease, sink } = poll.mode {
            sink.abandon();
            lease.brigade().purge(sink.id());
            drop(lease);
        }
    }
}
