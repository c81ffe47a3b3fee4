use meqcore::{Request, ResultCode};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::node::{ExecOutcome, NodeRef};

static NEXT_SINK_ID: AtomicUsize = AtomicUsize::new(1);

/// Collects the outcomes of one poll's work orders.
pub struct PollSink {
    id: usize,
    abandon_on: ResultCode,
    state: Mutex<SinkState>,
    cond: Condvar,
}

struct SinkState {
    outcomes: Vec<Option<ExecOutcome>>,
    outstanding: usize,
    completed: VecDeque<usize>,
    abandoned: bool,
}

impl PollSink {
    /// Sink for `slots` children of which `outstanding` will be ordered.
    /// An outcome carrying any flag of `abandon_on` abandons the poll.
    pub fn new(slots: usize, outstanding: usize, abandon_on: ResultCode) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            abandon_on,
            state: Mutex::new(SinkState {
                outcomes: vec![None; slots],
                outstanding,
                completed: VecDeque::new(),
                abandoned: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn deliver(&self, slot: usize, outcome: ExecOutcome) {
        let mut st = self.state.lock();
        if outcome.code.has(self.abandon_on) {
            st.abandoned = true;
        }
        if let Some(entry) = st.outcomes.get_mut(slot) {
            *entry = Some(outcome);
        }
        st.completed.push_back(slot);
        st.outstanding = st.outstanding.saturating_sub(1);
        self.cond.notify_all();
    }

    /// The order for `slot` was dropped without running.
    pub fn cancel(&self, _slot: usize) {
        let mut st = self.state.lock();
        st.outstanding = st.outstanding.saturating_sub(1);
        self.cond.notify_all();
    }

    pub fn abandon(&self) {
        self.state.lock().abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().outstanding == 0
    }

    /// Waits for the next delivery, up to `timeout`. Returns true once
    /// nothing is outstanding.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut st = self.state.lock();
        if st.outstanding > 0 && st.completed.is_empty() {
            self.cond.wait_for(&mut st, timeout);
        }
        st.outstanding == 0
    }

    /// Next completed slot, with a copy of its outcome.
    pub fn next_completed(&self) -> Option<(usize, ExecOutcome)> {
        let mut st = self.state.lock();
        let slot = st.completed.pop_front()?;
        let outcome = st.outcomes.get(slot).cloned().flatten()?;
        Some((slot, outcome))
    }

    pub fn take_outcomes(&self) -> Vec<Option<ExecOutcome>> {
        let mut st = self.state.lock();
        st.completed.clear();
        std::mem::take(&mut st.outcomes)
    }
}

/// Execution of one child for one poll, queued on a brigade.
pub struct WorkOrder {
    child: NodeRef,
    request: Arc<Request>,
    slot: usize,
    sink: Arc<PollSink>,
    done: bool,
}

impl WorkOrder {
    pub fn new(child: NodeRef, request: Arc<Request>, slot: usize, sink: Arc<PollSink>) -> Self {
        Self {
            child,
            request,
            slot,
            sink,
            done: false,
        }
    }

    pub fn sink_id(&self) -> usize {
        self.sink.id
    }

    pub fn run(mut self) {
        if self.sink.is_abandoned() {
            return;
        }
        tracing::trace!(node = %self.child.name(), slot = self.slot, "running work order");
        let outcome = self.child.execute(&self.request);
        self.sink.deliver(self.slot, outcome);
        self.done = true;
    }
}

impl Drop for WorkOrder {
    fn drop(&mut self) {
        if !self.done {
            self.sink.cancel(self.slot);
        }
    }
}
