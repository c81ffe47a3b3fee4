//! Node: the unit of evaluation
//!
//! A node wraps a class kernel with the machinery every node shares: the
//! result cache, the control status word, breakpoints, child polling and
//! rider commands. `execute` is the only entry point for evaluation.
//!
//! Each node has two locks. The exec lock serializes executions; the state
//! lock guards the cache and status and is dropped while children are
//! polled or the kernel runs. A node never locks another node's state while
//! holding its own.

mod breakpoints;
mod cache;
mod cells_check;
mod commands;
mod state;

use meqcore::{
    BreakpointMask, CachePolicy, ChildRef, ControlStatus, DependMask, EventEmitter,
    ExecState, FailRecord, ForestEvent, NodeError, NodeIndex, NodeResult, NodeSpec, Request,
    RequestId, ResamplePolicy, ResultCode, ResultRef, ResultType, Service,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crate::forest::ForestShared;
use crate::kernel::{EvalContext, NodeKernel, PollMode, Produced};
use crate::mtpool;
use crate::nursery::NodeNursery;
use cache::{CacheEntry, ParentInfo, RequestKind, Retention};

pub type NodeRef = Arc<Node>;

/// What `Node::execute` hands back to the caller.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub code: ResultCode,
    pub result: ResultRef,
}

impl ExecOutcome {
    pub fn new(code: ResultCode, result: ResultRef) -> Self {
        Self { code, result }
    }

    pub fn aborted() -> Self {
        Self::new(ResultCode::ABORT, Arc::new(NodeResult::new()))
    }

    pub fn fail(record: FailRecord) -> Self {
        Self::new(ResultCode::FAIL, Arc::new(NodeResult::from_fails(vec![record])))
    }

    pub fn is_abort(&self) -> bool {
        self.code.is_abort()
    }

    pub fn is_fail(&self) -> bool {
        self.code.is_fail()
    }

    pub fn scalar(&self) -> Option<f64> {
        self.result.scalar()
    }
}

/// Execution counters of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub executions: u64,
    pub cache_hits: u64,
    pub evaluations: u64,
    pub fails: u64,
    /// Smart-cache decisions made without a next-request id.
    pub missing_next_hints: u64,
}

pub(crate) struct NodeState {
    control: ControlStatus,
    cache: Option<CacheEntry>,
    parents: ParentInfo,
    cache_policy: CachePolicy,
    auto_resample: ResamplePolicy,
    publish_level: u8,
    log_results: bool,
    breakpoint: BreakpointMask,
    breakpoint_ss: BreakpointMask,
    /// Last request whose rider commands were applied.
    current_rqid: RequestId,
    own_mask: DependMask,
    /// Own mask plus everything the children reported.
    depend_mask: DependMask,
    depend_known: bool,
    missing_hint_logged: bool,
    stats: NodeStats,
}

pub(crate) struct ExecSide {
    kernel: Box<dyn NodeKernel>,
    children: NodeNursery,
    stepchildren: NodeNursery,
}

#[derive(Default)]
struct Links {
    children: Vec<NodeRef>,
    stepchildren: Vec<NodeRef>,
}

pub struct Node {
    index: NodeIndex,
    name: String,
    class: String,
    shared: Arc<ForestShared>,
    events: EventEmitter,
    child_refs: Vec<ChildRef>,
    stepchild_refs: Vec<ChildRef>,
    child_labels: Vec<String>,
    poll_order: Vec<String>,
    exec: Mutex<ExecSide>,
    exec_owner: Mutex<Option<ThreadId>>,
    state: Mutex<NodeState>,
    links: RwLock<Links>,
    parents: RwLock<Vec<Weak<Node>>>,
    resolved: AtomicBool,
}

/// Marks the calling brigade member as blocked while it waits on a node
/// that another thread is executing.
struct BlockedGuard(Option<Arc<mtpool::Brigade>>);

impl BlockedGuard {
    fn new() -> Self {
        let brigade = mtpool::current();
        if let Some(b) = &brigade {
            b.mark_as_blocked();
        }
        Self(brigade)
    }
}

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        if let Some(b) = &self.0 {
            b.mark_as_unblocked();
        }
    }
}

struct OwnerGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl Node {
    pub(crate) fn new(
        index: NodeIndex,
        spec: &NodeSpec,
        kernel: Box<dyn NodeKernel>,
        shared: Arc<ForestShared>,
        own_mask: DependMask,
    ) -> meqcore::Result<Self> {
        let mut children = NodeNursery::new(&spec.name, Arc::clone(&shared));
        children.init(spec.children.len(), &spec.name);
        children.set_fail_policy(spec.fail_policy);
        children.set_missing_policy(spec.missing_policy);
        children.set_mt_polling(spec.mt_polling);

        let mut stepchildren = NodeNursery::new(&spec.name, Arc::clone(&shared));
        stepchildren.init(spec.stepchildren.len(), &spec.name);
        stepchildren.set_mt_polling(spec.mt_polling);

        let breakpoint = spec.breakpoint.unwrap_or_default();
        let mut control = ControlStatus::default();
        control.set(ControlStatus::BREAKPOINT, !breakpoint.is_empty());
        control.set(ControlStatus::PUBLISHING, spec.publish_level > 0);

        let state = NodeState {
            control,
            cache: None,
            parents: ParentInfo {
                active_parents: spec.active_parents,
                ..ParentInfo::default()
            },
            cache_policy: spec
                .cache_policy
                .unwrap_or(shared.settings().default_cache_policy),
            auto_resample: spec.auto_resample,
            publish_level: spec.publish_level,
            log_results: spec.log_results,
            breakpoint,
            breakpoint_ss: BreakpointMask::NONE,
            current_rqid: RequestId::empty(),
            own_mask,
            depend_mask: own_mask,
            depend_known: false,
            missing_hint_logged: false,
            stats: NodeStats::default(),
        };

        Ok(Self {
            index,
            name: spec.name.clone(),
            class: spec.class.clone(),
            events: shared.emitter(&spec.name),
            shared,
            child_refs: spec.children.clone(),
            stepchild_refs: spec.stepchildren.clone(),
            child_labels: (0..spec.children.len()).map(|i| spec.child_label(i)).collect(),
            poll_order: spec.poll_order.clone(),
            exec: Mutex::new(ExecSide {
                kernel,
                children,
                stepchildren,
            }),
            exec_owner: Mutex::new(None),
            state: Mutex::new(state),
            links: RwLock::new(Links::default()),
            parents: RwLock::new(Vec::new()),
            resolved: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub(crate) fn child_refs(&self) -> &[ChildRef] {
        &self.child_refs
    }

    pub(crate) fn stepchild_refs(&self) -> &[ChildRef] {
        &self.stepchild_refs
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Binds the resolved children and registers this node as their parent.
    pub(crate) fn link_children(
        self: &Arc<Self>,
        children: Vec<NodeRef>,
        stepchildren: Vec<NodeRef>,
    ) -> meqcore::Result<()> {
        {
            let mut exec = self.exec.lock();
            for (i, child) in children.iter().enumerate() {
                let label = self.child_labels.get(i).cloned().unwrap_or_else(|| i.to_string());
                exec.children.set_child(i, Arc::clone(child), label)?;
            }
            if !self.poll_order.is_empty() {
                exec.children.set_poll_order(&self.poll_order)?;
            }
            for (i, child) in stepchildren.iter().enumerate() {
                exec.stepchildren
                    .set_child(i, Arc::clone(child), format!("step{}", i))?;
            }
        }
        for child in children.iter().chain(&stepchildren) {
            child.add_parent(Arc::downgrade(self));
        }
        *self.links.write() = Links {
            children,
            stepchildren,
        };
        self.resolved.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn add_parent(&self, parent: Weak<Node>) {
        let mut parents = self.parents.write();
        parents.push(parent);
        let n = parents.len();
        drop(parents);
        self.state.lock().parents.num_parents = n;
    }

    pub fn children(&self) -> Vec<NodeRef> {
        self.links.read().children.clone()
    }

    pub fn stepchildren(&self) -> Vec<NodeRef> {
        self.links.read().stepchildren.clone()
    }

    pub fn child_labels(&self) -> &[String] {
        &self.child_labels
    }

    pub fn num_parents(&self) -> usize {
        self.state.lock().parents.num_parents
    }

    pub(crate) fn parent_nodes(&self) -> Vec<NodeRef> {
        self.parents.read().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn control_status(&self) -> ControlStatus {
        self.state.lock().control
    }

    pub fn is_active(&self) -> bool {
        self.control_status().is_active()
    }

    pub fn set_active(&self, active: bool) {
        let mut st = self.state.lock();
        self.update_control(&mut st, |c| c.set(ControlStatus::ACTIVE, active));
    }

    pub fn stats(&self) -> NodeStats {
        self.state.lock().stats
    }

    pub fn depend_mask(&self) -> DependMask {
        self.state.lock().depend_mask
    }

    pub fn own_mask(&self) -> DependMask {
        self.state.lock().own_mask
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.state.lock().cache_policy
    }

    pub fn set_cache_policy(&self, policy: CachePolicy) {
        let mut st = self.state.lock();
        st.cache_policy = policy;
        if policy == CachePolicy::Never {
            self.drop_cache(&mut st);
        }
    }

    pub fn set_publish_level(&self, level: u8) {
        let mut st = self.state.lock();
        st.publish_level = level;
        self.update_control(&mut st, |c| c.set(ControlStatus::PUBLISHING, level > 0));
    }

    pub fn has_cache(&self) -> bool {
        self.state.lock().cache.is_some()
    }

    pub fn cached_result(&self) -> Option<(ResultRef, ResultCode)> {
        self.state
            .lock()
            .cache
            .as_ref()
            .map(|c| (Arc::clone(&c.result), c.code))
    }

    pub fn cached_request_id(&self) -> Option<RequestId> {
        self.state.lock().cache.as_ref().map(|c| c.request_id.clone())
    }

    /// Clears this node's cache, and with `recursive` every cache below it.
    pub fn clear_cache(&self, recursive: bool) {
        {
            let mut st = self.state.lock();
            self.drop_cache(&mut st);
        }
        if recursive {
            for child in self.children().iter().chain(self.stepchildren().iter()) {
                child.clear_cache(true);
            }
        }
    }

    fn drop_cache(&self, st: &mut NodeState) {
        if st.cache.take().is_some() {
            st.parents.reset();
            self.update_control(st, |c| c.set(ControlStatus::CACHED, false));
        }
    }

    /// A parent checks in on this node's cache: `hold` keeps it for the
    /// parent, otherwise the parent no longer needs it.
    pub fn hold_cache(&self, hold: bool) {
        let mut st = self.state.lock();
        let releasable = match &st.cache {
            Some(entry) => !entry.long && st.cache_policy < CachePolicy::Always,
            None => return,
        };
        if st.parents.hint(hold) && releasable {
            tracing::trace!(node = %self.name, "releasing cache");
            self.drop_cache(&mut st);
        }
    }

    /// Executes the node for `request`. Always returns an outcome; failures
    /// come back as FAIL results, never as errors.
    pub fn execute(&self, request: &Arc<Request>) -> ExecOutcome {
        let me = thread::current().id();
        if *self.exec_owner.lock() == Some(me) {
            tracing::error!(node = %self.name, "re-entrant execution");
            return ExecOutcome::fail(FailRecord::fail(
                "node re-entered while executing",
                &self.name,
                &self.class,
            ));
        }
        let mut exec = match self.exec.try_lock() {
            Some(guard) => guard,
            None => {
                let _blocked = BlockedGuard::new();
                self.exec.lock()
            }
        };
        *self.exec_owner.lock() = Some(me);
        let _owner = OwnerGuard(&self.exec_owner);
        self.run(&mut exec, request)
    }

    fn run(&self, exec: &mut ExecSide, request: &Arc<Request>) -> ExecOutcome {
        let mut st = self.state.lock();
        st.stats.executions += 1;
        if self.shared.is_aborted() {
            return self.abort_out(&mut st);
        }

        self.transition(&mut st, ExecState::Request, false);
        if self.shared.is_aborted() {
            return self.abort_out(&mut st);
        }

        if request.is_parm_update()
            && st.depend_known
            && !st.depend_mask.intersects(self.shared.iteration_mask())
        {
            let code = ResultCode::from_mask(st.depend_mask);
            self.transition(&mut st, ExecState::Idle, false);
            return ExecOutcome::new(code, Arc::new(NodeResult::new()));
        }

        // A stale entry stays until a fresh result replaces it.
        let hit = st
            .cache
            .as_ref()
            .and_then(|entry| entry.lookup(request).map(|result| (result, entry.code)));
        if let Some((result, code)) = hit {
            st.stats.cache_hits += 1;
            self.update_control(&mut st, |c| c.set(ControlStatus::RETCACHE, true));
            self.transition(&mut st, ExecState::Idle, code.is_fail());
            tracing::trace!(node = %self.name, rqid = %request.id, "cache hit");
            return ExecOutcome::new(code.without(ResultCode::UPDATED), result);
        }
        // A stale entry is not reported as cached while the node recomputes.
        self.update_control(&mut st, |c| {
            c.set(ControlStatus::RETCACHE, false);
            c.set(ControlStatus::CACHED, false);
        });

        if request.id.is_empty() || st.current_rqid != request.id {
            if let Some(rider) = &request.rider {
                let commands = rider.commands_for(self.index, &self.name);
                if !commands.is_empty() {
                    self.transition(&mut st, ExecState::Command, false);
                    for cmd in commands {
                        if let Err(e) = self.apply_command(exec, &mut st, cmd) {
                            self.shared.post_error(Some(&self.name), &e.to_string());
                        }
                    }
                }
            }
            st.current_rqid = request.id.clone();
        }

        if !st.control.is_active() {
            let code = ResultCode::from_mask(st.depend_mask);
            return self.conclude(exec, st, request, NodeResult::new(), code, false);
        }

        self.transition(&mut st, ExecState::Polling, false);
        if self.shared.is_aborted() {
            return self.abort_out(&mut st);
        }

        let labels = exec.children.labels();
        let ExecSide { kernel, children, .. } = &mut *exec;
        let poll = MutexGuard::unlocked(&mut st, || match kernel.poll_mode() {
            PollMode::Sync => Ok(children.sync_poll(request)),
            PollMode::Async => {
                let ctx = EvalContext {
                    node: &self.name,
                    index: self.index,
                    request,
                    child_labels: &labels,
                    events: &self.events,
                };
                children.stream_poll(request, |i, outcome| {
                    kernel.accept_child_result(&ctx, i, &outcome.result, outcome.code)
                })
            }
        });
        let mut poll = match poll {
            Ok(poll) => poll,
            Err(e) => return self.kernel_failed(exec, st, request, e, ResultCode::NONE),
        };

        if poll.code.is_abort() || self.shared.is_aborted() {
            return self.abort_out(&mut st);
        }
        st.depend_mask = st.own_mask | poll.code.depend_mask();
        st.depend_known = true;
        let child_code = ResultCode::from_mask(poll.code.depend_mask());

        if poll.code.is_wait() {
            let code = child_code.with(ResultCode::WAIT).with_mask(st.own_mask);
            let cached = st.cache.is_some();
            self.update_control(&mut st, |c| {
                c.set_result_type(ResultType::Wait);
                c.set(ControlStatus::CACHED, cached);
            });
            self.transition(&mut st, ExecState::Idle, false);
            return ExecOutcome::new(code, Arc::new(NodeResult::new()));
        }
        if poll.code.is_fail() || poll.code.is_missing() {
            let flags = ResultCode::from_bits(
                poll.code.bits() & (ResultCode::FAIL.bits() | ResultCode::MISSING.bits()),
            );
            let aggregate = poll.fail.take().unwrap_or_default();
            return self.conclude(exec, st, request, aggregate, child_code | flags, true);
        }

        self.transition(&mut st, ExecState::Evaluating, false);
        if self.shared.is_aborted() {
            return self.abort_out(&mut st);
        }
        st.stats.evaluations += 1;
        let resample = st.auto_resample;
        let mut results = std::mem::take(&mut poll.results);
        let evaluated = MutexGuard::unlocked(&mut st, || {
            let ctx = EvalContext {
                node: &self.name,
                index: self.index,
                request,
                child_labels: &labels,
                events: &self.events,
            };
            let kernel = &mut exec.kernel;
            panic::catch_unwind(AssertUnwindSafe(|| match &request.service {
                Service::DiscoverSpids => kernel.discover_spids(&ctx, &results),
                Service::ParmUpdate { updates } => {
                    kernel.apply_update(&ctx, updates).map(|()| Produced::empty())
                }
                Service::Evaluate => {
                    if let Some(cells) = request.cells.as_deref() {
                        cells_check::reconcile(&mut results, cells, resample)?;
                    }
                    kernel.get_result(&ctx, &results)
                }
            }))
            .unwrap_or_else(|_| {
                Err(NodeError::Evaluation(format!("{}: kernel panicked", self.name)))
            })
        });

        if self.shared.is_aborted() {
            return self.abort_out(&mut st);
        }
        match evaluated {
            Ok(produced) => {
                let mut code = child_code | produced.code;
                if produced.result.is_fail() {
                    code |= ResultCode::FAIL;
                } else if produced.result.is_missing() {
                    code |= ResultCode::MISSING;
                }
                self.conclude(exec, st, request, produced.result, code, true)
            }
            Err(e) => self.kernel_failed(exec, st, request, e, child_code),
        }
    }

    fn abort_out(&self, st: &mut MutexGuard<'_, NodeState>) -> ExecOutcome {
        st.control.set_exec_state(ExecState::Idle);
        let cached = st.cache.is_some();
        self.update_control(st, |c| c.set(ControlStatus::CACHED, cached));
        tracing::debug!(node = %self.name, "aborted");
        ExecOutcome::aborted()
    }

    fn kernel_failed(
        &self,
        exec: &mut ExecSide,
        st: MutexGuard<'_, NodeState>,
        request: &Arc<Request>,
        error: NodeError,
        code: ResultCode,
    ) -> ExecOutcome {
        let message = error.to_string();
        self.shared.post_error(Some(&self.name), &message);
        let (record, flag) = if error.is_missing_data() {
            (FailRecord::missing(message, &self.name, &self.class), ResultCode::MISSING)
        } else {
            (FailRecord::fail(message, &self.name, &self.class), ResultCode::FAIL)
        };
        let result = NodeResult::from_fails(vec![record]);
        self.conclude(exec, st, request, result, code | flag, true)
    }

    /// Caches and publishes a finished result, releases the children's
    /// caches and kicks off the stepchildren.
    fn conclude(
        &self,
        exec: &mut ExecSide,
        mut st: MutexGuard<'_, NodeState>,
        request: &Arc<Request>,
        mut result: NodeResult,
        code: ResultCode,
        polled: bool,
    ) -> ExecOutcome {
        result.request_id = request.id.clone();
        if result.cells.is_none() {
            result.cells = request.cells.clone();
        }
        let result: ResultRef = Arc::new(result);
        let code = code.with_mask(st.own_mask).with(ResultCode::UPDATED);
        if code.is_fail() {
            st.stats.fails += 1;
        }

        let mut missing_hint = false;
        let retention = cache::retention(st.cache_policy, code, request, &st.parents, &mut missing_hint);
        if missing_hint {
            st.stats.missing_next_hints += 1;
            if !st.missing_hint_logged {
                st.missing_hint_logged = true;
                tracing::debug!(node = %self.name, "smart cache without next request id, keeping short");
            }
        }
        st.parents.reset();
        let long = match retention {
            Retention::Discard => {
                self.drop_cache(&mut st);
                false
            }
            Retention::Short | Retention::Long => {
                let long = retention == Retention::Long;
                st.cache = Some(CacheEntry {
                    result: Arc::clone(&result),
                    request_id: request.id.clone(),
                    code,
                    eval_mode: request.eval_mode,
                    kind: RequestKind::of(request),
                    long,
                });
                self.update_control(&mut st, |c| c.set(ControlStatus::CACHED, true));
                long
            }
        };
        if !code.has(ResultCode::IGNORE_TYPE) {
            let rt = if code.is_fail() {
                ResultType::Fail
            } else if code.is_missing() {
                ResultType::Missing
            } else if result.is_empty() {
                ResultType::Empty
            } else {
                ResultType::Ok
            };
            self.update_control(&mut st, |c| c.set_result_type(rt));
        }

        let own_deps = code.depend_mask();
        MutexGuard::unlocked(&mut st, || {
            if polled {
                // Children stay held only behind a long result built on them.
                for child in exec.children.children() {
                    child.hold_cache(long && own_deps.intersects(child.depend_mask()));
                }
            }
            exec.stepchildren.background_poll(request);
        });

        self.transition(&mut st, ExecState::Idle, code.is_fail());
        let publish = st.publish_level > 0;
        let log = st.log_results;
        drop(st);

        if publish {
            self.shared.events().emit(ForestEvent::NodeResult {
                session: self.shared.session(),
                node: self.name.clone(),
                request_id: request.id.clone(),
                result: Arc::clone(&result),
                timestamp: chrono::Utc::now(),
            });
        }
        if log {
            if let Err(e) = self.shared.log_node_result(&self.name, request, &result) {
                tracing::warn!(node = %self.name, "cannot log result: {}", e);
            }
        }
        ExecOutcome::new(code, result)
    }

    /// Whether the iteration symdep is among the node's dependencies.
    pub fn depends_on_iteration(&self) -> bool {
        self.depend_mask().intersects(self.shared.iteration_mask())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("class", &self.class)
            .finish()
    }
}
