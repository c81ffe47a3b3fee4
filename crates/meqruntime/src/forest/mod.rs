//! Forest: node repository and forest-wide coordination
//!
//! The forest owns every node, the symbolic dependency table, the global
//! breakpoint mask, the stop and abort flags, the event bus and the result
//! log. Nodes see the coordination part through a shared [`ForestShared`].

mod log;
mod stop;

pub use log::{read_log, LogMode, LogRecord};
pub use stop::StopSignal;

use meqcore::{
    symdeps, BreakpointMask, ChildRef, ControlStatus, DependMask, EventBus, EventEmitter,
    ForestDefinition, ForestEvent, ForestSettings, MeqError, MessageLevel, NodeIndex, NodeResult,
    NodeSpec, Record, Request, RequestId, SessionId, Value, RQIDM_NBITS,
};
use parking_lot::{Mutex, RwLock};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::mtpool::{Scheduler, SchedulerStats};
use crate::node::{ExecOutcome, Node, NodeRef};
use crate::nursery::NodeNursery;
use crate::registry::NodeRegistry;
use log::ResultLog;

/// Repository slots are reserved this many at a time.
const REPO_CHUNK: usize = 256;

/// Callbacks of an external controller (debugger, UI). Invoked
/// synchronously from the executing thread while the node's state lock is
/// held, so they must return promptly and must not call back into that node.
pub trait ForestObserver: Send + Sync {
    fn on_control_status_change(
        &self,
        _index: NodeIndex,
        _name: &str,
        _old: ControlStatus,
        _new: ControlStatus,
    ) {
    }

    fn on_breakpoint_hit(&self, _index: NodeIndex, _name: &str, _mask: BreakpointMask, _global: bool) {}
}

#[derive(Default, Clone, Copy)]
struct GlobalBreakpoints {
    persistent: BreakpointMask,
    single_shot: BreakpointMask,
}

/// Forest state shared with every node.
pub(crate) struct ForestShared {
    settings: ForestSettings,
    scheduler: Arc<Scheduler>,
    symdeps: RwLock<BTreeMap<String, DependMask>>,
    abort: Mutex<CancellationToken>,
    stop: StopSignal,
    breakpoints: Mutex<GlobalBreakpoints>,
    events: EventBus,
    observer: RwLock<Option<Arc<dyn ForestObserver>>>,
    log: Mutex<Option<ResultLog>>,
    errors: AtomicU64,
}

impl ForestShared {
    fn new(settings: ForestSettings) -> Self {
        let symdeps = symdeps::DEFAULTS
            .iter()
            .map(|(name, mask)| (name.to_string(), *mask))
            .collect();
        Self {
            scheduler: Scheduler::new(&settings),
            events: EventBus::new(settings.event_buffer_size),
            settings,
            symdeps: RwLock::new(symdeps),
            abort: Mutex::new(CancellationToken::new()),
            stop: StopSignal::new(),
            breakpoints: Mutex::new(GlobalBreakpoints::default()),
            observer: RwLock::new(None),
            log: Mutex::new(None),
            errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn settings(&self) -> &ForestSettings {
        &self.settings
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub(crate) fn session(&self) -> SessionId {
        self.events.session()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.lock().is_cancelled()
    }

    pub(crate) fn abort_token(&self) -> CancellationToken {
        self.abort.lock().clone()
    }

    pub(crate) fn stop(&self) -> &StopSignal {
        &self.stop
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn ForestObserver>> {
        self.observer.read().clone()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn emitter(&self, node: &str) -> EventEmitter {
        self.events.create_emitter(node)
    }

    pub(crate) fn symdep_mask(&self, name: &str) -> Option<DependMask> {
        let table = self.symdeps.read();
        table.get(name).copied().or_else(|| {
            table
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, m)| *m)
        })
    }

    pub(crate) fn iteration_mask(&self) -> DependMask {
        self.symdep_mask(symdeps::ITERATION)
            .unwrap_or(DependMask::new(0x01))
    }

    /// Mask of `name`, allocating the next free bit for an unknown symdep.
    pub(crate) fn resolve_symdep(&self, name: &str) -> meqcore::Result<DependMask> {
        if let Some(mask) = self.symdep_mask(name) {
            return Ok(mask);
        }
        let mut table = self.symdeps.write();
        if let Some(mask) = table.get(name) {
            return Ok(*mask);
        }
        let used = table.values().fold(DependMask::NONE, |acc, m| acc | *m);
        let bit = used
            .first_free()
            .filter(|&b| b < RQIDM_NBITS)
            .ok_or_else(|| MeqError::SymdepsExhausted(name.to_string()))?;
        let mask = DependMask::bit(bit);
        table.insert(name.to_string(), mask);
        tracing::debug!(symdep = name, %mask, "added symdep");
        Ok(mask)
    }

    /// Checks the global masks against a transition; a single-shot mask is
    /// consumed when it fires.
    pub(crate) fn take_global_breakpoint(&self, trigger: BreakpointMask) -> Option<BreakpointMask> {
        let mut bp = self.breakpoints.lock();
        let persistent = bp.persistent.intersects(trigger);
        let single = bp.single_shot.intersects(trigger);
        if single {
            bp.single_shot = BreakpointMask::NONE;
        }
        (persistent || single).then_some(trigger)
    }

    pub(crate) fn post(&self, level: MessageLevel, node: Option<&str>, message: &str) {
        match level {
            MessageLevel::Error => tracing::error!(node = node.unwrap_or("-"), "{}", message),
            MessageLevel::Warning => tracing::warn!(node = node.unwrap_or("-"), "{}", message),
            MessageLevel::Info => tracing::info!(node = node.unwrap_or("-"), "{}", message),
        }
        self.events.emit(ForestEvent::Message {
            session: self.session(),
            level,
            node: node.map(str::to_string),
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    pub(crate) fn post_error(&self, node: Option<&str>, message: &str) {
        self.post(MessageLevel::Error, node, message);
    }

    pub(crate) fn log_node_result(
        &self,
        name: &str,
        request: &Request,
        result: &NodeResult,
    ) -> meqcore::Result<()> {
        let mut log = self.log.lock();
        match log.as_mut() {
            Some(log) => log.write(name, request, result),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Repository {
    nodes: Vec<Option<NodeRef>>,
    names: HashMap<String, NodeIndex>,
}

impl Repository {
    fn new() -> Self {
        let mut nodes = Vec::with_capacity(REPO_CHUNK);
        // Index 0 is reserved.
        nodes.push(None);
        Self {
            nodes,
            names: HashMap::new(),
        }
    }

    fn next_free(&self) -> NodeIndex {
        NodeIndex(self.nodes.len() as u32)
    }

    fn ensure_slot(&mut self, index: NodeIndex) {
        let slot = index.slot();
        if slot >= self.nodes.len() {
            if slot >= self.nodes.capacity() {
                let needed = slot + 1 - self.nodes.len();
                let chunks = needed.div_ceil(REPO_CHUNK);
                self.nodes.reserve(chunks * REPO_CHUNK);
            }
            self.nodes.resize(slot + 1, None);
        }
    }

    fn get(&self, index: NodeIndex) -> Option<&NodeRef> {
        if !index.is_valid() {
            return None;
        }
        self.nodes.get(index.slot()).and_then(Option::as_ref)
    }
}

/// Node repository plus forest-wide coordination
pub struct Forest {
    shared: Arc<ForestShared>,
    repo: RwLock<Repository>,
    registry: Arc<NodeRegistry>,
}

impl Forest {
    pub fn new(settings: ForestSettings, registry: Arc<NodeRegistry>) -> Self {
        tracing::info!(
            brigade_size = settings.brigade_size,
            max_active = settings.max_active_brigades,
            mt = settings.mt_enabled,
            "creating forest"
        );
        Self {
            shared: Arc::new(ForestShared::new(settings)),
            repo: RwLock::new(Repository::new()),
            registry,
        }
    }

    /// Builds a forest from a definition: applies its settings, opens the
    /// configured log, creates every node and links the children.
    pub fn from_definition(def: &ForestDefinition, registry: Arc<NodeRegistry>) -> meqcore::Result<Self> {
        let forest = Self::new(def.settings.clone(), registry);
        if let Some(path) = &def.settings.log_file {
            let mode = if def.settings.log_append {
                LogMode::Append
            } else {
                LogMode::Overwrite
            };
            forest.open_log(path, mode)?;
        }
        forest.load_definition(def)?;
        Ok(forest)
    }

    pub fn settings(&self) -> &ForestSettings {
        self.shared.settings()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn session(&self) -> SessionId {
        self.shared.session()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.shared.scheduler()
    }

    /// A nursery bound to this forest, for polling nodes from outside a
    /// node's own execution.
    pub fn nursery(&self, name: impl Into<String>) -> NodeNursery {
        NodeNursery::new(name, Arc::clone(&self.shared))
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.shared.scheduler().stats()
    }

    /// Creates a node from its definition. Children are linked by
    /// `resolve_children`.
    pub fn create(&self, spec: NodeSpec) -> meqcore::Result<NodeIndex> {
        match self.try_create(&spec) {
            Ok(index) => Ok(index),
            Err(e) => {
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(node = %spec.name, class = %spec.class, "create failed: {}", e);
                Err(e)
            }
        }
    }

    fn try_create(&self, spec: &NodeSpec) -> meqcore::Result<NodeIndex> {
        if spec.name.is_empty() {
            return Err(MeqError::CreateFailed {
                name: String::new(),
                reason: "node name is empty".to_string(),
            });
        }
        if self.repo.read().names.contains_key(&spec.name) {
            return Err(MeqError::DuplicateName(spec.name.clone()));
        }
        let kernel = self.registry.create_kernel(spec)?;
        kernel
            .check_children(spec.children.len())
            .map_err(|e| MeqError::CreateFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        let mut own_mask = DependMask::NONE;
        for symdep in spec.symdeps.iter().cloned().chain(kernel.inherent_symdeps()) {
            own_mask |= self.shared.resolve_symdep(&symdep)?;
        }

        let mut repo = self.repo.write();
        if repo.names.contains_key(&spec.name) {
            return Err(MeqError::DuplicateName(spec.name.clone()));
        }
        let index = match spec.node_index {
            Some(index) if !index.is_valid() => return Err(MeqError::InvalidNodeIndex(index)),
            Some(index) if repo.get(index).is_some() => return Err(MeqError::IndexInUse(index)),
            Some(index) => index,
            None => repo.next_free(),
        };
        let node = Node::new(index, spec, kernel, Arc::clone(&self.shared), own_mask)?;
        repo.ensure_slot(index);
        repo.nodes[index.slot()] = Some(Arc::new(node));
        repo.names.insert(spec.name.clone(), index);
        tracing::debug!(node = %spec.name, %index, class = %spec.class, "created node");
        Ok(index)
    }

    /// Removes a node. Surviving nodes keep their indices; the repository
    /// only shrinks when trailing slots become empty.
    pub fn remove(&self, index: NodeIndex) -> meqcore::Result<NodeRef> {
        let mut repo = self.repo.write();
        let node = repo
            .nodes
            .get_mut(index.slot())
            .filter(|_| index.is_valid())
            .and_then(Option::take)
            .ok_or(MeqError::InvalidNodeIndex(index))?;
        repo.names.remove(node.name());
        while repo.nodes.len() > 1 && matches!(repo.nodes.last(), Some(None)) {
            repo.nodes.pop();
        }
        tracing::debug!(node = %node.name(), %index, "removed node");
        Ok(node)
    }

    pub fn get(&self, index: NodeIndex) -> meqcore::Result<NodeRef> {
        self.repo
            .read()
            .get(index)
            .cloned()
            .ok_or(MeqError::InvalidNodeIndex(index))
    }

    pub fn find(&self, name: &str) -> meqcore::Result<NodeRef> {
        let index = self.find_index(name)?;
        self.get(index)
    }

    pub fn find_index(&self, name: &str) -> meqcore::Result<NodeIndex> {
        self.repo
            .read()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| MeqError::NodeNotFound(name.to_string()))
    }

    pub fn num_nodes(&self) -> usize {
        self.repo.read().names.len()
    }

    /// One past the highest slot in use.
    pub fn max_index(&self) -> usize {
        self.repo.read().nodes.len()
    }

    pub fn nodes(&self) -> Vec<NodeRef> {
        self.repo.read().nodes.iter().flatten().cloned().collect()
    }

    pub fn error_count(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    fn resolve_ref(&self, child: &ChildRef) -> meqcore::Result<NodeRef> {
        match child {
            ChildRef::Index(index) => self.get(*index),
            ChildRef::Name(name) => self.find(name),
        }
    }

    /// Links every unresolved node to its children and stepchildren.
    /// Fails without linking anything if the graph would have a cycle.
    pub fn resolve_children(&self) -> meqcore::Result<()> {
        let nodes = self.nodes();
        let pending: Vec<&NodeRef> = nodes.iter().filter(|n| !n.is_resolved()).collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut links: Vec<(NodeRef, Vec<NodeRef>, Vec<NodeRef>)> = Vec::with_capacity(pending.len());
        for node in &pending {
            let children = node
                .child_refs()
                .iter()
                .map(|c| self.resolve_ref(c))
                .collect::<meqcore::Result<Vec<_>>>()?;
            let stepchildren = node
                .stepchild_refs()
                .iter()
                .map(|c| self.resolve_ref(c))
                .collect::<meqcore::Result<Vec<_>>>()?;
            links.push((Arc::clone(node), children, stepchildren));
        }

        self.check_acyclic(&nodes, &links)?;

        for (node, children, stepchildren) in links {
            node.link_children(children, stepchildren)?;
        }
        tracing::debug!(nodes = pending.len(), "resolved children");
        Ok(())
    }

    fn check_acyclic(
        &self,
        nodes: &[NodeRef],
        links: &[(NodeRef, Vec<NodeRef>, Vec<NodeRef>)],
    ) -> meqcore::Result<()> {
        let mut graph = DiGraph::<NodeIndex, ()>::new();
        let mut vertex = HashMap::new();
        for node in nodes {
            vertex.insert(node.index(), graph.add_node(node.index()));
        }
        for node in nodes {
            let from = vertex[&node.index()];
            for child in node.children().iter().chain(node.stepchildren().iter()) {
                if let Some(&to) = vertex.get(&child.index()) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        for (node, children, stepchildren) in links {
            let from = vertex[&node.index()];
            for child in children.iter().chain(stepchildren) {
                if let Some(&to) = vertex.get(&child.index()) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            let index = graph[cycle.node_id()];
            let name = self
                .get(index)
                .map(|n| n.name().to_string())
                .unwrap_or_else(|_| index.to_string());
            MeqError::CyclicDependency(name)
        })
    }

    /// Creates every node of a definition, then links the children.
    pub fn load_definition(&self, def: &ForestDefinition) -> meqcore::Result<Vec<NodeIndex>> {
        let indices = def
            .nodes
            .iter()
            .map(|spec| self.create(spec.clone()))
            .collect::<meqcore::Result<Vec<_>>>()?;
        self.resolve_children()?;
        tracing::info!(forest = %def.name, nodes = indices.len(), "loaded forest definition");
        Ok(indices)
    }

    /// Executes a node with a request.
    pub fn execute(&self, index: NodeIndex, request: Request) -> meqcore::Result<ExecOutcome> {
        let node = self.get(index)?;
        Ok(node.execute(&Arc::new(request)))
    }

    pub fn execute_named(&self, name: &str, request: Request) -> meqcore::Result<ExecOutcome> {
        let node = self.find(name)?;
        Ok(node.execute(&Arc::new(request)))
    }

    pub fn clear_all_caches(&self) {
        for node in self.nodes() {
            node.clear_cache(false);
        }
    }

    // symdeps

    pub fn symdep_mask(&self, name: &str) -> meqcore::Result<DependMask> {
        self.shared
            .symdep_mask(name)
            .ok_or_else(|| MeqError::UnknownSymdep(name.to_string()))
    }

    /// Adds a symdep at the next free bit; an existing symdep keeps its mask.
    pub fn add_symdep(&self, name: &str) -> meqcore::Result<DependMask> {
        self.shared.resolve_symdep(name)
    }

    pub fn set_symdep(&self, name: &str, mask: DependMask) {
        self.shared.symdeps.write().insert(name.to_string(), mask);
    }

    pub fn symdeps(&self) -> BTreeMap<String, DependMask> {
        self.shared.symdeps.read().clone()
    }

    /// Steps the sub-ids of `rqid` covered by `symdep`, invalidating every
    /// cache that depends on it.
    pub fn incr_request_id(&self, rqid: &mut RequestId, symdep: &str) -> meqcore::Result<()> {
        let mask = self.symdep_mask(symdep)?;
        rqid.incr_sub_id(mask);
        Ok(())
    }

    // breakpoints, stop and abort

    pub fn set_breakpoint(&self, mask: BreakpointMask, single_shot: bool) {
        let mut bp = self.shared.breakpoints.lock();
        if single_shot {
            bp.single_shot |= mask;
        } else {
            bp.persistent |= mask;
        }
    }

    pub fn clear_breakpoint(&self, mask: BreakpointMask) {
        let mut bp = self.shared.breakpoints.lock();
        bp.persistent = bp.persistent.without(mask);
        bp.single_shot = bp.single_shot.without(mask);
    }

    /// Global breakpoint masks, as `(persistent, single_shot)`.
    pub fn breakpoints(&self) -> (BreakpointMask, BreakpointMask) {
        let bp = self.shared.breakpoints.lock();
        (bp.persistent, bp.single_shot)
    }

    pub fn raise_stop_flag(&self) {
        self.shared.stop.raise();
    }

    pub fn clear_stop_flag(&self) {
        self.shared.stop.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_raised()
    }

    /// Blocks until the stop flag is cleared or the forest aborts.
    pub fn wait_on_stop_flag(&self) {
        let abort = self.shared.abort_token();
        self.shared.stop.wait(&abort);
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.shared.stop
    }

    /// Makes every execution in flight return ABORT as soon as it reaches a
    /// checkpoint.
    pub fn raise_abort_flag(&self) {
        tracing::info!("abort raised");
        self.shared.abort.lock().cancel();
        self.shared.stop.wake_all();
    }

    pub fn clear_abort_flag(&self) {
        let mut abort = self.shared.abort.lock();
        if abort.is_cancelled() {
            *abort = CancellationToken::new();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    // result log

    pub fn open_log(&self, path: impl AsRef<Path>, mode: LogMode) -> meqcore::Result<()> {
        let log = ResultLog::open(path.as_ref(), mode)?;
        *self.shared.log.lock() = Some(log);
        Ok(())
    }

    pub fn close_log(&self) {
        if let Some(log) = self.shared.log.lock().take() {
            tracing::info!(path = %log.path().display(), records = log.records(), "closed result log");
        }
    }

    pub fn log_node_result(&self, name: &str, request: &Request, result: &NodeResult) -> meqcore::Result<()> {
        self.shared.log_node_result(name, request, result)
    }

    // messages and observers

    pub fn post_error(&self, node: Option<&str>, message: &str) {
        self.shared.post_error(node, message);
    }

    pub fn post_message(&self, node: Option<&str>, message: &str, level: MessageLevel) {
        self.shared.post(level, node, message);
    }

    pub fn post_event(&self, node: Option<&str>, kind: &str, payload: Value) {
        self.shared.events.emit(ForestEvent::Event {
            session: self.shared.session(),
            node: node.map(str::to_string),
            kind: kind.to_string(),
            payload,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ForestEvent> {
        self.shared.events.subscribe()
    }

    pub fn set_observer(&self, observer: Arc<dyn ForestObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.shared.observer.write() = None;
    }

    // state

    pub fn state(&self) -> Record {
        let symdeps: Record = self
            .symdeps()
            .into_iter()
            .map(|(name, mask)| (name, Value::from(mask.bits())))
            .collect();
        let (persistent, single_shot) = self.breakpoints();
        let settings = self.settings();
        Record::new()
            .with("symdeps", symdeps)
            .with("breakpoint", persistent.bits())
            .with("breakpoint_ss", single_shot.bits())
            .with("num_nodes", self.num_nodes())
            .with("error_count", self.error_count() as usize)
            .with("mt_enabled", settings.mt_enabled)
            .with("brigade_size", self.scheduler().brigade_size())
            .with("stopped", self.is_stopped())
    }

    pub fn set_state(&self, state: &Record) -> meqcore::Result<()> {
        if let Some(value) = state.get("symdeps") {
            let table = value
                .as_record()
                .ok_or_else(|| MeqError::InvalidState("symdeps must be a record".to_string()))?;
            for (name, mask) in table.iter() {
                let bits = mask
                    .as_f64()
                    .ok_or_else(|| MeqError::InvalidState(format!("symdep {} must be a number", name)))?;
                self.set_symdep(name, DependMask::new(bits as u32));
            }
        }
        let mut bp = self.shared.breakpoints.lock();
        if let Some(bits) = state.get_f64("breakpoint") {
            bp.persistent = BreakpointMask::from_bits(bits as u32);
        }
        if let Some(bits) = state.get_f64("breakpoint_ss") {
            bp.single_shot = BreakpointMask::from_bits(bits as u32);
        }
        Ok(())
    }
}

impl Drop for Forest {
    fn drop(&mut self) {
        self.shared.stop.clear();
        self.shared.scheduler().stop_all();
    }
}
