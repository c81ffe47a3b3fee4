use meqcore::{BreakpointMask, ControlStatus, ExecState, ForestEvent};
use parking_lot::MutexGuard;
use std::collections::HashSet;

use super::{Node, NodeState};

impl Node {
    /// Changes the control status and tells the observer about it.
    pub(super) fn update_control(&self, st: &mut NodeState, f: impl FnOnce(&mut ControlStatus)) {
        let old = st.control;
        f(&mut st.control);
        if old == st.control {
            return;
        }
        if let Some(observer) = self.shared.observer() {
            observer.on_control_status_change(self.index, &self.name, old, st.control);
        }
        if st.publish_level > 1 {
            self.shared.events().emit(ForestEvent::StatusChanged {
                session: self.shared.session(),
                node: self.name.clone(),
                index: self.index,
                old,
                new: st.control,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Moves to a new exec state, stopping here if a local or global
    /// breakpoint matches. `failing` adds the FAIL condition to the trigger.
    pub(super) fn transition(&self, st: &mut MutexGuard<'_, NodeState>, state: ExecState, failing: bool) {
        self.update_control(st, |c| c.set_exec_state(state));

        let mut trigger = BreakpointMask::on_state(state);
        if failing {
            trigger |= BreakpointMask::FAIL;
        }
        let single = st.breakpoint_ss.intersects(trigger);
        let local = single || st.breakpoint.intersects(trigger);
        if single {
            st.breakpoint_ss = BreakpointMask::NONE;
            self.update_control(st, |c| c.set(ControlStatus::BREAKPOINT_SS, false));
        }
        let global = !local && self.shared.take_global_breakpoint(trigger).is_some();

        if local || global {
            self.hit_breakpoint(st, trigger, global);
        } else if self.shared.stop().is_raised() && !self.shared.is_aborted() {
            // Someone else stopped the forest.
            let abort = self.shared.abort_token();
            MutexGuard::unlocked(st, || self.shared.stop().wait(&abort));
        }
    }

    fn hit_breakpoint(&self, st: &mut MutexGuard<'_, NodeState>, mask: BreakpointMask, global: bool) {
        tracing::info!(node = %self.name, state = ?st.control.exec_state(), global, "breakpoint");
        self.shared.stop().raise();
        self.update_control(st, |c| {
            c.set(ControlStatus::STOPPED, true);
            c.set(ControlStatus::STOP_BREAKPOINT, true);
        });
        if let Some(observer) = self.shared.observer() {
            observer.on_breakpoint_hit(self.index, &self.name, mask, global);
        }
        self.shared.events().emit(ForestEvent::BreakpointHit {
            session: self.shared.session(),
            node: self.name.clone(),
            index: self.index,
            mask,
            global,
            timestamp: chrono::Utc::now(),
        });

        let abort = self.shared.abort_token();
        MutexGuard::unlocked(st, || {
            self.publish_stopped(true);
            self.shared.stop().wait(&abort);
            self.publish_stopped(false);
        });

        self.update_control(st, |c| {
            c.set(ControlStatus::STOPPED, false);
            c.set(ControlStatus::STOP_BREAKPOINT, false);
        });
    }

    /// Sets or clears STOPPED on every ancestor. Called without this
    /// node's state lock.
    fn publish_stopped(&self, stopped: bool) {
        let mut seen = HashSet::new();
        let mut pending = self.parent_nodes();
        while let Some(parent) = pending.pop() {
            if !seen.insert(parent.index()) {
                continue;
            }
            {
                let mut st = parent.state.lock();
                parent.update_control(&mut st, |c| c.set(ControlStatus::STOPPED, stopped));
            }
            pending.extend(parent.parent_nodes());
        }
    }

    pub fn set_breakpoint(&self, mask: BreakpointMask, single_shot: bool) {
        let mut st = self.state.lock();
        self.add_breakpoint(&mut st, mask, single_shot);
    }

    pub fn clear_breakpoint(&self, mask: BreakpointMask) {
        let mut st = self.state.lock();
        self.remove_breakpoint(&mut st, mask);
    }

    /// Breakpoint masks of this node, as `(persistent, single_shot)`.
    pub fn breakpoints(&self) -> (BreakpointMask, BreakpointMask) {
        let st = self.state.lock();
        (st.breakpoint, st.breakpoint_ss)
    }

    pub(super) fn add_breakpoint(&self, st: &mut NodeState, mask: BreakpointMask, single_shot: bool) {
        if single_shot {
            st.breakpoint_ss |= mask;
        } else {
            st.breakpoint |= mask;
        }
        let (bp, ss) = (!st.breakpoint.is_empty(), !st.breakpoint_ss.is_empty());
        self.update_control(st, |c| {
            c.set(ControlStatus::BREAKPOINT, bp);
            c.set(ControlStatus::BREAKPOINT_SS, ss);
        });
    }

    pub(super) fn remove_breakpoint(&self, st: &mut NodeState, mask: BreakpointMask) {
        st.breakpoint = st.breakpoint.without(mask);
        st.breakpoint_ss = st.breakpoint_ss.without(mask);
        let (bp, ss) = (!st.breakpoint.is_empty(), !st.breakpoint_ss.is_empty());
        self.update_control(st, |c| {
            c.set(ControlStatus::BREAKPOINT, bp);
            c.set(ControlStatus::BREAKPOINT_SS, ss);
        });
    }
}
