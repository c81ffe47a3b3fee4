use meqcore::{
    BreakpointMask, CachePolicy, ChildErrorPolicy, ControlStatus, MeqError, Record, ResamplePolicy,
    Value,
};
use serde::de::DeserializeOwned;

use super::cache::CacheEntry;
use super::{ExecSide, Node, NodeState};

fn field<T: DeserializeOwned>(state: &Record, key: &str) -> meqcore::Result<Option<T>> {
    match state.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .to_deserialize()
            .map(Some)
            .map_err(|e| MeqError::InvalidState(format!("{}: {}", key, e))),
    }
}

impl Node {
    /// Snapshot of the node's state record. The kernel part is left out if
    /// the node is executing.
    pub fn state(&self) -> Record {
        let exec = self.exec.try_lock();
        let st = self.state.lock();

        let children: Vec<Value> = self
            .children()
            .iter()
            .map(|c| Value::from(c.name()))
            .collect();
        let stats = Value::from_serialize(&st.stats).unwrap_or(Value::Null);
        let mut record = Record::new()
            .with("name", self.name.as_str())
            .with("class", self.class.as_str())
            .with("node_index", self.index.0)
            .with("control_status", st.control.bits())
            .with("active", st.control.is_active())
            .with("cache_policy", enum_value(&st.cache_policy))
            .with("auto_resample", enum_value(&st.auto_resample))
            .with("publish_level", st.publish_level as u32)
            .with("log_results", st.log_results)
            .with("breakpoint", st.breakpoint.bits())
            .with("breakpoint_ss", st.breakpoint_ss.bits())
            .with("depend_mask", st.depend_mask.bits())
            .with("own_mask", st.own_mask.bits())
            .with("num_parents", st.parents.num_parents)
            .with("children", Value::Array(children))
            .with("stats", stats);
        if let Some(n) = st.parents.active_parents {
            record.set("active_parents", n);
        }
        if let Some(entry) = &st.cache {
            match Value::from_serialize(entry) {
                Ok(value) => record.set("cache", value),
                Err(e) => tracing::warn!(node = %self.name, "cannot snapshot cache: {}", e),
            }
        }
        if let Some(exec) = exec {
            record.set("fail_policy", enum_value(&exec.children.fail_policy()));
            record.set("missing_policy", enum_value(&exec.children.missing_policy()));
            record.set("mt_polling", exec.children.mt_polling());
            record.set("kernel", exec.kernel.state());
        }
        record
    }

    /// Applies a state record, as produced by `state`. Unknown keys are
    /// ignored; read-only ones are skipped.
    pub fn set_state(&self, state: &Record) -> meqcore::Result<()> {
        let mut exec = self.exec.lock();
        let mut st = self.state.lock();
        self.apply_state(&mut exec, &mut st, state)
    }

    pub(super) fn apply_state(
        &self,
        exec: &mut ExecSide,
        st: &mut NodeState,
        state: &Record,
    ) -> meqcore::Result<()> {
        if let Some(bits) = field::<u32>(state, "control_status")? {
            let writable = ControlStatus::WRITABLE;
            self.update_control(st, |c| {
                *c = ControlStatus::from_bits((c.bits() & !writable) | (bits & writable));
            });
        }
        if let Some(active) = field::<bool>(state, "active")? {
            self.update_control(st, |c| c.set(ControlStatus::ACTIVE, active));
        }
        if let Some(policy) = field::<CachePolicy>(state, "cache_policy")? {
            st.cache_policy = policy;
            if policy == CachePolicy::Never {
                self.drop_cache(st);
            }
        }
        if let Some(policy) = field::<ResamplePolicy>(state, "auto_resample")? {
            st.auto_resample = policy;
        }
        if let Some(policy) = field::<ChildErrorPolicy>(state, "fail_policy")? {
            exec.children.set_fail_policy(policy);
        }
        if let Some(policy) = field::<ChildErrorPolicy>(state, "missing_policy")? {
            exec.children.set_missing_policy(policy);
        }
        if let Some(on) = field::<bool>(state, "mt_polling")? {
            exec.children.set_mt_polling(on);
            exec.stepchildren.set_mt_polling(on);
        }
        if let Some(level) = field::<u8>(state, "publish_level")? {
            st.publish_level = level;
            self.update_control(st, |c| c.set(ControlStatus::PUBLISHING, level > 0));
        }
        if let Some(on) = field::<bool>(state, "log_results")? {
            st.log_results = on;
        }
        if let Some(n) = field::<usize>(state, "active_parents")? {
            st.parents.active_parents = Some(n);
        }
        let bp = field::<u32>(state, "breakpoint")?;
        let ss = field::<u32>(state, "breakpoint_ss")?;
        if bp.is_some() || ss.is_some() {
            if let Some(bits) = bp {
                st.breakpoint = BreakpointMask::from_bits(bits);
            }
            if let Some(bits) = ss {
                st.breakpoint_ss = BreakpointMask::from_bits(bits);
            }
            let (bp, ss) = (!st.breakpoint.is_empty(), !st.breakpoint_ss.is_empty());
            self.update_control(st, |c| {
                c.set(ControlStatus::BREAKPOINT, bp);
                c.set(ControlStatus::BREAKPOINT_SS, ss);
            });
        }
        if let Some(kernel) = state.get("kernel").and_then(Value::as_record) {
            exec.kernel
                .set_state(kernel)
                .map_err(|e| MeqError::InvalidState(format!("kernel: {}", e)))?;
        }
        if let Some(entry) = field::<CacheEntry>(state, "cache")? {
            st.cache = Some(entry);
            st.parents.reset();
            self.update_control(st, |c| c.set(ControlStatus::CACHED, true));
        }
        Ok(())
    }
}

fn enum_value<T: serde::Serialize>(value: &T) -> Value {
    Value::from_serialize(value).unwrap_or(Value::Null)
}
