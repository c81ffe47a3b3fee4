use meqcore::{CachePolicy, ControlStatus, NodeCommand};

use super::{ExecSide, Node, NodeState};

impl Node {
    /// Applies one rider command. Runs with both node locks held.
    pub(super) fn apply_command(
        &self,
        exec: &mut ExecSide,
        st: &mut NodeState,
        cmd: &NodeCommand,
    ) -> meqcore::Result<()> {
        tracing::debug!(node = %self.name, ?cmd, "rider command");
        match cmd {
            NodeCommand::ClearCache => self.drop_cache(st),
            NodeCommand::SetActive { active } => {
                self.update_control(st, |c| c.set(ControlStatus::ACTIVE, *active));
            }
            NodeCommand::SetBreakpoint { mask, single_shot } => {
                self.add_breakpoint(st, *mask, *single_shot);
            }
            NodeCommand::ClearBreakpoint { mask } => self.remove_breakpoint(st, *mask),
            NodeCommand::SetPublishLevel { level } => {
                st.publish_level = *level;
                self.update_control(st, |c| c.set(ControlStatus::PUBLISHING, *level > 0));
            }
            NodeCommand::SetCachePolicy { policy } => {
                st.cache_policy = *policy;
                if *policy == CachePolicy::Never {
                    self.drop_cache(st);
                }
            }
            NodeCommand::SetState { state } => self.apply_state(exec, st, state)?,
        }
        Ok(())
    }
}
