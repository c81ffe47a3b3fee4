use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Execution sub-state of a node, stored in bits 12..16 of its control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecState {
    Idle = 0,
    Request = 1,
    Command = 2,
    Polling = 3,
    Evaluating = 4,
}

impl ExecState {
    fn from_bits(bits: u32) -> ExecState {
        match bits {
            1 => ExecState::Request,
            2 => ExecState::Command,
            3 => ExecState::Polling,
            4 => ExecState::Evaluating,
            _ => ExecState::Idle,
        }
    }
}

/// Kind of the last result a node produced, stored in bits 1..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    None = 0,
    Ok = 1,
    Wait = 2,
    Empty = 3,
    Missing = 4,
    Fail = 5,
}

impl ResultType {
    fn from_bits(bits: u32) -> ResultType {
        match bits {
            1 => ResultType::Ok,
            2 => ResultType::Wait,
            3 => ResultType::Empty,
            4 => ResultType::Missing,
            5 => ResultType::Fail,
            _ => ResultType::None,
        }
    }
}

/// Per-node control status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlStatus(u32);

impl ControlStatus {
    pub const ACTIVE: u32 = 0x1;
    pub const PUBLISHING: u32 = 0x10;
    pub const CACHED: u32 = 0x20;
    pub const RETCACHE: u32 = 0x40;
    pub const BREAKPOINT: u32 = 0x80;
    pub const BREAKPOINT_SS: u32 = 0x100;
    pub const STOPPED: u32 = 0x200;
    pub const STOP_BREAKPOINT: u32 = 0x400;

    /// Bits a controlling agent may set directly.
    pub const WRITABLE: u32 = Self::ACTIVE;

    const RES_SHIFT: u32 = 1;
    const RES_MASK: u32 = 0x7 << Self::RES_SHIFT;
    const ES_SHIFT: u32 = 12;
    const ES_MASK: u32 = 0xF << Self::ES_SHIFT;

    pub const fn from_bits(bits: u32) -> Self {
        ControlStatus(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    pub fn is_active(self) -> bool {
        self.has(Self::ACTIVE)
    }

    pub fn exec_state(self) -> ExecState {
        ExecState::from_bits((self.0 & Self::ES_MASK) >> Self::ES_SHIFT)
    }

    pub fn set_exec_state(&mut self, state: ExecState) {
        self.0 = (self.0 & !Self::ES_MASK) | ((state as u32) << Self::ES_SHIFT);
    }

    pub fn result_type(self) -> ResultType {
        ResultType::from_bits((self.0 & Self::RES_MASK) >> Self::RES_SHIFT)
    }

    pub fn set_result_type(&mut self, rt: ResultType) {
        self.0 = (self.0 & !Self::RES_MASK) | ((rt as u32) << Self::RES_SHIFT);
    }
}

impl Default for ControlStatus {
    fn default() -> Self {
        ControlStatus(Self::ACTIVE)
    }
}

impl fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.exec_state(), self.result_type())?;
        for (flag, name) in [
            (Self::ACTIVE, "active"),
            (Self::PUBLISHING, "publishing"),
            (Self::CACHED, "cached"),
            (Self::RETCACHE, "retcache"),
            (Self::BREAKPOINT, "bp"),
            (Self::BREAKPOINT_SS, "bp1"),
            (Self::STOPPED, "stopped"),
            (Self::STOP_BREAKPOINT, "stop-bp"),
        ] {
            if self.has(flag) {
                write!(f, " {}", name)?;
            }
        }
        Ok(())
    }
}

/// Exec states (and the FAIL condition) on which a breakpoint fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointMask(u32);

impl BreakpointMask {
    pub const NONE: BreakpointMask = BreakpointMask(0);
    pub const FAIL: BreakpointMask = BreakpointMask(1 << 15);
    pub const ALL: BreakpointMask = BreakpointMask(0xFFFF);

    pub const fn from_bits(bits: u32) -> Self {
        BreakpointMask(bits & 0xFFFF)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn on_state(state: ExecState) -> Self {
        BreakpointMask(1 << state as u32)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: BreakpointMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: BreakpointMask) -> Self {
        BreakpointMask(self.0 & !other.0)
    }
}

impl BitOr for BreakpointMask {
    type Output = BreakpointMask;
    fn bitor(self, rhs: Self) -> Self {
        BreakpointMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for BreakpointMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
