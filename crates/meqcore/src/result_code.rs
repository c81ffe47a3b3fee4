use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::depend::DependMask;

/// Return code of `Node::execute`: dependency bits in the low 16 bits, status
/// flags above them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(u32);

impl ResultCode {
    pub const NONE: ResultCode = ResultCode(0);
    pub const UPDATED: ResultCode = ResultCode(1 << 16);
    pub const WAIT: ResultCode = ResultCode(1 << 17);
    pub const MISSING: ResultCode = ResultCode(1 << 18);
    pub const FAIL: ResultCode = ResultCode(1 << 19);
    pub const ABORT: ResultCode = ResultCode(1 << 20);
    pub const IGNORE_TYPE: ResultCode = ResultCode(1 << 21);

    const DEPEND_BITS: u32 = 0xFFFF;

    pub const fn from_bits(bits: u32) -> Self {
        ResultCode(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn from_mask(mask: DependMask) -> Self {
        ResultCode(mask.bits())
    }

    /// Dependency part of the code.
    pub fn depend_mask(self) -> DependMask {
        DependMask::new(self.0 & Self::DEPEND_BITS)
    }

    pub fn flags(self) -> ResultCode {
        ResultCode(self.0 & !Self::DEPEND_BITS)
    }

    pub const fn has(self, flag: ResultCode) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(self, flag: ResultCode) -> Self {
        ResultCode(self.0 | flag.0)
    }

    pub fn without(self, flag: ResultCode) -> Self {
        ResultCode(self.0 & !flag.0)
    }

    pub fn with_mask(self, mask: DependMask) -> Self {
        ResultCode(self.0 | mask.bits())
    }

    pub fn is_fail(self) -> bool {
        self.has(Self::FAIL)
    }

    pub fn is_missing(self) -> bool {
        self.has(Self::MISSING)
    }

    pub fn is_wait(self) -> bool {
        self.has(Self::WAIT)
    }

    pub fn is_abort(self) -> bool {
        self.has(Self::ABORT)
    }
}

impl BitOr for ResultCode {
    type Output = ResultCode;
    fn bitor(self, rhs: Self) -> Self {
        ResultCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResultCode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitOr<DependMask> for ResultCode {
    type Output = ResultCode;
    fn bitor(self, rhs: DependMask) -> Self {
        self.with_mask(rhs)
    }
}

impl BitOrAssign<DependMask> for ResultCode {
    fn bitor_assign(&mut self, rhs: DependMask) {
        *self = self.with_mask(rhs);
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.depend_mask())?;
        for (flag, name) in [
            (Self::UPDATED, "UPDATED"),
            (Self::WAIT, "WAIT"),
            (Self::MISSING, "MISSING"),
            (Self::FAIL, "FAIL"),
            (Self::ABORT, "ABORT"),
            (Self::IGNORE_TYPE, "IGNORE_TYPE"),
        ] {
            if self.has(flag) {
                write!(f, "|{}", name)?;
            }
        }
        Ok(())
    }
}
