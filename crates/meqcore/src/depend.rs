use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Number of request-id positions a dependency mask can address.
pub const RQIDM_NBITS: usize = 16;

const VALID_BITS: u32 = (1 << RQIDM_NBITS) - 1;

/// Bitmask over request-id positions. Bit 0 addresses the last sub-id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependMask(u32);

impl DependMask {
    pub const NONE: DependMask = DependMask(0);
    pub const ALL: DependMask = DependMask(VALID_BITS);

    pub const fn new(bits: u32) -> Self {
        DependMask(bits & VALID_BITS)
    }

    pub const fn bit(position: usize) -> Self {
        DependMask::new(1 << position)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: DependMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: DependMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Positions of set bits, lowest first.
    pub fn positions(self) -> impl Iterator<Item = usize> {
        (0..RQIDM_NBITS).filter(move |&i| self.0 & (1 << i) != 0)
    }

    /// Lowest bit not set in this mask, if any remain.
    pub fn first_free(self) -> Option<usize> {
        (0..RQIDM_NBITS).find(|&i| self.0 & (1 << i) == 0)
    }
}

impl BitOr for DependMask {
    type Output = DependMask;
    fn bitor(self, rhs: Self) -> Self {
        DependMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for DependMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DependMask {
    type Output = DependMask;
    fn bitand(self, rhs: Self) -> Self {
        DependMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for DependMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for DependMask {
    type Output = DependMask;
    fn not(self) -> Self {
        DependMask(!self.0 & VALID_BITS)
    }
}

impl fmt::Display for DependMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Names and masks of the symbolic dependencies every forest starts with.
pub mod symdeps {
    use super::DependMask;

    pub const ITERATION: &str = "Iteration";
    pub const STATE: &str = "State";
    pub const RESOLUTION: &str = "Resolution";
    pub const DOMAIN: &str = "Domain";
    pub const DATASET: &str = "Dataset";

    pub const DEFAULTS: [(&str, DependMask); 5] = [
        (ITERATION, DependMask::new(0x01)),
        (STATE, DependMask::new(0x02)),
        (RESOLUTION, DependMask::new(0x04)),
        (DOMAIN, DependMask::new(0x08)),
        (DATASET, DependMask::new(0x10)),
    ];

    /// Default mask of a symdep, for callers that have no forest at hand.
    pub fn default_mask(name: &str) -> Option<DependMask> {
        DEFAULTS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, m)| *m)
    }
}
