use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::depend::{DependMask, RQIDM_NBITS};
use crate::MeqError;

/// Ordered sequence of sub-ids identifying a request.
///
/// Mask bit `i` addresses the sub-id at position `len - 1 - i`, so bit 0 is
/// always the last component. Ids of different length line up at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Vec<u32>);

impl RequestId {
    pub fn new(ids: impl Into<Vec<u32>>) -> Self {
        RequestId(ids.into())
    }

    pub fn empty() -> Self {
        RequestId(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// Sub-id addressed by mask bit `bit`, if the id is long enough.
    pub fn sub_id(&self, bit: usize) -> Option<u32> {
        if bit >= self.0.len() {
            return None;
        }
        Some(self.0[self.0.len() - 1 - bit])
    }

    /// True if both ids are non-empty and agree on every position in `mask`.
    /// A masked position present in only one of the ids is a mismatch.
    pub fn masked_equal(&self, other: &RequestId, mask: DependMask) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        mask.positions()
            .all(|bit| match (self.sub_id(bit), other.sub_id(bit)) {
                (Some(a), Some(b)) => a == b,
                (None, None) => true,
                _ => false,
            })
    }

    /// Mask of the positions at which the two ids differ.
    pub fn diff_mask(&self, other: &RequestId) -> DependMask {
        if self.is_empty() || other.is_empty() {
            return DependMask::ALL;
        }
        let mut mask = DependMask::NONE;
        for bit in 0..RQIDM_NBITS {
            if self.sub_id(bit) != other.sub_id(bit) {
                mask |= DependMask::bit(bit);
            }
        }
        mask
    }

    /// Increments the sub-id at every position in `mask`, growing the id at
    /// the front when a position does not exist yet.
    pub fn incr_sub_id(&mut self, mask: DependMask) {
        for bit in mask.positions() {
            let value = self.sub_id(bit).unwrap_or(0);
            self.set_sub_id(bit, value.wrapping_add(1));
        }
    }

    pub fn set_sub_id(&mut self, bit: usize, value: u32) {
        if bit >= self.0.len() {
            let grow = bit + 1 - self.0.len();
            self.0.splice(0..0, std::iter::repeat(0).take(grow));
        }
        let pos = self.0.len() - 1 - bit;
        self.0[pos] = value;
    }
}

impl From<Vec<u32>> for RequestId {
    fn from(ids: Vec<u32>) -> Self {
        RequestId(ids)
    }
}

impl From<&[u32]> for RequestId {
    fn from(ids: &[u32]) -> Self {
        RequestId(ids.to_vec())
    }
}

impl<const N: usize> From<[u32; N]> for RequestId {
    fn from(ids: [u32; N]) -> Self {
        RequestId(ids.to_vec())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", id)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for RequestId {
    type Err = MeqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(RequestId::empty());
        }
        s.split('.')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| MeqError::InvalidRequestId(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(RequestId)
    }
}
