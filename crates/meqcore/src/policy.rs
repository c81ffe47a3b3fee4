use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How long a node keeps its computed result.
///
/// - `Never`: nothing is retained (FAIL results excepted).
/// - `Minimal`: retained only for nodes with more than one active parent, until
///   every parent has checked in.
/// - `Smart`: retained past the current request when the next request will not
///   invalidate it, otherwise until every parent has checked in.
/// - `Always`: retained until invalidated or explicitly cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    Never,
    Minimal,
    Smart,
    Always,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Smart
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(CachePolicy::Never),
            "minimal" => Ok(CachePolicy::Minimal),
            "smart" => Ok(CachePolicy::Smart),
            "always" => Ok(CachePolicy::Always),
            other => Err(format!(
                "invalid cache policy: {other} (expected never, minimal, smart or always)"
            )),
        }
    }
}

/// What a parent does when children report FAIL or MISSING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildErrorPolicy {
    /// Drop the condition and evaluate anyway.
    Ignore,
    /// Stop polling the remaining children and propagate.
    AbandonPropagate,
    /// Poll every child, then propagate all collected fail records.
    CollectPropagate,
}

impl Default for ChildErrorPolicy {
    fn default() -> Self {
        ChildErrorPolicy::CollectPropagate
    }
}

impl FromStr for ChildErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "ignore" => Ok(ChildErrorPolicy::Ignore),
            "abandon" | "abandon_propagate" => Ok(ChildErrorPolicy::AbandonPropagate),
            "collect" | "collect_propagate" => Ok(ChildErrorPolicy::CollectPropagate),
            other => Err(format!("invalid child error policy: {other}")),
        }
    }
}

/// Reconciliation of children computed on different cell grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplePolicy {
    Fail,
    None,
    Integrate,
    Upsample,
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        ResamplePolicy::Fail
    }
}

impl FromStr for ResamplePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(ResamplePolicy::Fail),
            "none" => Ok(ResamplePolicy::None),
            "integrate" => Ok(ResamplePolicy::Integrate),
            "upsample" => Ok(ResamplePolicy::Upsample),
            other => Err(format!("invalid resample policy: {other}")),
        }
    }
}
