use meqcore::{CachePolicy, EvalMode, Request, RequestId, ResultCode, ResultRef, Service};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Service a cached result answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RequestKind {
    Evaluate,
    DiscoverSpids,
    ParmUpdate,
}

impl RequestKind {
    pub(crate) fn of(request: &Request) -> Self {
        match request.service {
            Service::Evaluate => RequestKind::Evaluate,
            Service::DiscoverSpids => RequestKind::DiscoverSpids,
            Service::ParmUpdate { .. } => RequestKind::ParmUpdate,
        }
    }
}

/// One cached result with the request it answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub result: ResultRef,
    pub request_id: RequestId,
    pub code: ResultCode,
    pub eval_mode: EvalMode,
    pub kind: RequestKind,
    /// Kept past the parents' check-ins.
    pub long: bool,
}

impl CacheEntry {
    /// Cached result for `request`, if this entry answers it. An
    /// evaluation without derivatives can reuse a result computed with
    /// them; the stripped copy leaves the cached result untouched.
    pub(crate) fn lookup(&self, request: &Request) -> Option<ResultRef> {
        if request.id.is_empty() || self.kind != RequestKind::of(request) {
            return None;
        }
        if self
            .request_id
            .diff_mask(&request.id)
            .intersects(self.code.depend_mask())
        {
            return None;
        }
        if request.eval_mode == self.eval_mode {
            return Some(Arc::clone(&self.result));
        }
        if request.eval_mode == EvalMode::Eval && self.eval_mode > EvalMode::Eval {
            return Some(Arc::new(self.result.strip_derivatives()));
        }
        None
    }
}

/// Parent check-ins on a node's current cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ParentInfo {
    pub num_parents: usize,
    /// Parents expected to check in; defaults to `num_parents`.
    pub active_parents: Option<usize>,
    pub hints: usize,
    pub holds: usize,
}

impl ParentInfo {
    pub(crate) fn expected(&self) -> usize {
        self.active_parents.unwrap_or(self.num_parents)
    }

    pub(crate) fn reset(&mut self) {
        self.hints = 0;
        self.holds = 0;
    }

    /// Records a parent's hold or release. Returns true once every
    /// expected parent has checked in and none holds the cache.
    pub(crate) fn hint(&mut self, hold: bool) -> bool {
        if self.hints < self.expected() {
            self.hints += 1;
            if hold {
                self.holds += 1;
            }
        } else if hold {
            self.holds += 1;
        } else {
            self.holds = self.holds.saturating_sub(1);
        }
        self.hints >= self.expected() && self.holds == 0
    }
}

/// How a freshly computed result should be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention {
    Discard,
    Short,
    Long,
}

/// Retention of a result computed for `request` under `policy`.
/// `missing_hint` is set when a smart cache had to guess without a next id.
pub(crate) fn retention(
    policy: CachePolicy,
    code: ResultCode,
    request: &Request,
    parents: &ParentInfo,
    missing_hint: &mut bool,
) -> Retention {
    if request.id.is_empty() || code.is_wait() || code.is_abort() {
        return Retention::Discard;
    }
    // FAIL is retained under every policy.
    if code.is_fail() {
        return Retention::Long;
    }
    match policy {
        CachePolicy::Never => Retention::Discard,
        CachePolicy::Minimal if parents.expected() > 1 => Retention::Short,
        CachePolicy::Minimal => Retention::Discard,
        CachePolicy::Smart => match &request.next_id {
            Some(next) if !next.diff_mask(&request.id).intersects(code.depend_mask()) => Retention::Long,
            Some(_) => Retention::Short,
            None => {
                *missing_hint = true;
                Retention::Short
            }
        },
        CachePolicy::Always => Retention::Long,
    }
}
