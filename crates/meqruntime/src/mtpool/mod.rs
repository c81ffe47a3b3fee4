//! Brigade thread pool
//!
//! A [`Scheduler`] owns every brigade of a forest together with the idle
//! pool. Brigades are admitted through an [`Admission`] semaphore so that at
//! most `max_active_brigades` of them dispatch work at once; a poll that
//! cannot get a brigade runs its children serially in the calling thread.
//!
//! Lock order: scheduler glob → brigade → node state.

mod admission;
mod brigade;
mod work_order;

pub use admission::{Admission, Permit};
pub use brigade::{current, Brigade, BrigadeStats};
pub use work_order::{PollSink, WorkOrder};

use meqcore::{ForestSettings, MeqError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use brigade::set_current;

struct Glob {
    all: Vec<Arc<Brigade>>,
    idle: Vec<Arc<Brigade>>,
    next_id: usize,
    stopped: bool,
}

/// Counters of a scheduler, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub brigades: usize,
    pub idle: usize,
    pub active: usize,
    pub peak_active: usize,
    pub max_active: usize,
}

pub struct Scheduler {
    glob: Mutex<Glob>,
    brigade_size: AtomicUsize,
    admission: Arc<Admission>,
}

impl Scheduler {
    pub fn new(settings: &ForestSettings) -> Arc<Self> {
        Arc::new(Self {
            glob: Mutex::new(Glob {
                all: Vec::new(),
                idle: Vec::new(),
                next_id: 1,
                stopped: false,
            }),
            brigade_size: AtomicUsize::new(settings.brigade_size),
            admission: Admission::new(settings.max_active_brigades),
        })
    }

    /// Threads per brigade, counting the thread that joins it. Can only be
    /// changed before the first brigade starts.
    pub fn set_brigade_size(&self, n: usize) -> meqcore::Result<()> {
        let glob = self.glob.lock();
        if !glob.all.is_empty() {
            return Err(MeqError::Scheduler(
                "brigade size cannot change once brigades exist".to_string(),
            ));
        }
        self.brigade_size.store(n, Ordering::Release);
        Ok(())
    }

    pub fn brigade_size(&self) -> usize {
        self.brigade_size.load(Ordering::Acquire)
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    /// Starts a brigade; `one_short` leaves room for the calling thread.
    pub fn start_new_brigade(&self, one_short: bool) -> meqcore::Result<Arc<Brigade>> {
        let size = self.brigade_size();
        let workers = if one_short { size.saturating_sub(1) } else { size };
        let id = {
            let mut glob = self.glob.lock();
            if glob.stopped {
                return Err(MeqError::Scheduler("scheduler is stopped".to_string()));
            }
            let id = glob.next_id;
            glob.next_id += 1;
            id
        };
        let brigade = Brigade::start(id, workers, Arc::clone(&self.admission))?;
        self.glob.lock().all.push(Arc::clone(&brigade));
        Ok(brigade)
    }

    /// Makes the calling thread a member of an idle brigade, starting a new
    /// one if the pool is empty. Returns the brigade and the thread's
    /// previous brigade.
    pub fn join_idle_brigade(
        &self,
        permit: Option<Permit>,
    ) -> meqcore::Result<(Arc<Brigade>, Option<Arc<Brigade>>)> {
        let pooled = self.glob.lock().idle.pop();
        let brigade = match pooled {
            Some(b) => {
                b.wait_until_idle(0);
                b
            }
            None => self.start_new_brigade(true)?,
        };
        let previous = brigade.join(permit);
        tracing::debug!(brigade = brigade.id(), "joined brigade");
        Ok((brigade, previous))
    }

    fn release_brigade(&self, brigade: Arc<Brigade>) {
        let mut glob = self.glob.lock();
        if !glob.stopped && !brigade.is_cancelled() {
            glob.idle.push(brigade);
        }
    }

    /// Picks a brigade for a multithreaded poll by the calling thread, or
    /// `None` if the poll should run serially.
    pub fn lease_for_poll(self: &Arc<Self>) -> Option<BrigadeLease> {
        match current() {
            Some(current) => {
                if current.is_free_for_caller() {
                    return Some(BrigadeLease {
                        scheduler: Arc::clone(self),
                        brigade: current,
                        kind: LeaseKind::Reuse,
                    });
                }
                if !current.has_other_runnable() {
                    // Nobody else here can run work: our permit moves along.
                    let mut permit = current.suspend();
                    if permit.is_none() {
                        permit = self.admission.try_acquire();
                    }
                    if permit.is_none() {
                        current.resume(None);
                        return None;
                    }
                    return match self.join_idle_brigade(permit) {
                        Ok((brigade, _)) => Some(BrigadeLease {
                            scheduler: Arc::clone(self),
                            brigade,
                            kind: LeaseKind::Suspended(current),
                        }),
                        Err(e) => {
                            tracing::warn!("cannot join brigade: {}", e);
                            current.resume(None);
                            None
                        }
                    };
                }
                let permit = self.admission.try_acquire()?;
                current.temp_leave();
                match self.join_idle_brigade(Some(permit)) {
                    Ok((brigade, _)) => Some(BrigadeLease {
                        scheduler: Arc::clone(self),
                        brigade,
                        kind: LeaseKind::TempLeft(current),
                    }),
                    Err(e) => {
                        tracing::warn!("cannot join brigade: {}", e);
                        current.rejoin();
                        set_current(Some(current));
                        None
                    }
                }
            }
            None => {
                let permit = self.admission.try_acquire()?;
                match self.join_idle_brigade(Some(permit)) {
                    Ok((brigade, _)) => Some(BrigadeLease {
                        scheduler: Arc::clone(self),
                        brigade,
                        kind: LeaseKind::Joined,
                    }),
                    Err(e) => {
                        tracing::warn!("cannot join brigade: {}", e);
                        None
                    }
                }
            }
        }
    }

    /// Cancels every brigade and joins its workers. Queued orders are
    /// dropped, which cancels their poll slots.
    pub fn stop_all(&self) {
        let brigades: Vec<Arc<Brigade>> = {
            let mut glob = self.glob.lock();
            glob.stopped = true;
            glob.idle.clear();
            std::mem::take(&mut glob.all)
        };
        if brigades.is_empty() {
            return;
        }
        for brigade in &brigades {
            brigade.cancel();
        }
        for brigade in &brigades {
            brigade.join_workers();
        }
        tracing::debug!(brigades = brigades.len(), "stopped all brigades");
    }

    pub fn stats(&self) -> SchedulerStats {
        let glob = self.glob.lock();
        SchedulerStats {
            brigades: glob.all.len(),
            idle: glob.idle.len(),
            active: self.admission.active(),
            peak_active: self.admission.peak(),
            max_active: self.admission.max(),
        }
    }

    pub fn brigade_stats(&self) -> Vec<BrigadeStats> {
        let brigades: Vec<Arc<Brigade>> = self.glob.lock().all.clone();
        brigades.iter().map(|b| b.stats()).collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

enum LeaseKind {
    /// The thread's own brigade was free.
    Reuse,
    /// The thread had no brigade and joined one.
    Joined,
    /// The thread stepped out of its brigade under a fresh permit.
    TempLeft(Arc<Brigade>),
    /// The thread's brigade was suspended and its permit moved along.
    Suspended(Arc<Brigade>),
}

/// Brigade granted to one poll. Dropping the lease restores the thread's
/// previous membership.
pub struct BrigadeLease {
    scheduler: Arc<Scheduler>,
    brigade: Arc<Brigade>,
    kind: LeaseKind,
}

impl BrigadeLease {
    pub fn brigade(&self) -> &Arc<Brigade> {
        &self.brigade
    }

    pub fn is_reused(&self) -> bool {
        matches!(self.kind, LeaseKind::Reuse)
    }
}

impl Drop for BrigadeLease {
    fn drop(&mut self) {
        let kind = std::mem::replace(&mut self.kind, LeaseKind::Reuse);
        match kind {
            LeaseKind::Reuse => {}
            LeaseKind::Joined => {
                drop(self.brigade.leave());
                set_current(None);
                self.scheduler.release_brigade(Arc::clone(&self.brigade));
            }
            LeaseKind::TempLeft(previous) => {
                drop(self.brigade.leave());
                self.scheduler.release_brigade(Arc::clone(&self.brigade));
                previous.rejoin();
                set_current(Some(previous));
            }
            LeaseKind::Suspended(previous) => {
                let permit = self.brigade.leave();
                self.scheduler.release_brigade(Arc::clone(&self.brigade));
                previous.resume(permit);
                set_current(Some(previous));
            }
        }
    }
}
