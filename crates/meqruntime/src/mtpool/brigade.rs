use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::admission::{Admission, Permit};
use super::work_order::WorkOrder;

/// Timed wait of a worker whose brigade has queued work but no permit.
const ADMISSION_RETRY: Duration = Duration::from_millis(5);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Brigade>>> = const { RefCell::new(None) };
}

/// Brigade the calling thread currently belongs to.
pub fn current() -> Option<Arc<Brigade>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn set_current(brigade: Option<Arc<Brigade>>) -> Option<Arc<Brigade>> {
    CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), brigade))
}

/// Snapshot of a brigade's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrigadeStats {
    pub id: usize,
    pub members: usize,
    pub busy: usize,
    pub nonblocked: usize,
    pub queued: usize,
    pub active: bool,
    pub suspended: bool,
}

struct BrigadeState {
    queue: VecDeque<WorkOrder>,
    members: usize,
    busy: usize,
    nonblocked: usize,
    temp_missing: usize,
    suspended: bool,
    /// Permit was given up; it is taken back when work is queued.
    deactivated: bool,
    cancelled: bool,
    permit: Option<Permit>,
}

/// Group of worker threads sharing one LIFO work queue.
///
/// The brigade dispatches work only while it holds an admission permit and
/// is not suspended. Membership counts include threads that joined from
/// outside, which drain their own orders while they wait.
pub struct Brigade {
    id: usize,
    admission: Arc<Admission>,
    state: Mutex<BrigadeState>,
    cond: Condvar,
    busy_cond: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Brigade {
    /// Spawns a brigade with `workers` threads, named `meq-brigade-<id>-<k>`.
    pub(crate) fn start(
        id: usize,
        workers: usize,
        admission: Arc<Admission>,
    ) -> std::io::Result<Arc<Brigade>> {
        let brigade = Arc::new(Brigade {
            id,
            admission,
            state: Mutex::new(BrigadeState {
                queue: VecDeque::new(),
                members: workers,
                busy: workers,
                nonblocked: workers,
                temp_missing: 0,
                suspended: false,
                deactivated: false,
                cancelled: false,
                permit: None,
            }),
            cond: Condvar::new(),
            busy_cond: Condvar::new(),
            workers: Mutex::new(Vec::with_capacity(workers)),
        });

        for k in 0..workers {
            let worker = Arc::clone(&brigade);
            let spawned = thread::Builder::new()
                .name(format!("meq-brigade-{}-{}", id, k))
                .spawn(move || worker.run_worker());
            match spawned {
                Ok(handle) => brigade.workers.lock().push(handle),
                Err(e) => {
                    // Threads already running exit on cancel.
                    brigade.cancel();
                    return Err(e);
                }
            }
        }
        tracing::debug!(brigade = id, workers, "started brigade");
        Ok(brigade)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn run_worker(self: Arc<Self>) {
        set_current(Some(Arc::clone(&self)));
        while let Some(order) = self.get_work_order(true) {
            order.run();
        }
        {
            let mut st = self.state.lock();
            st.members = st.members.saturating_sub(1);
            st.nonblocked = st.nonblocked.saturating_sub(1);
        }
        set_current(None);
        tracing::trace!(brigade = self.id, "worker exiting");
    }

    /// Pops the next order. With `wait`, the caller is marked idle and
    /// blocks until work is dispatchable; `None` then means the brigade was
    /// cancelled.
    pub fn get_work_order(&self, wait: bool) -> Option<WorkOrder> {
        let mut st = self.state.lock();
        let mut idle = false;
        loop {
            if st.cancelled {
                if idle {
                    st.busy += 1;
                }
                return None;
            }
            if !st.queue.is_empty() && !st.suspended {
                if st.permit.is_none() && st.deactivated {
                    if let Some(permit) = self.admission.try_acquire() {
                        st.permit = Some(permit);
                        st.deactivated = false;
                    }
                }
                if st.permit.is_some() {
                    let order = st.queue.pop_front();
                    if idle {
                        st.busy += 1;
                    }
                    return order;
                }
            }
            if !wait {
                return None;
            }
            if !idle {
                idle = true;
                st.busy = st.busy.saturating_sub(1);
                self.busy_cond.notify_all();
            }
            if st.queue.is_empty() && st.busy == 0 && st.temp_missing == 0 && st.permit.is_some() {
                // Nothing left to run: the permit goes back until new work arrives.
                st.permit = None;
                st.deactivated = true;
                tracing::trace!(brigade = self.id, "idle, releasing permit");
            }
            if st.queue.is_empty() {
                self.cond.wait(&mut st);
            } else {
                self.cond.wait_for(&mut st, ADMISSION_RETRY);
            }
        }
    }

    /// Queues an order at the front: the most recent order runs first.
    pub fn place_work_order(&self, order: WorkOrder) {
        let mut st = self.state.lock();
        if st.cancelled {
            drop(st);
            // Dropping the order cancels its slot.
            drop(order);
            return;
        }
        st.queue.push_front(order);
        self.cond.notify_one();
    }

    /// Queues a batch of orders in one step; the last one of the batch
    /// ends up at the front and runs first.
    pub fn place_work_orders(&self, orders: Vec<WorkOrder>) {
        let mut st = self.state.lock();
        if st.cancelled {
            drop(st);
            drop(orders);
            return;
        }
        for order in orders {
            st.queue.push_front(order);
        }
        self.cond.notify_all();
    }

    /// Removes the first queued order belonging to the given sink.
    pub fn take_order_for(&self, sink_id: usize) -> Option<WorkOrder> {
        let mut st = self.state.lock();
        let pos = st.queue.iter().position(|o| o.sink_id() == sink_id)?;
        st.queue.remove(pos)
    }

    /// Drops every queued order of the given sink.
    pub fn purge(&self, sink_id: usize) -> usize {
        let purged: Vec<WorkOrder> = {
            let mut st = self.state.lock();
            let (purged, kept): (VecDeque<_>, VecDeque<_>) =
                st.queue.drain(..).partition(|o| o.sink_id() == sink_id);
            st.queue = kept;
            purged.into_iter().collect()
        };
        let n = purged.len();
        drop(purged);
        if n > 0 {
            tracing::debug!(brigade = self.id, purged = n, "purged work orders");
        }
        n
    }

    /// True if nobody but the caller is busy and nothing is queued.
    pub fn is_free_for_caller(&self) -> bool {
        let st = self.state.lock();
        st.permit.is_some() && !st.suspended && st.queue.is_empty() && st.busy <= 1
    }

    /// True if some member other than the caller can still run work.
    pub fn has_other_runnable(&self) -> bool {
        self.state.lock().nonblocked > 1
    }

    /// Adds the calling thread as a member, handing the brigade its permit.
    pub(crate) fn join(self: &Arc<Self>, permit: Option<Permit>) -> Option<Arc<Brigade>> {
        {
            let mut st = self.state.lock();
            st.members += 1;
            st.busy += 1;
            st.nonblocked += 1;
            if permit.is_some() {
                st.permit = permit;
                st.deactivated = false;
            }
            self.cond.notify_all();
        }
        set_current(Some(Arc::clone(self)))
    }

    /// Removes the calling thread as a member; returns the brigade's permit.
    pub(crate) fn leave(&self) -> Option<Permit> {
        let mut st = self.state.lock();
        st.members = st.members.saturating_sub(1);
        st.busy = st.busy.saturating_sub(1);
        st.nonblocked = st.nonblocked.saturating_sub(1);
        // Orders left behind re-acquire a permit on the workers' next retry.
        st.deactivated = true;
        self.busy_cond.notify_all();
        self.cond.notify_all();
        st.permit.take()
    }

    /// The calling thread steps out for a while; `wait_until_idle` waits
    /// for it to come back.
    pub(crate) fn temp_leave(&self) {
        let mut st = self.state.lock();
        st.busy = st.busy.saturating_sub(1);
        st.nonblocked = st.nonblocked.saturating_sub(1);
        st.temp_missing += 1;
        self.busy_cond.notify_all();
    }

    pub(crate) fn rejoin(&self) {
        let mut st = self.state.lock();
        st.busy += 1;
        st.nonblocked += 1;
        st.temp_missing = st.temp_missing.saturating_sub(1);
        self.busy_cond.notify_all();
    }

    /// Stops dispatching and gives up the permit.
    pub(crate) fn suspend(&self) -> Option<Permit> {
        let mut st = self.state.lock();
        st.suspended = true;
        st.permit.take()
    }

    pub(crate) fn resume(&self, permit: Option<Permit>) {
        let mut st = self.state.lock();
        st.suspended = false;
        if permit.is_some() {
            st.permit = permit;
        } else if st.permit.is_none() {
            st.deactivated = true;
        }
        self.cond.notify_all();
    }

    /// A member is about to block outside the brigade. When no member is
    /// left running, the permit goes back so another brigade may activate.
    pub fn mark_as_blocked(&self) {
        let mut st = self.state.lock();
        st.nonblocked = st.nonblocked.saturating_sub(1);
        if st.nonblocked == 0 && st.permit.is_some() {
            st.permit = None;
            st.deactivated = true;
            tracing::debug!(brigade = self.id, "all members blocked, deactivating");
        }
    }

    pub fn mark_as_unblocked(&self) {
        let mut st = self.state.lock();
        st.nonblocked += 1;
        if st.deactivated && st.permit.is_none() && !st.suspended {
            if let Some(permit) = self.admission.try_acquire() {
                st.permit = Some(permit);
                st.deactivated = false;
                self.cond.notify_all();
            }
        }
    }

    /// Blocks until at most `minbusy` members are busy and no member is
    /// temporarily away.
    pub fn wait_until_idle(&self, minbusy: usize) {
        let mut st = self.state.lock();
        while !st.cancelled && (st.busy > minbusy || st.temp_missing > 0) {
            self.busy_cond.wait(&mut st);
        }
    }

    /// Cancels the brigade: queued orders are dropped and workers exit once
    /// their current order finishes.
    pub fn cancel(&self) {
        let dropped: Vec<WorkOrder> = {
            let mut st = self.state.lock();
            st.cancelled = true;
            st.permit = None;
            self.cond.notify_all();
            self.busy_cond.notify_all();
            st.queue.drain(..).collect()
        };
        drop(dropped);
    }

    /// Joins every worker thread; run after `cancel`.
    pub(crate) fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(brigade = self.id, "worker thread panicked");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn stats(&self) -> BrigadeStats {
        let st = self.state.lock();
        BrigadeStats {
            id: self.id,
            members: st.members,
            busy: st.busy,
            nonblocked: st.nonblocked,
            queued: st.queue.len(),
            active: st.permit.is_some(),
            suspended: st.suspended,
        }
    }
}
