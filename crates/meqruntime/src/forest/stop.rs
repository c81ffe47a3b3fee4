use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

/// Forest-wide stop flag. Nodes reaching a transition while it is raised
/// wait until it is cleared, or until the forest aborts.
#[derive(Default)]
pub struct StopSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        *self.raised.lock() = true;
    }

    pub fn clear(&self) {
        let mut raised = self.raised.lock();
        *raised = false;
        self.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Blocks while the flag is raised and `abort` has not fired.
    pub fn wait(&self, abort: &CancellationToken) {
        let mut raised = self.raised.lock();
        while *raised && !abort.is_cancelled() {
            self.cond.wait(&mut raised);
        }
    }

    /// Wakes every waiter so it can re-check the abort token.
    pub fn wake_all(&self) {
        let _raised = self.raised.lock();
        self.cond.notify_all();
    }
}
