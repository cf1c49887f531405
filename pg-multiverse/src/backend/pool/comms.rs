//! Internal pool notifications.

use parking_lot::Mutex;
use tokio::sync::watch;

/// Shared between the pool handle and its initializer task.
#[derive(Debug)]
pub(crate) struct Comms {
    /// Bumped on every lifecycle change. Waiters subscribe before
    /// checking state, so transitions are never missed.
    pub(super) changed: watch::Sender<()>,
    /// Initializer failure, retained so waiters see the cause.
    pub(super) init_error: Mutex<Option<String>>,
}

impl Default for Comms {
    fn default() -> Self {
        let (changed, _) = watch::channel(());
        Self {
            changed,
            init_error: Mutex::new(None),
        }
    }
}

impl Comms {
    /// Wake everyone waiting on a lifecycle change.
    pub(super) fn notify(&self) {
        self.changed.send_replace(());
    }
}
