//! Tracked set of outstanding transfers
//!
//! Every submitted outbound transfer is anchored until its completion
//! callback retires it. Teardown paths use [`Anchor::kill_all`] to cancel
//! everything and sleep until each cancelled transfer's callback has finished.

use crate::access::lock;
use protocol::TransferId;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub(crate) struct Anchor {
    submitted: Mutex<HashSet<TransferId>>,
    changed: Condvar,
}

impl Anchor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn anchor(&self, id: TransferId) {
        lock(&self.submitted).insert(id);
    }

    /// Remove a transfer that never reached the transport
    pub(crate) fn unanchor(&self, id: TransferId) {
        self.retire(id, ());
    }

    /// Remove a finished transfer and drop `resource` before anyone waiting
    /// on the set can observe the removal
    pub(crate) fn retire<R>(&self, id: TransferId, resource: R) {
        let mut submitted = lock(&self.submitted);
        submitted.remove(&id);
        drop(resource);
        self.changed.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.submitted).len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.submitted).is_empty()
    }

    /// Sleep until the set is empty; false if `timeout` ran out first
    pub(crate) fn wait_empty_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut submitted = lock(&self.submitted);
        while !submitted.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            submitted = self
                .changed
                .wait_timeout(submitted, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Cancel every anchored transfer and wait for all of their callbacks
    ///
    /// Transfers anchored after the snapshot are left alone. Returns the
    /// number of transfers cancelled.
    pub(crate) fn kill_all(&self, cancel: impl Fn(TransferId)) -> usize {
        let victims: Vec<TransferId> = lock(&self.submitted).iter().copied().collect();
        if victims.is_empty() {
            return 0;
        }

        // Cancel outside the lock; a transport may complete synchronously
        for id in &victims {
            cancel(*id);
        }

        let mut submitted = lock(&self.submitted);
        while victims.iter().any(|id| submitted.contains(id)) {
            submitted = self
                .changed
                .wait(submitted)
                .unwrap_or_else(PoisonError::into_inner);
        }
        victims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_anchor_and_retire() {
        let anchor = Anchor::new();
        anchor.anchor(TransferId(1));
        anchor.anchor(TransferId(2));
        assert_eq!(anchor.len(), 2);

        anchor.retire(TransferId(1), ());
        anchor.unanchor(TransferId(2));
        assert!(anchor.is_empty());
    }

    #[test]
    fn test_wait_empty_timeout() {
        let anchor = Arc::new(Anchor::new());
        assert!(anchor.wait_empty_timeout(Duration::from_millis(1)));

        anchor.anchor(TransferId(7));
        assert!(!anchor.wait_empty_timeout(Duration::from_millis(20)));

        let retirer = {
            let anchor = Arc::clone(&anchor);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                anchor.retire(TransferId(7), ());
            })
        };
        assert!(anchor.wait_empty_timeout(Duration::from_secs(5)));
        retirer.join().unwrap();
    }

    #[test]
    fn test_kill_all_waits_for_callbacks() {
        let anchor = Arc::new(Anchor::new());
        for id in 0..4 {
            anchor.anchor(TransferId(id));
        }

        // Each cancel completes asynchronously on its own thread
        let killed = anchor.kill_all(|id| {
            let anchor = Arc::clone(&anchor);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                anchor.retire(id, ());
            });
        });

        assert_eq!(killed, 4);
        assert!(anchor.is_empty());
    }

    #[test]
    fn test_kill_all_empty() {
        let anchor = Anchor::new();
        assert_eq!(anchor.kill_all(|_| panic!("nothing to cancel")), 0);
    }
}
