//! Bookkeeping for a group of search workers.

use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;
use parking_lot::{ Condvar, Mutex };

/// Tracks the number of running workers, and lets the coordinator sleep
/// until either every worker has exited or some condition holds.
pub struct WorkGroup {
    running: Mutex<usize>,
    cvar: Condvar,
    cancel: AtomicBool,
}
impl WorkGroup {
    /// Upper bound on how long the coordinator sleeps before checking
    /// its condition again.
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new() -> Self {
        Self {
            running: Mutex::new(0),
            cvar: Condvar::new(),
            cancel: AtomicBool::new(false),
        }
    }

    /// Register a new worker. Must be called before the worker is spawned.
    pub fn enter(&self) -> Member<'_> {
        *self.running.lock() += 1;
        Member { group: self }
    }

    pub fn running(&self) -> usize {
        *self.running.lock()
    }

    /// Wake up the coordinator.
    pub fn notify(&self) {
        let _running = self.running.lock();
        self.cvar.notify_all();
    }

    /// Ask all workers to stop at their next opportunity.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Block until every worker has exited, or until `done` returns true.
    pub fn wait_until(&self, done: impl Fn() -> bool) {
        let mut running = self.running.lock();
        while *running > 0 && !done() {
            self.cvar.wait_for(&mut running, Self::POLL_INTERVAL);
        }
    }
}

/// Membership in a [`WorkGroup`]. The worker leaves the group when this is
/// dropped (including when it unwinds).
pub struct Member<'a> {
    group: &'a WorkGroup,
}
impl Member<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.group.is_cancelled()
    }
    pub fn notify(&self) {
        self.group.notify();
    }
}
impl Drop for Member<'_> {
    fn drop(&mut self) {
        let mut running = self.group.running.lock();
        *running -= 1;
        self.group.cvar.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn wait_for_exit() {
        let group = WorkGroup::new();
        let work = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let member = group.enter();
                let work = &work;
                s.spawn(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    work.fetch_add(1, Ordering::SeqCst);
                    drop(member);
                });
            }
            group.wait_until(|| false);
            assert_eq!(group.running(), 0);
            assert_eq!(work.load(Ordering::SeqCst), 4);
        });
    }

    #[test]
    fn cancel_on_condition() {
        let group = WorkGroup::new();
        let work = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let member = group.enter();
                let work = &work;
                s.spawn(move || {
                    while !member.is_cancelled() {
                        work.fetch_add(1, Ordering::SeqCst);
                        member.notify();
                        std::thread::yield_now();
                    }
                });
            }
            group.wait_until(|| work.load(Ordering::SeqCst) >= 100);
            group.cancel();
        });
        assert_eq!(group.running(), 0);
        assert!(work.load(Ordering::SeqCst) >= 100);
    }
}
