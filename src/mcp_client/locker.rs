//! Per-session busy flag used to linearize connect attempts.
//!
//! A `Locker` has exactly one holder at a time. Other callers can either
//! `wait()` for it to clear (without taking it) or `lock()` it themselves once
//! it does. Release happens when the [`LockerGuard`] is dropped, so an early
//! return, a panic, or a cancelled future all unlock it.

use tokio::sync::watch;

/// Exclusive busy flag with waiters.
#[derive(Debug)]
pub struct Locker {
    busy: watch::Sender<bool>,
}

/// Proof of holding a [`Locker`]. Unlocks on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockerGuard<'a> {
    locker: &'a Locker,
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

impl Locker {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self { busy }
    }

    /// Whether some caller currently holds the lock.
    pub fn is_locked(&self) -> bool {
        *self.busy.borrow()
    }

    /// Take the lock if it is free, without waiting.
    pub fn try_lock(&self) -> Option<LockerGuard<'_>> {
        let acquired = self.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        acquired.then(|| LockerGuard { locker: self })
    }

    /// Take the lock, waiting for the current holder to release it first.
    pub async fn lock(&self) -> LockerGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            self.wait().await;
        }
    }

    /// Wait until the lock is free. Does not acquire it.
    pub async fn wait(&self) {
        let mut rx = self.busy.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    fn unlock(&self) {
        self.busy.send_replace(false);
    }
}

impl LockerGuard<'_> {
    /// Release the lock explicitly.
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for LockerGuard<'_> {
    fn drop(&mut self) {
        self.locker.unlock();
    }
}
