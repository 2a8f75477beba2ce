//! Deadlock avoiding modeset locks
//!
//! Every crtc and plane carries its own [`ModesetLock`], connectors share the
//! device-wide connection lock. All locks taken on behalf of one transaction are
//! acquired through a single [`AcquireContext`].
//!
//! The locks implement the *wait-die* flavour of wound/wait mutexes: every context
//! gets a stamp on creation, older contexts wait for younger lock holders, while a
//! younger context running into an older holder fails immediately with
//! [`Error::Deadlock`]. The caller then has to drop everything it built up, call
//! [`AcquireContext::backoff`] and start over. Backing off keeps the stamp of the
//! context, so a retried transaction only gets older and eventually wins.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};

use tracing::{trace, warn};

use crate::error::Error;

static NEXT_STAMP: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct LockInner {
    owner: Mutex<Option<u64>>,
    released: Condvar,
}

impl LockInner {
    fn release(&self) {
        *self.owner.lock().unwrap() = None;
        self.released.notify_all();
    }
}

/// A lock protecting the state of a single mode object
#[derive(Debug, Default, Clone)]
pub struct ModesetLock {
    inner: Arc<LockInner>,
}

impl ModesetLock {
    /// Creates a new unlocked lock
    pub fn new() -> Self {
        ModesetLock::default()
    }

    /// Acquires the lock with the given context, see [`AcquireContext::lock`]
    pub fn lock(&self, ctx: &AcquireContext) -> Result<(), Error> {
        ctx.lock(self)
    }

    /// Returns true, if any context currently holds this lock
    pub fn is_locked(&self) -> bool {
        self.inner.owner.lock().unwrap().is_some()
    }

    /// Returns true, if the given context currently holds this lock
    pub fn is_locked_by(&self, ctx: &AcquireContext) -> bool {
        *self.inner.owner.lock().unwrap() == Some(ctx.stamp)
    }
}

#[derive(Debug, Default)]
struct ContextInner {
    locked: Vec<Arc<LockInner>>,
    contended: Option<Arc<LockInner>>,
}

/// Acquisition context tying together all locks of one transaction
#[derive(Debug)]
pub struct AcquireContext {
    stamp: u64,
    inner: Mutex<ContextInner>,
}

impl Default for AcquireContext {
    fn default() -> Self {
        AcquireContext::new()
    }
}

impl AcquireContext {
    /// Creates a new context, younger than every context created before
    pub fn new() -> Self {
        AcquireContext {
            stamp: NEXT_STAMP.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(ContextInner::default()),
        }
    }

    /// Acquires `lock` on behalf of this context.
    ///
    /// Locking a lock already held by this context succeeds without effect.
    /// If the lock is held by an older context, this fails with [`Error::Deadlock`]
    /// and the lock is remembered as contended for the next [`AcquireContext::backoff`].
    /// If it is held by a younger context, this blocks until it gets released.
    pub fn lock(&self, lock: &ModesetLock) -> Result<(), Error> {
        if self.inner.lock().unwrap().contended.is_some() {
            warn!(stamp = self.stamp, "Acquiring locks without backing off a previous deadlock");
        }

        let mut owner = lock.inner.owner.lock().unwrap();
        loop {
            match *owner {
                None => {
                    *owner = Some(self.stamp);
                    drop(owner);
                    trace!(stamp = self.stamp, "Acquired modeset lock");
                    self.inner.lock().unwrap().locked.push(lock.inner.clone());
                    return Ok(());
                }
                Some(holder) if holder == self.stamp => return Ok(()),
                Some(holder) if holder < self.stamp => {
                    drop(owner);
                    trace!(stamp = self.stamp, holder, "Modeset lock held by older context");
                    self.inner.lock().unwrap().contended = Some(lock.inner.clone());
                    return Err(Error::Deadlock);
                }
                Some(_) => {
                    owner = lock.inner.released.wait(owner).unwrap();
                }
            }
        }
    }

    /// Drops all held locks and waits for the lock that caused the last deadlock.
    ///
    /// Once this returns, the contended lock is held by this context, everything
    /// else has to be re-acquired.
    pub fn backoff(&self) {
        let contended = {
            let mut inner = self.inner.lock().unwrap();
            for lock in inner.locked.drain(..) {
                lock.release();
            }
            inner.contended.take()
        };

        if let Some(lock) = contended {
            trace!(stamp = self.stamp, "Waiting for contended modeset lock");
            let mut owner = lock.owner.lock().unwrap();
            while owner.is_some() {
                owner = lock.released.wait(owner).unwrap();
            }
            *owner = Some(self.stamp);
            drop(owner);
            self.inner.lock().unwrap().locked.push(lock);
        }
    }

    /// Releases every lock held by this context
    pub fn drop_locks(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.contended.take().is_some() {
            warn!(stamp = self.stamp, "Dropping locks with unresolved contention");
        }
        for lock in inner.locked.drain(..) {
            lock.release();
        }
    }

    /// Number of locks currently held by this context
    pub fn held_locks(&self) -> usize {
        self.inner.lock().unwrap().locked.len()
    }
}

impl Drop for AcquireContext {
    fn drop(&mut self) {
        self.drop_locks();
    }
}
