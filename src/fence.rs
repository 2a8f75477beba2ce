//! Explicit synchronization primitives
//!
//! A [`Fence`] is a one-shot completion flag living on a timeline ([`FenceContext`]).
//! Every crtc owns a timeline, fences created on it get signaled once the
//! frame they belong to got scanned out. Fences are exchanged with clients
//! wrapped into a [`SyncFile`], referenced through a file descriptor.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::trace;

use crate::error::Error;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// A fence timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceContext(u64);

impl FenceContext {
    /// Allocates a new, globally unique timeline
    pub fn alloc() -> FenceContext {
        FenceContext(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id of the timeline
    pub fn id(&self) -> u64 {
        self.0
    }
}

type Callback = Box<dyn FnOnce(&Fence) + Send>;

#[derive(Default)]
struct FenceState {
    signaled: bool,
    error: Option<Error>,
    callbacks: Vec<Callback>,
}

/// A one-shot completion signal
pub struct Fence {
    context: FenceContext,
    seqno: u64,
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl Fence {
    /// Creates an unsignaled fence
    pub fn new(context: FenceContext, seqno: u64) -> Fence {
        Fence {
            context,
            seqno,
            state: Mutex::new(FenceState::default()),
            cond: Condvar::new(),
        }
    }

    /// Creates an already signaled fence
    pub fn signaled() -> Fence {
        let fence = Fence::new(FenceContext::alloc(), 0);
        fence.state.lock().unwrap().signaled = true;
        fence
    }

    /// Timeline of this fence
    pub fn context(&self) -> FenceContext {
        self.context
    }

    /// Position of this fence on its timeline
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Returns true, if the fence got signaled
    pub fn is_signaled(&self) -> bool {
        self.state.lock().unwrap().signaled
    }

    /// Error the fence got signaled with, if any
    pub fn error(&self) -> Option<Error> {
        self.state.lock().unwrap().error.clone()
    }

    /// Signals the fence, waking all waiters and running the callbacks.
    ///
    /// Returns false, if the fence was already signaled.
    pub fn signal(&self) -> bool {
        self.signal_inner(None)
    }

    /// Signals the fence with an error
    pub fn signal_with_error(&self, error: Error) -> bool {
        self.signal_inner(Some(error))
    }

    fn signal_inner(&self, error: Option<Error>) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.signaled {
                return false;
            }
            state.signaled = true;
            state.error = error;
            std::mem::take(&mut state.callbacks)
        };
        self.cond.notify_all();
        trace!(context = self.context.0, seqno = self.seqno, "Fence signaled");

        for callback in callbacks {
            callback(self);
        }
        true
    }

    /// Registers a callback to be run once the fence is signaled.
    ///
    /// If the fence is already signaled, the callback is handed back.
    pub fn add_callback<F>(&self, callback: F) -> Result<(), F>
    where
        F: FnOnce(&Fence) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        if state.signaled {
            return Err(callback);
        }
        state.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Blocks until the fence is signaled or `timeout` elapsed.
    ///
    /// Returns true, if the fence got signaled.
    #[profiling::function]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
        true
    }

    /// Blocks until the fence is signaled
    #[profiling::function]
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.signaled {
            state = self.cond.wait(state).unwrap();
        }
    }
}

/// A fence exported to a client through a file descriptor
#[derive(Debug, Clone)]
pub struct SyncFile {
    fence: Arc<Fence>,
}

impl SyncFile {
    /// Wraps a fence
    pub fn new(fence: Arc<Fence>) -> SyncFile {
        SyncFile { fence }
    }

    /// The wrapped fence
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Returns true, if the wrapped fence is signaled
    pub fn is_signaled(&self) -> bool {
        self.fence.is_signaled()
    }
}
