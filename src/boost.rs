//! Frequency boost notifications
//!
//! Every non-test atomic request kicks the registered [`BoostNotifier`]s,
//! giving frequency governors a chance to ramp up before the next frame is due.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use tracing::trace;

/// Receiver of boost kicks
pub trait BoostNotifier: fmt::Debug + Send + Sync {
    /// Called once per atomic request that may change the display configuration
    fn kick(&self);
}

#[derive(Debug, Default)]
struct Window {
    input: Option<Instant>,
    max: Option<Instant>,
}

/// A notifier keeping a boost window open for a fixed duration after each kick
#[derive(Debug)]
pub struct InputBoost {
    duration: Duration,
    window: Mutex<Window>,
    kicks: AtomicU64,
}

impl InputBoost {
    /// Creates a notifier boosting for `duration` after every kick
    pub fn new(duration: Duration) -> Self {
        InputBoost {
            duration,
            window: Mutex::new(Window::default()),
            kicks: AtomicU64::new(0),
        }
    }

    /// Opens a maximum boost window, unless a longer one is already in effect
    pub fn kick_max(&self, duration: Duration) {
        let expires = Instant::now() + duration;
        let mut window = self.window.lock().unwrap();
        if window.max.map_or(true, |current| current < expires) {
            window.max = Some(expires);
        }
    }

    /// Returns true, if an input boost window is open
    pub fn is_boosted(&self) -> bool {
        let now = Instant::now();
        let window = self.window.lock().unwrap();
        window.input.map_or(false, |expires| now < expires) || self.is_max_boosted_locked(&window, now)
    }

    /// Returns true, if a maximum boost window is open
    pub fn is_max_boosted(&self) -> bool {
        let window = self.window.lock().unwrap();
        self.is_max_boosted_locked(&window, Instant::now())
    }

    fn is_max_boosted_locked(&self, window: &Window, now: Instant) -> bool {
        window.max.map_or(false, |expires| now < expires)
    }

    /// Number of kicks received so far
    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }
}

impl BoostNotifier for InputBoost {
    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        self.window.lock().unwrap().input = Some(Instant::now() + self.duration);
        trace!(duration = ?self.duration, "Input boost kicked");
    }
}
