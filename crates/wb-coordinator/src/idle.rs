//! Idle signalling
//!
//! After a configurable number of consecutive empty batches the worker
//! raises its idle callback exactly once; the first non-empty batch after
//! idle raises the started callback. These transitions are the rendezvous
//! tests use to know the system has caught up.

type Callback = Box<dyn Fn() + Send + Sync>;

/// Tracks empty-batch streaks and raises edge-triggered callbacks.
pub struct IdleTracker {
    threshold: u32,
    consecutive_empty: u32,
    idle: bool,
    on_idle: Option<Callback>,
    on_started: Option<Callback>,
}

impl IdleTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_empty: 0,
            idle: false,
            on_idle: None,
            on_started: None,
        }
    }

    pub fn on_idle(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_idle = Some(Box::new(callback));
    }

    pub fn on_started(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_started = Some(Box::new(callback));
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Feed one batch observation.
    pub fn observe(&mut self, empty: bool) {
        if empty {
            self.consecutive_empty += 1;
            if !self.idle && self.consecutive_empty >= self.threshold {
                self.idle = true;
                if let Some(callback) = &self.on_idle {
                    callback();
                }
            }
        } else {
            self.consecutive_empty = 0;
            if self.idle {
                self.idle = false;
                if let Some(callback) = &self.on_started {
                    callback();
                }
            }
        }
    }
}
