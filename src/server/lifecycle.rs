//! Server lifecycle state and the cross-thread control surface.
//!
//! Only the loop thread transitions [`State`]; other threads record an
//! intent in [`Control`] and signal the wakeup so the loop observes it at
//! the top of its next iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ServerConfig;
use crate::router::Router;
use crate::server::probes::SharedProbeFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Draining,
    Stopping,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub state: State,
    pub drain_deadline: Option<Instant>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            drain_deadline: None,
        }
    }

    pub(crate) fn enter_running(&mut self, probes: &SharedProbeFlags) {
        self.state = State::Running;
        self.drain_deadline = None;
        probes.started.store(true, Ordering::Relaxed);
        probes.ready.store(true, Ordering::Relaxed);
    }

    pub(crate) fn enter_draining(
        &mut self,
        deadline: Option<Instant>,
        probes: &SharedProbeFlags,
    ) {
        probes.ready.store(false, Ordering::Relaxed);
        if self.state == State::Running {
            self.state = State::Draining;
            self.drain_deadline = deadline;
        } else if self.state == State::Draining {
            self.shrink_deadline(deadline);
        }
    }

    /// Adopt `deadline` only when it is earlier than the current one.
    pub(crate) fn shrink_deadline(&mut self, deadline: Option<Instant>) {
        if let Some(new_deadline) = deadline {
            match self.drain_deadline {
                Some(current) if current <= new_deadline => {}
                _ => self.drain_deadline = Some(new_deadline),
            }
        }
    }

    pub(crate) fn enter_stopping(&mut self, probes: &SharedProbeFlags) {
        self.state = State::Stopping;
        self.drain_deadline = None;
        probes.started.store(false, Ordering::Relaxed);
        probes.ready.store(false, Ordering::Relaxed);
    }

    pub(crate) fn accepting(&self) -> bool {
        self.state == State::Running
    }
}

pub(crate) type ConfigMutator = Box<dyn FnOnce(&mut ServerConfig) + Send>;
pub(crate) type RouterMutator = Box<dyn FnOnce(&mut Router) + Send>;

/// Mutator queues consumed at the top of each loop iteration.
#[derive(Default)]
pub(crate) struct PendingUpdates {
    pub config: Mutex<Vec<ConfigMutator>>,
    pub router: Mutex<Vec<RouterMutator>>,
    pub has_config: AtomicBool,
    pub has_router: AtomicBool,
}

/// Drain intent posted by another thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DrainIntent {
    Begin(Option<Instant>),
    Shrink(Instant),
}

/// Shared control block between the loop thread and lifecycle callers.
#[derive(Default)]
pub(crate) struct ControlShared {
    pub stop_requested: AtomicBool,
    pub drain: Mutex<Vec<DrainIntent>>,
    pub updates: PendingUpdates,
}

/// Cross-thread handle: wakes the reactor after recording an intent.
#[derive(Clone)]
pub struct Control {
    pub(crate) shared: Arc<ControlShared>,
    pub(crate) waker: Arc<mio::Waker>,
}

impl Control {
    /// Ask the loop to stop: all connections close and `run` returns.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Stop accepting, let in-flight connections finish. An elapsed
    /// `deadline` force-closes stragglers.
    pub fn begin_drain(&self, deadline: Option<Instant>) {
        if let Ok(mut drain) = self.shared.drain.lock() {
            drain.push(DrainIntent::Begin(deadline));
        }
        let _ = self.waker.wake();
    }

    /// Shorten an existing drain deadline; never extends it.
    pub fn shrink_deadline(&self, deadline: Instant) {
        if let Ok(mut drain) = self.shared.drain.lock() {
            drain.push(DrainIntent::Shrink(deadline));
        }
        let _ = self.waker.wake();
    }

    /// Run `mutator` against the live config on the loop thread.
    pub fn post_config_update(&self, mutator: impl FnOnce(&mut ServerConfig) + Send + 'static) {
        if let Ok(mut queue) = self.shared.updates.config.lock() {
            queue.push(Box::new(mutator));
        }
        self.shared
            .updates
            .has_config
            .store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Run `mutator` against the live router on the loop thread.
    pub fn post_router_update(&self, mutator: impl FnOnce(&mut Router) + Send + 'static) {
        if let Ok(mut queue) = self.shared.updates.router.lock() {
            queue.push(Box::new(mutator));
        }
        self.shared
            .updates
            .has_router
            .store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Control")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::probes::ProbeFlags;
    use std::time::Duration;

    #[test]
    fn running_sets_probe_flags() {
        let probes = Arc::new(ProbeFlags::default());
        let mut lifecycle = Lifecycle::new();
        lifecycle.enter_running(&probes);
        assert_eq!(lifecycle.state, State::Running);
        assert!(probes.started.load(Ordering::Relaxed));
        assert!(probes.ready.load(Ordering::Relaxed));
    }

    #[test]
    fn draining_clears_ready_keeps_started() {
        let probes = Arc::new(ProbeFlags::default());
        let mut lifecycle = Lifecycle::new();
        lifecycle.enter_running(&probes);
        lifecycle.enter_draining(None, &probes);
        assert_eq!(lifecycle.state, State::Draining);
        assert!(probes.started.load(Ordering::Relaxed));
        assert!(!probes.ready.load(Ordering::Relaxed));
    }

    #[test]
    fn shrink_only_moves_deadline_earlier() {
        let probes = Arc::new(ProbeFlags::default());
        let mut lifecycle = Lifecycle::new();
        lifecycle.enter_running(&probes);

        let now = Instant::now();
        let far = now + Duration::from_secs(60);
        let near = now + Duration::from_secs(5);

        lifecycle.enter_draining(Some(far), &probes);
        lifecycle.shrink_deadline(Some(near));
        assert_eq!(lifecycle.drain_deadline, Some(near));

        // attempting to extend is ignored
        lifecycle.shrink_deadline(Some(far));
        assert_eq!(lifecycle.drain_deadline, Some(near));
    }

    #[test]
    fn draining_twice_shrinks() {
        let probes = Arc::new(ProbeFlags::default());
        let mut lifecycle = Lifecycle::new();
        lifecycle.enter_running(&probes);

        let now = Instant::now();
        lifecycle.enter_draining(Some(now + Duration::from_secs(60)), &probes);
        lifecycle.enter_draining(Some(now + Duration::from_secs(1)), &probes);
        assert_eq!(lifecycle.drain_deadline, Some(now + Duration::from_secs(1)));
    }
}
