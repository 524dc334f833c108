use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::watch;

/// Switch that lets the menu take the reader away from the session loop.
///
/// Suspensions nest: the loop runs again once every [`SuspendGuard`] has been
/// dropped. `suspend` waits for a tick that is already running, so once it
/// returns the loop will not poll or trigger playback until resumed.
///
/// The holder count lives in a `watch` channel so the loop can sleep until
/// it drops back to zero instead of ticking while suspended.
#[derive(Clone)]
pub struct SessionGate {
    suspensions: Arc<watch::Sender<u32>>,
    // Held for the length of one tick.
    tick: Arc<Mutex<()>>,
}

#[must_use = "the session loop resumes when the guard is dropped"]
pub struct SuspendGuard {
    gate: SessionGate,
}

impl Default for SessionGate {
    fn default() -> Self {
        let (suspensions, _) = watch::channel(0);
        Self {
            suspensions: Arc::new(suspensions),
            tick: Arc::new(Mutex::new(())),
        }
    }
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until an in-flight tick finishes. Call it from a blocking
    /// context, never from inside a runtime worker.
    pub fn suspend(&self) -> SuspendGuard {
        self.suspensions.send_modify(|count| *count += 1);
        debug!(
            "Session loop suspended ({} holders)",
            *self.suspensions.borrow()
        );
        drop(self.lock_tick());
        SuspendGuard { gate: self.clone() }
    }

    pub fn is_enabled(&self) -> bool {
        *self.suspensions.borrow() == 0
    }

    /// Receiver the loop waits on while suspended.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u32> {
        self.suspensions.subscribe()
    }

    /// Runs `tick` while holding the gate, or returns `None` when suspended.
    pub(crate) fn run_if_enabled<T>(&self, tick: impl FnOnce() -> T) -> Option<T> {
        let _running = self.lock_tick();
        if !self.is_enabled() {
            return None;
        }
        Some(tick())
    }

    fn lock_tick(&self) -> MutexGuard<'_, ()> {
        match self.tick.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.gate
            .suspensions
            .send_modify(|count| *count = count.saturating_sub(1));
        debug!(
            "Session loop suspension released ({} holders)",
            *self.gate.suspensions.borrow()
        );
    }
}
