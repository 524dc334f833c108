use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::models::PlaybackState;

struct StateSlot {
    state: PlaybackState,
    // Bumped by every engine operation. A playback task may only write the
    // state while the generation it was started with is still current.
    generation: u64,
}

/// The playback-state guard shared by the engine and its tasks.
///
/// Only in-memory field updates happen under the lock.
pub(crate) struct SharedState {
    slot: Mutex<StateSlot>,
    live_tasks: AtomicUsize,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(StateSlot {
                state: PlaybackState::Idle,
                generation: 0,
            }),
            live_tasks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> PlaybackState {
        self.lock().state.clone()
    }

    /// Sets a new state owned by the engine and returns its generation.
    pub(crate) fn replace(&self, state: PlaybackState) -> u64 {
        let mut slot = self.lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = state;
        slot.generation
    }

    /// Invalidates whatever task currently owns the state without changing
    /// what is displayed.
    pub(crate) fn supersede(&self) {
        let mut slot = self.lock();
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Task-side update. Returns false if a newer operation has taken over.
    pub(crate) fn settle(&self, generation: u64, state: PlaybackState) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        slot.state = state;
        true
    }

    pub(crate) fn task_started(&self) {
        self.live_tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn task_finished(&self) {
        self.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, StateSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
