use crate::models::TagId;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrackerState {
    #[default]
    Idle,
    Tracking {
        tag: TagId,
        /// Consecutive polls that found no tag.
        none_streak: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    Arrived(TagId),
    Departed(TagId),
}

/// One debounce transition.
///
/// A read of a different tag is an arrival. `departure_threshold` empty polls
/// in a row while tracking is a departure. Re-reading the tracked tag only
/// clears the empty streak.
pub fn step(
    state: TrackerState,
    read: Option<&TagId>,
    departure_threshold: u32,
) -> (TrackerState, Option<TagEvent>) {
    match (state, read) {
        (TrackerState::Idle, None) => (TrackerState::Idle, None),
        (TrackerState::Tracking { tag, .. }, Some(seen)) if tag == *seen => (
            TrackerState::Tracking {
                tag,
                none_streak: 0,
            },
            None,
        ),
        (_, Some(seen)) => (
            TrackerState::Tracking {
                tag: seen.clone(),
                none_streak: 0,
            },
            Some(TagEvent::Arrived(seen.clone())),
        ),
        (TrackerState::Tracking { tag, none_streak }, None) => {
            let none_streak = none_streak.saturating_add(1);
            if none_streak >= departure_threshold {
                (TrackerState::Idle, Some(TagEvent::Departed(tag)))
            } else {
                (TrackerState::Tracking { tag, none_streak }, None)
            }
        }
    }
}

/// Turns raw per-tick reads into arrival and departure events.
#[derive(Debug, Clone)]
pub struct DebounceTracker {
    state: TrackerState,
    departure_threshold: u32,
}

impl DebounceTracker {
    pub fn new(departure_threshold: u32) -> Self {
        Self {
            state: TrackerState::Idle,
            departure_threshold: departure_threshold.max(1),
        }
    }

    pub fn observe(&mut self, read: Option<&TagId>) -> Option<TagEvent> {
        let (next, event) = step(
            std::mem::take(&mut self.state),
            read,
            self.departure_threshold,
        );
        self.state = next;
        event
    }

    /// Forgets the tracked tag without emitting a departure.
    pub fn reset(&mut self) {
        self.state = TrackerState::Idle;
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }
}
