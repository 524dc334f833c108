use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::ReaderDevice;
use crate::error::{Error, Result};
use crate::models::TagId;

/// What the simulated device saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Read(TagId),
    Empty,
    Fault,
    Teardown,
    Reinit,
}

struct SimReaderState {
    present: Option<TagId>,
    pending_faults: u32,
    fail_reinit: bool,
    initialized: bool,
    reinit_attempts: u32,
    events: Vec<DeviceEvent>,
}

/// Reader with no hardware behind it. The paired
/// [`SimulatedReaderHandle`] places and removes tags and injects faults.
pub struct SimulatedReader {
    state: Arc<Mutex<SimReaderState>>,
}

#[derive(Clone)]
pub struct SimulatedReaderHandle {
    state: Arc<Mutex<SimReaderState>>,
}

fn lock(state: &Mutex<SimReaderState>) -> MutexGuard<'_, SimReaderState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SimulatedReader {
    pub fn new() -> (Self, SimulatedReaderHandle) {
        let state = Arc::new(Mutex::new(SimReaderState {
            present: None,
            pending_faults: 0,
            fail_reinit: false,
            initialized: true,
            reinit_attempts: 0,
            events: Vec::new(),
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimulatedReaderHandle { state },
        )
    }
}

impl SimulatedReaderHandle {
    /// Puts the tag with raw id `id` in range. A blank id reads as an
    /// empty reader.
    pub fn present(&self, id: &str) {
        lock(&self.state).present = TagId::parse(id);
    }

    pub fn remove(&self) {
        lock(&self.state).present = None;
    }

    /// The next `count` polls fail with an I/O error.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).pending_faults += count;
    }

    pub fn fail_reinit(&self, fail: bool) {
        lock(&self.state).fail_reinit = fail;
    }

    pub fn reinit_count(&self) -> u32 {
        lock(&self.state).reinit_attempts
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        lock(&self.state).events.clone()
    }
}

impl ReaderDevice for SimulatedReader {
    fn poll_non_blocking(&mut self) -> Result<Option<TagId>> {
        let mut state = lock(&self.state);
        if !state.initialized {
            state.events.push(DeviceEvent::Fault);
            return Err(Error::HardwareFault("reader not initialised".into()));
        }
        if state.pending_faults > 0 {
            state.pending_faults -= 1;
            state.events.push(DeviceEvent::Fault);
            return Err(Error::HardwareFault("simulated SPI error".into()));
        }
        let present = state.present.clone();
        state.events.push(match &present {
            Some(tag) => DeviceEvent::Read(tag.clone()),
            None => DeviceEvent::Empty,
        });
        Ok(present)
    }

    fn blocking_read(&mut self) -> Result<TagId> {
        loop {
            if let Some(tag) = self.poll_non_blocking()? {
                return Ok(tag);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn teardown(&mut self) {
        let mut state = lock(&self.state);
        state.initialized = false;
        state.events.push(DeviceEvent::Teardown);
    }

    fn reinit(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.reinit_attempts += 1;
        state.events.push(DeviceEvent::Reinit);
        if state.fail_reinit {
            return Err(Error::HardwareFault("simulated reinit failure".into()));
        }
        state.initialized = true;
        Ok(())
    }
}
