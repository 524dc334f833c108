use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::ReaderDevice;
use crate::error::{Error, Result};
use crate::models::TagId;

const EOF_RETRY: Duration = Duration::from_millis(50);

/// Reader that emits one tag id per line while a tag is in range, as serial
/// 125 kHz modules and USB readers in serial mode do.
///
/// A pump thread turns the character device into a channel of lines. A tag
/// counts as present while its id was last seen less than `presence_window`
/// ago. Line settings (baud rate etc.) are expected to be configured on the
/// device beforehand, e.g. with `stty`. End of file is waited out, so a
/// FIFO or plain file fed by another process works too.
///
/// The pump owns the open file for as long as reads succeed. A blocked
/// `read` cannot be interrupted, so a reset only reopens the device once the
/// previous pump has exited on a read error or a closed stream. Until then
/// reinit reattaches to the running pump and at most one pump exists per
/// reader.
pub struct LineDeviceReader {
    path: PathBuf,
    presence_window: Duration,
    pump: Option<Pump>,
    attached: bool,
    last_seen: Option<(TagId, Instant)>,
    live_pumps: Arc<AtomicUsize>,
}

struct Pump {
    lines: Receiver<io::Result<String>>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Throws away lines queued while nobody was polling.
    fn drain(&self) -> usize {
        self.lines.try_iter().filter(|line| line.is_ok()).count()
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            // Only an exited pump is joined; a pump parked in read() notices
            // the cleared flag after its next line.
            if handle.is_finished() && handle.join().is_err() {
                warn!("Reader pump panicked");
            }
        }
    }
}

struct PumpCount(Arc<AtomicUsize>);

impl Drop for PumpCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LineDeviceReader {
    /// Opens `path`. A device that cannot be opened yet is not an error here;
    /// polls fail until a reset succeeds.
    pub fn new(path: impl Into<PathBuf>, presence_window: Duration) -> Self {
        let mut reader = Self {
            path: path.into(),
            presence_window,
            pump: None,
            attached: false,
            last_seen: None,
            live_pumps: Arc::new(AtomicUsize::new(0)),
        };
        if let Err(err) = reader.reinit() {
            warn!("Reader not available yet: {err}");
        }
        reader
    }

    fn spawn_pump(&self, file: File) -> Result<Pump> {
        let (tx, rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let still_alive = Arc::clone(&alive);
        let name = self.path.display().to_string();
        self.live_pumps.fetch_add(1, Ordering::SeqCst);
        let count = PumpCount(Arc::clone(&self.live_pumps));
        let spawned = thread::Builder::new()
            .name("reader-pump".into())
            .spawn(move || {
                let _count = count;
                let mut lines = BufReader::new(file);
                while still_alive.load(Ordering::SeqCst) {
                    let mut line = String::new();
                    let item = match lines.read_line(&mut line) {
                        Ok(0) => {
                            thread::sleep(EOF_RETRY);
                            continue;
                        }
                        Ok(_) => Ok(line),
                        Err(err) => Err(err),
                    };
                    let failed = item.is_err();
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                }
                debug!("Reader pump for {name} exited");
            });
        let handle = spawned?;
        Ok(Pump {
            lines: rx,
            alive,
            handle: Some(handle),
        })
    }

    /// Pump threads currently alive for this reader.
    #[cfg(test)]
    fn live_pumps(&self) -> usize {
        self.live_pumps.load(Ordering::SeqCst)
    }

    fn absorb(&mut self, line: &str) -> Option<TagId> {
        let tag = TagId::parse(line)?;
        self.last_seen = Some((tag.clone(), Instant::now()));
        Some(tag)
    }

    fn stream(&self) -> Result<&Receiver<io::Result<String>>> {
        self.pump
            .as_ref()
            .filter(|_| self.attached)
            .map(|pump| &pump.lines)
            .ok_or_else(|| Error::HardwareFault(format!("{} is not open", self.path.display())))
    }
}

impl ReaderDevice for LineDeviceReader {
    fn poll_non_blocking(&mut self) -> Result<Option<TagId>> {
        loop {
            let next = self.stream()?.try_recv();
            match next {
                Ok(Ok(line)) => {
                    self.absorb(&line);
                }
                Ok(Err(err)) => {
                    self.pump = None;
                    return Err(err.into());
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.pump = None;
                    return Err(Error::HardwareFault(format!(
                        "{} stream closed",
                        self.path.display()
                    )));
                }
            }
        }

        Ok(self
            .last_seen
            .as_ref()
            .filter(|(_, at)| at.elapsed() <= self.presence_window)
            .map(|(tag, _)| tag.clone()))
    }

    fn blocking_read(&mut self) -> Result<TagId> {
        loop {
            let next = self.stream()?.recv();
            match next {
                Ok(Ok(line)) => {
                    if let Some(tag) = self.absorb(&line) {
                        return Ok(tag);
                    }
                }
                Ok(Err(err)) => {
                    self.pump = None;
                    return Err(err.into());
                }
                Err(_) => {
                    self.pump = None;
                    return Err(Error::HardwareFault(format!(
                        "{} stream closed",
                        self.path.display()
                    )));
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.attached = false;
        self.last_seen = None;
        if !self.pump.as_ref().is_some_and(Pump::is_running) {
            self.pump = None;
        }
    }

    fn reinit(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.as_ref().filter(|pump| pump.is_running()) {
            let stale = pump.drain();
            self.attached = true;
            info!(
                "Reader stream at {} still open; reattached (dropped {stale} stale lines)",
                self.path.display()
            );
            return Ok(());
        }

        self.pump = None;
        let file = File::open(&self.path).map_err(|err| {
            error!("Failed to open reader {}: {err}", self.path.display());
            Error::HardwareFault(format!("failed to open {}: {err}", self.path.display()))
        })?;
        self.pump = Some(self.spawn_pump(file)?);
        self.attached = true;
        info!("Reader opened at {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn wait_for<F: FnMut() -> bool>(mut check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn lines_become_tags_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tty");
        fs::write(&path, "631430949643\r\n\n").unwrap();

        let mut reader = LineDeviceReader::new(&path, Duration::from_millis(100));
        let mut seen = None;
        assert!(wait_for(|| {
            seen = reader.poll_non_blocking().unwrap();
            seen.is_some()
        }));
        assert_eq!(seen, Some(TagId::parse("631430949643").unwrap()));

        // No further lines arrive, so the tag leaves range after the window.
        assert!(wait_for(|| reader.poll_non_blocking().unwrap().is_none()));
        reader.teardown();
        assert!(reader.poll_non_blocking().is_err());
    }

    #[test]
    fn missing_device_fails_until_reinit_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttyUSB0");

        let mut reader = LineDeviceReader::new(&path, Duration::from_millis(100));
        assert!(reader.poll_non_blocking().is_err());
        assert!(reader.reinit().is_err());

        fs::write(&path, "0001\n").unwrap();
        reader.reset(Duration::ZERO).unwrap();
        assert_eq!(reader.blocking_read().unwrap(), TagId::parse("0001").unwrap());
    }

    #[test]
    fn resets_keep_one_pump_and_lose_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tty");
        fs::write(&path, "0001\n").unwrap();

        let mut reader = LineDeviceReader::new(&path, Duration::from_millis(500));
        assert!(wait_for(|| reader.poll_non_blocking().unwrap().is_some()));

        for _ in 0..5 {
            reader.reset(Duration::ZERO).unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(reader.live_pumps(), 1);
        // The earlier line is not replayed from a fresh open.
        assert_eq!(reader.poll_non_blocking().unwrap(), None);

        let mut device = fs::OpenOptions::new().append(true).open(&path).unwrap();
        device.write_all(b"0002\n").unwrap();
        let mut seen = None;
        assert!(wait_for(|| {
            seen = reader.poll_non_blocking().unwrap();
            seen.is_some()
        }));
        assert_eq!(seen, Some(TagId::parse("0002").unwrap()));
        assert_eq!(reader.live_pumps(), 1);
    }

    #[test]
    fn closed_stream_is_reopened_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tty");
        fs::write(&path, "").unwrap();

        let mut reader = LineDeviceReader::new(&path, Duration::from_millis(500));
        // Dropping the pump stands in for a device that went away.
        reader.pump = None;
        assert!(reader.poll_non_blocking().is_err());

        fs::write(&path, "0003\n").unwrap();
        reader.reset(Duration::ZERO).unwrap();
        assert_eq!(reader.blocking_read().unwrap(), TagId::parse("0003").unwrap());
        assert!(wait_for(|| reader.live_pumps() == 1));
    }
}
