use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{HealthSnapshot, ReaderConfig, ReaderDevice, ReaderHealth};
use crate::models::TagId;

// Set to false to silence per-poll reader logging
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

struct ReaderSlot {
    device: Box<dyn ReaderDevice>,
    health: ReaderHealth,
}

/// The one place the reader is touched.
///
/// Every read and every reset happens under the same lock, so a reset can
/// never interleave with an in-flight read. Faults are absorbed here: callers
/// only ever see "tag" or "no tag".
pub struct TagSource {
    reader: Mutex<ReaderSlot>,
    config: ReaderConfig,
}

impl TagSource {
    pub fn new(device: Box<dyn ReaderDevice>, config: ReaderConfig) -> Self {
        Self {
            reader: Mutex::new(ReaderSlot {
                device,
                health: ReaderHealth::new(Instant::now()),
            }),
            config,
        }
    }

    /// Tag currently on the reader, if any.
    ///
    /// Runs a proactive reset first when the reader has gone quiet for longer
    /// than `reinit_interval`, and a reactive reset once the error streak
    /// reaches `max_consecutive_errors`.
    pub fn poll_non_blocking(&self) -> Option<TagId> {
        let mut slot = self.lock();

        if slot
            .health
            .reinit_due(Instant::now(), self.config.reinit_interval)
        {
            log_info!(
                "No successful read for {:?}; reinitializing reader",
                self.config.reinit_interval
            );
            self.reset_locked(&mut slot);
        }

        match slot.device.poll_non_blocking() {
            Ok(Some(tag)) => {
                slot.health.record_success(Instant::now());
                Some(tag)
            }
            Ok(None) => {
                slot.health.record_empty();
                None
            }
            Err(err) => {
                let streak = slot.health.record_error();
                log_warn!(
                    "Reader error ({}/{}): {err}",
                    streak,
                    self.config.max_consecutive_errors
                );
                if streak >= self.config.max_consecutive_errors {
                    self.reset_locked(&mut slot);
                }
                None
            }
        }
    }

    /// Polls every `poll_interval` until a tag shows up, `timeout` elapses, or
    /// `cancel_token` is cancelled. Cancellation takes effect immediately,
    /// even in the middle of a wait. Polls run on the blocking pool.
    pub async fn read_with_timeout(
        self: Arc<Self>,
        timeout: Duration,
        poll_interval: Duration,
        cancel_token: &CancellationToken,
    ) -> Option<TagId> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if cancel_token.is_cancelled() {
                log_debug!("Tag read cancelled");
                return None;
            }

            let source = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || source.poll_non_blocking()).await {
                Ok(Some(tag)) => return Some(tag),
                Ok(None) => {}
                Err(err) => {
                    log_error!("Reader poll worker join failed: {err}");
                    return None;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                log_debug!("Tag read timed out after {:?}", timeout);
                return None;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval.min(deadline - now)) => {}
                _ = cancel_token.cancelled() => {
                    log_debug!("Tag read cancelled");
                    return None;
                }
            }
        }
    }

    /// Blocks on the device until it produces a tag. Holds the reader lock
    /// for the whole wait, so only use it when nothing else polls.
    pub fn read_blocking(&self) -> Option<TagId> {
        let mut slot = self.lock();
        match slot.device.blocking_read() {
            Ok(tag) => {
                slot.health.record_success(Instant::now());
                Some(tag)
            }
            Err(err) => {
                slot.health.record_error();
                log_error!("Blocking read failed: {err}");
                None
            }
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        self.lock().health.snapshot(Instant::now())
    }

    fn reset_locked(&self, slot: &mut ReaderSlot) {
        log_info!("Resetting reader (resets so far: {})", slot.health.resets());
        if let Err(err) = slot.device.reset(self.config.reset_delay) {
            log_error!("Reader reset failed: {err}");
        }
        slot.health.record_reset(Instant::now());
    }

    fn lock(&self) -> MutexGuard<'_, ReaderSlot> {
        match self.reader.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{DeviceEvent, SimulatedReader};
    use std::thread;

    fn config(max_errors: u32) -> ReaderConfig {
        ReaderConfig {
            max_consecutive_errors: max_errors,
            reinit_interval: Duration::from_secs(3600),
            reset_delay: Duration::ZERO,
        }
    }

    #[test]
    fn present_tag_is_returned() {
        let (reader, handle) = SimulatedReader::new();
        let source = TagSource::new(Box::new(reader), config(3));

        assert_eq!(source.poll_non_blocking(), None);
        handle.present("0001");
        assert_eq!(source.poll_non_blocking(), Some(TagId::parse("0001").unwrap()));
        handle.remove();
        assert_eq!(source.poll_non_blocking(), None);
    }

    #[test]
    fn error_streak_triggers_exactly_one_reset_before_next_success() {
        let (reader, handle) = SimulatedReader::new();
        let source = TagSource::new(Box::new(reader), config(3));

        handle.fail_next(3);
        handle.present("0001");
        for _ in 0..3 {
            assert_eq!(source.poll_non_blocking(), None);
        }
        assert_eq!(source.poll_non_blocking(), Some(TagId::parse("0001").unwrap()));

        let events = handle.events();
        let first_success = events
            .iter()
            .position(|e| matches!(e, DeviceEvent::Read(_)))
            .unwrap();
        let resets_before = events[..first_success]
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Reinit))
            .count();
        assert_eq!(resets_before, 1);
        assert_eq!(source.health().resets, 1);
        assert_eq!(source.health().consecutive_errors, 0);
    }

    #[test]
    fn errors_below_threshold_do_not_reset() {
        let (reader, handle) = SimulatedReader::new();
        let source = TagSource::new(Box::new(reader), config(3));

        handle.fail_next(2);
        source.poll_non_blocking();
        source.poll_non_blocking();
        source.poll_non_blocking();
        handle.fail_next(2);
        source.poll_non_blocking();
        source.poll_non_blocking();

        assert_eq!(handle.reinit_count(), 0);
    }

    #[test]
    fn failed_reset_is_not_fatal() {
        let (reader, handle) = SimulatedReader::new();
        let source = TagSource::new(Box::new(reader), config(1));

        handle.fail_reinit(true);
        handle.fail_next(1);
        assert_eq!(source.poll_non_blocking(), None);
        assert_eq!(handle.reinit_count(), 1);

        handle.fail_reinit(false);
        handle.present("0002");
        // Device is still torn down, so this poll errors and resets again.
        assert_eq!(source.poll_non_blocking(), None);
        assert_eq!(source.poll_non_blocking(), Some(TagId::parse("0002").unwrap()));
    }

    #[test]
    fn quiet_reader_is_reinitialized_proactively() {
        let (reader, handle) = SimulatedReader::new();
        let source = TagSource::new(
            Box::new(reader),
            ReaderConfig {
                max_consecutive_errors: 3,
                reinit_interval: Duration::from_millis(30),
                reset_delay: Duration::ZERO,
            },
        );

        source.poll_non_blocking();
        assert_eq!(handle.reinit_count(), 0);
        thread::sleep(Duration::from_millis(40));
        source.poll_non_blocking();
        assert_eq!(handle.reinit_count(), 1);
        source.poll_non_blocking();
        assert_eq!(handle.reinit_count(), 1);
    }

    #[tokio::test]
    async fn read_with_timeout_returns_tag_when_presented() {
        let (reader, handle) = SimulatedReader::new();
        let source = Arc::new(TagSource::new(Box::new(reader), config(3)));

        let presenter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.present("0042");
        });

        let tag = source
            .read_with_timeout(
                Duration::from_secs(5),
                Duration::from_millis(10),
                &CancellationToken::new(),
            )
            .await;
        presenter.join().unwrap();
        assert_eq!(tag, Some(TagId::parse("0042").unwrap()));
    }

    #[tokio::test]
    async fn read_with_timeout_gives_up_after_timeout() {
        let (reader, _handle) = SimulatedReader::new();
        let source = Arc::new(TagSource::new(Box::new(reader), config(3)));

        let started = Instant::now();
        let tag = source
            .read_with_timeout(
                Duration::from_millis(60),
                Duration::from_millis(10),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(tag, None);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_long_wait_immediately() {
        let (reader, _handle) = SimulatedReader::new();
        let source = Arc::new(TagSource::new(Box::new(reader), config(3)));
        let cancel_token = CancellationToken::new();

        let reading = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                // Long poll interval: only the token can end the wait early.
                let tag = source
                    .read_with_timeout(
                        Duration::from_secs(30),
                        Duration::from_secs(10),
                        &cancel_token,
                    )
                    .await;
                (tag, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();
        let (tag, elapsed) = reading.await.unwrap();
        assert_eq!(tag, None);
        assert!(elapsed < Duration::from_secs(5));
    }
}
