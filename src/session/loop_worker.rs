use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::playback::PlaybackEngine;
use crate::reader::TagSource;

use super::debounce::{DebounceTracker, TagEvent};
use super::gate::SessionGate;
use super::SessionConfig;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// What the loop should do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TickOutcome {
    Quiet,
    Arrived,
    Departed,
    Suspended,
    Panicked(String),
}

/// Reads the tag source every tick and drives the engine from debounced
/// arrivals and departures until `cancel_token` is cancelled.
///
/// Each tick runs on the blocking pool: reader polls and engine calls do
/// real I/O and may wait on a playback join.
pub async fn session_loop(
    source: Arc<TagSource>,
    engine: PlaybackEngine,
    gate: SessionGate,
    config: SessionConfig,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.tick_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut suspensions = gate.subscribe();
    let mut tracker = DebounceTracker::new(config.departure_threshold);
    log_info!("session loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_token.cancelled() => break,
        }

        let tick = {
            let source = Arc::clone(&source);
            let engine = engine.clone();
            let gate = gate.clone();
            let mut tracker = tracker;
            tokio::task::spawn_blocking(move || {
                let outcome = gate.run_if_enabled(|| {
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        run_tick(&source, &engine, &mut tracker)
                    }))
                });
                let outcome = match outcome {
                    None => TickOutcome::Suspended,
                    Some(Ok(outcome)) => outcome,
                    Some(Err(payload)) => TickOutcome::Panicked(panic_message(payload.as_ref())),
                };
                (tracker, outcome)
            })
        };

        let outcome = match tick.await {
            Ok((returned, outcome)) => {
                tracker = returned;
                outcome
            }
            Err(err) => {
                tracker = DebounceTracker::new(config.departure_threshold);
                TickOutcome::Panicked(format!("tick worker join failed: {err}"))
            }
        };

        let pause = match outcome {
            TickOutcome::Suspended => {
                // Someone else owns the reader; whatever was tracked is stale.
                tracker.reset();
                tokio::select! {
                    released = async { suspensions.wait_for(|count| *count == 0).await.is_ok() } => {
                        if !released {
                            break;
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
                None
            }
            TickOutcome::Arrived => Some(config.debounce_delay),
            TickOutcome::Quiet | TickOutcome::Departed => None,
            TickOutcome::Panicked(message) => {
                log_error!(
                    "session tick panicked ({message}); backing off {:?}",
                    config.error_backoff
                );
                tracker.reset();
                Some(config.error_backoff)
            }
        };

        if let Some(pause) = pause {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel_token.cancelled() => break,
            }
            ticker.reset();
        }
    }

    log_info!("session loop shutting down");
}

fn run_tick(
    source: &TagSource,
    engine: &PlaybackEngine,
    tracker: &mut DebounceTracker,
) -> TickOutcome {
    let read = source.poll_non_blocking();
    match tracker.observe(read.as_ref()) {
        Some(TagEvent::Arrived(tag)) => {
            log_info!("tag arrived: {tag}");
            let state = engine.play(&tag);
            log_info!("{}", state.describe());
            TickOutcome::Arrived
        }
        Some(TagEvent::Departed(tag)) => {
            log_info!("tag removed: {tag}");
            engine.stop();
            TickOutcome::Departed
        }
        None => TickOutcome::Quiet,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
