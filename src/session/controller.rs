use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::playback::PlaybackEngine;
use crate::reader::TagSource;

use super::gate::SessionGate;
use super::loop_worker::session_loop;
use super::SessionConfig;

/// Starts and stops the background session loop.
pub struct SessionController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    gate: SessionGate,
}

impl SessionController {
    pub fn new(gate: SessionGate) -> Self {
        Self {
            handle: None,
            cancel_token: None,
            gate,
        }
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawns the loop on the current runtime.
    pub async fn start(
        &mut self,
        source: Arc<TagSource>,
        engine: PlaybackEngine,
        config: SessionConfig,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("session loop already active");
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let gate = self.gate.clone();

        let handle = tokio::spawn(session_loop(source, engine, gate, config, token_clone));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancels the loop and waits for it to finish its current tick.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
            info!("Shutdown signal sent to session loop");
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("session loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}
