use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{
    mpsc::{self, Sender, SyncSender},
    Mutex,
};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};

use super::{volume_to_gain, AudioBackend};
use crate::error::{Error, Result};

// A wedged output device must not hold the playback task forever.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

enum AudioCommand {
    Load {
        path: PathBuf,
        reply: SyncSender<Result<()>>,
    },
    Play {
        reply: SyncSender<Result<()>>,
    },
    Stop,
    IsBusy {
        reply: SyncSender<bool>,
    },
    SetVolume(f32),
    SelectOutput {
        name: Option<String>,
        reply: SyncSender<Result<()>>,
    },
}

type Output = (OutputStream, OutputStreamHandle);

/// `rodio` output running on a dedicated thread.
///
/// `OutputStream` is not `Send`, so the stream and sink live on the
/// `audio-engine` thread and everything else talks to it over a channel.
pub struct RodioBackend {
    tx: Mutex<Option<Sender<AudioCommand>>>,
}

impl Default for RodioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RodioBackend {
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
        let mut guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AudioCommand>();

        thread::Builder::new()
            .name("audio-engine".to_string())
            .spawn(move || {
                let mut output: Option<Output> = None;
                let mut device: Option<String> = None;
                let mut sink: Option<Sink> = None;
                let mut gain = 1.0f32;

                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        AudioCommand::Load { path, reply } => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                            let result = load_track(&mut output, device.as_deref(), &path, gain)
                                .map(|new_sink| {
                                    sink = Some(new_sink);
                                });
                            let _ = reply.send(result);
                        }
                        AudioCommand::Play { reply } => {
                            let result = match sink.as_ref() {
                                Some(s) => {
                                    s.play();
                                    Ok(())
                                }
                                None => Err(Error::PlaybackBackend("no track loaded".into())),
                            };
                            let _ = reply.send(result);
                        }
                        AudioCommand::Stop => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                        }
                        AudioCommand::IsBusy { reply } => {
                            let busy = sink.as_ref().map(|s| !s.empty()).unwrap_or(false);
                            let _ = reply.send(busy);
                        }
                        AudioCommand::SetVolume(value) => {
                            gain = value;
                            if let Some(s) = sink.as_ref() {
                                s.set_volume(gain);
                            }
                        }
                        AudioCommand::SelectOutput { name, reply } => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                            // The old stream stays open if the new device fails.
                            let result = open_output(name.as_deref()).map(|opened| {
                                output = Some(opened);
                                device = name;
                            });
                            let _ = reply.send(result);
                        }
                    }
                }
                info!("Audio thread shutting down");
            })
            .map_err(|e| Error::PlaybackBackend(format!("failed to spawn audio thread: {e}")))?;

        *guard = Some(tx.clone());
        Ok(tx)
    }

    fn request<T>(&self, build: impl FnOnce(SyncSender<T>) -> AudioCommand) -> Result<T> {
        let tx = self.ensure_thread()?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        tx.send(build(reply_tx))
            .map_err(|e| Error::PlaybackBackend(e.to_string()))?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| Error::PlaybackBackend(format!("audio thread did not answer: {e}")))
    }
}

/// Opens the named output device, or the system default for `None`.
fn open_output(name: Option<&str>) -> Result<Output> {
    let Some(name) = name else {
        return OutputStream::try_default()
            .map_err(|e| Error::PlaybackBackend(format!("failed to open audio output: {e}")));
    };

    let host = rodio::cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| Error::PlaybackBackend(format!("failed to list audio outputs: {e}")))?;
    for candidate in devices {
        if candidate.name().is_ok_and(|found| found == name) {
            info!("Opening audio output {name}");
            return OutputStream::try_from_device(&candidate)
                .map_err(|e| Error::PlaybackBackend(format!("{name} device unavailable: {e}")));
        }
    }
    Err(Error::PlaybackBackend(format!("{name} device unavailable")))
}

fn load_track(
    output: &mut Option<Output>,
    device: Option<&str>,
    path: &Path,
    gain: f32,
) -> Result<Sink> {
    if output.is_none() {
        *output = Some(open_output(device)?);
    }
    let handle = match output.as_ref() {
        Some((_, handle)) => handle,
        None => return Err(Error::PlaybackBackend("audio output unavailable".into())),
    };

    let file = File::open(path)
        .map_err(|e| Error::PlaybackBackend(format!("failed to open {}: {e}", path.display())))?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| Error::PlaybackBackend(format!("failed to decode {}: {e}", path.display())))?;

    let sink = Sink::try_new(handle)
        .map_err(|e| Error::PlaybackBackend(format!("failed to create audio sink: {e}")))?;
    sink.pause();
    sink.set_volume(gain);
    sink.append(decoder);
    debug!("Loaded {}", path.display());
    Ok(sink)
}

impl AudioBackend for RodioBackend {
    fn load(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.request(|reply| AudioCommand::Load { path, reply })?
    }

    fn play(&self) -> Result<()> {
        self.request(|reply| AudioCommand::Play { reply })?
    }

    fn stop(&self) {
        let sender = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(tx) = sender {
            if tx.send(AudioCommand::Stop).is_err() {
                error!("Audio thread is gone; stop ignored");
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.request(|reply| AudioCommand::IsBusy { reply })
            .unwrap_or(false)
    }

    fn set_volume(&self, percent: u8) {
        match self.ensure_thread() {
            Ok(tx) => {
                let _ = tx.send(AudioCommand::SetVolume(volume_to_gain(percent)));
            }
            Err(err) => error!("Failed to set volume: {err}"),
        }
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        let host = rodio::cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| Error::PlaybackBackend(format!("failed to list audio outputs: {e}")))?;
        Ok(devices
            .filter_map(|device| match device.name() {
                Ok(name) => Some(name),
                Err(err) => {
                    warn!("Skipping unnamed audio output: {err}");
                    None
                }
            })
            .collect())
    }

    fn select_output(&self, name: Option<&str>) -> Result<()> {
        let name = name.map(str::to_string);
        self.request(|reply| AudioCommand::SelectOutput { name, reply })?
    }
}
