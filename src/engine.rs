use crate::config::Settings;
use crate::devices::{DeviceContext, MidiBackend};
use crate::events::{Event, Tick};
use crate::project::Recording;
use crate::record::PunchWindow;
use crate::timing::{ConflictPolicy, EventBuffer, MonotonicSource, TickSource};
use crate::transport::{TransportController, TransportStatus};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Play,
    Record,
    Arm,
    Pause,
    Resume,
    Stop,
    Seek(Tick),
    SetTempo(f64),
    SetPunch(Option<PunchWindow>),
    SetConflictPolicy(ConflictPolicy),
    SelectInput(String),
    SelectOutput(String),
    RefreshDevices,
    SendTestNote,
    LoadRecording(PathBuf),
    SaveRecording(PathBuf),
    ClearRecording,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    Devices {
        inputs: Vec<String>,
        outputs: Vec<String>,
    },
    Status(TransportStatus),
    InputSelected(Option<String>),
    OutputSelected(Option<String>),
    RecordingFinished {
        recorded: usize,
        rejected: usize,
    },
    Song(Vec<Event>),
    Error {
        message: String,
    },
    Info {
        message: String,
    },
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Asks the engine to stop and waits for it.
    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Starts the engine on the wall clock. `settings_path` is where device and
/// tempo changes are persisted.
pub fn spawn_engine(
    settings: Settings,
    settings_path: Option<PathBuf>,
    backend: Box<dyn MidiBackend>,
) -> EngineHandle {
    spawn_engine_with_source(settings, settings_path, backend, Arc::new(MonotonicSource::new()))
}

pub fn spawn_engine_with_source(
    settings: Settings,
    settings_path: Option<PathBuf>,
    backend: Box<dyn MidiBackend>,
    source: Arc<dyn TickSource>,
) -> EngineHandle {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let thread = std::thread::Builder::new()
        .name("drum-midi-engine".into())
        .spawn(move || {
            engine_thread(settings, settings_path, backend, source, command_rx, update_tx);
        });

    let thread = match thread {
        Ok(thread) => Some(thread),
        Err(e) => {
            error!("failed to spawn engine thread: {}", e);
            None
        }
    };

    EngineHandle {
        command_tx,
        update_rx,
        thread,
    }
}

struct EngineState {
    transport: TransportController,
    settings: Settings,
    settings_path: Option<PathBuf>,
    update_tx: Sender<EngineUpdate>,
    last_status: Option<TransportStatus>,
    last_status_sent: Instant,
}

impl EngineState {
    fn send(&self, update: EngineUpdate) {
        let _ = self.update_tx.send(update);
    }

    fn report_error(&self, context: &str, e: impl std::fmt::Display) {
        warn!("{}: {}", context, e);
        self.send(EngineUpdate::Error {
            message: format!("{}: {}", context, e),
        });
    }

    fn save_settings(&self) {
        if let Some(path) = &self.settings_path {
            if let Err(e) = self.settings.save(path) {
                warn!(path = %path.display(), "failed to save settings: {}", e);
            }
        }
    }

    fn refresh_devices(&self) {
        let devices = self.transport.devices();
        let inputs = devices.list_inputs();
        let outputs = devices.list_outputs();
        info!(?outputs, ?inputs, "MIDI ports");
        if inputs.is_empty() && outputs.is_empty() {
            self.send(EngineUpdate::Info {
                message: "No MIDI inputs or outputs found.\n(Is a virtual or hardware MIDI device available?)"
                    .into(),
            });
        }
        self.send(EngineUpdate::Devices { inputs, outputs });
    }

    fn reopen_devices(&mut self) {
        if let Some(name) = self.settings.output_device.clone() {
            if let Err(e) = self.transport.select_output(&name) {
                warn!(device = %name, "could not reopen MIDI output: {}", e);
            }
        }
        if let Some(name) = self.settings.input_device.clone() {
            if let Err(e) = self.transport.select_input(&name) {
                warn!(device = %name, "could not reopen MIDI input: {}", e);
            }
        }
        self.send_selection();
    }

    fn send_selection(&self) {
        let devices = self.transport.devices();
        self.send(EngineUpdate::OutputSelected(
            devices.current_output().map(str::to_string),
        ));
        self.send(EngineUpdate::InputSelected(
            devices.current_input().map(str::to_string),
        ));
    }

    fn send_song(&self) {
        self.send(EngineUpdate::Song(self.transport.song().to_vec()));
    }

    fn publish_status(&mut self, force: bool) {
        if !force && self.last_status_sent.elapsed() < STATUS_INTERVAL {
            return;
        }
        let status = self.transport.status();
        if self.last_status.as_ref() != Some(&status) {
            self.send(EngineUpdate::Status(status.clone()));
            self.last_status = Some(status);
        }
        self.last_status_sent = Instant::now();
    }

    /// Returns false once the engine should exit.
    fn handle(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "engine command");
        match command {
            EngineCommand::Play => {
                if let Err(e) = self.transport.play() {
                    self.report_error("Play failed", e);
                }
            }
            EngineCommand::Record => {
                if let Err(e) = self.transport.record() {
                    self.report_error("Record failed", e);
                }
            }
            EngineCommand::Arm => {
                if let Err(e) = self.transport.arm() {
                    self.report_error("Arm failed", e);
                }
            }
            EngineCommand::Pause => {
                if let Err(e) = self.transport.pause() {
                    self.report_error("Pause failed", e);
                }
            }
            EngineCommand::Resume => {
                if let Err(e) = self.transport.resume() {
                    self.report_error("Resume failed", e);
                }
            }
            EngineCommand::Stop => {
                if let Some(finished) = self.transport.stop() {
                    self.send(EngineUpdate::RecordingFinished {
                        recorded: finished.take.len(),
                        rejected: finished.report.rejected,
                    });
                    self.send_song();
                }
            }
            EngineCommand::Seek(position) => {
                if let Err(e) = self.transport.seek(position) {
                    self.report_error("Seek failed", e);
                }
            }
            EngineCommand::SetTempo(bpm) => match self.transport.set_tempo(bpm) {
                Ok(()) => {
                    self.settings.tempo_bpm = bpm;
                    self.save_settings();
                }
                Err(e) => self.report_error("Tempo change failed", e),
            },
            EngineCommand::SetPunch(punch) => self.transport.set_punch(punch),
            EngineCommand::SetConflictPolicy(policy) => {
                self.transport.set_conflict_policy(policy);
                self.settings.conflict_policy = policy;
                self.save_settings();
            }
            EngineCommand::SelectInput(name) => {
                match self.transport.select_input(&name) {
                    Ok(()) => {
                        self.settings.input_device = Some(name).filter(|n| !n.is_empty());
                        self.save_settings();
                    }
                    Err(e) => self.report_error("Error opening MIDI input", e),
                }
                self.send_selection();
            }
            EngineCommand::SelectOutput(name) => {
                match self.transport.select_output(&name) {
                    Ok(()) => {
                        self.settings.output_device = Some(name).filter(|n| !n.is_empty());
                        self.save_settings();
                    }
                    Err(e) => self.report_error("Error opening MIDI output", e),
                }
                self.send_selection();
            }
            EngineCommand::RefreshDevices => {
                self.refresh_devices();
                self.send_selection();
            }
            EngineCommand::SendTestNote => {
                if let Err(e) = self.transport.devices().send_test_note() {
                    self.report_error("Test note failed", e);
                }
            }
            EngineCommand::LoadRecording(path) => match Recording::load(&path) {
                Ok(recording) => {
                    let (song, report) = recording.to_buffer();
                    match self.transport.set_song(song) {
                        Ok(()) => {
                            if let Err(e) = self.transport.set_tempo(recording.tempo_bpm) {
                                warn!("recording tempo ignored: {}", e);
                            }
                            info!(path = %path.display(), events = report.inserted, "recording loaded");
                            if report.rejected > 0 {
                                self.send(EngineUpdate::Info {
                                    message: format!(
                                        "Loaded recording ({} overlapping events dropped)",
                                        report.rejected
                                    ),
                                });
                            }
                            self.send_song();
                        }
                        Err(e) => self.report_error("Failed to load recording", e),
                    }
                }
                Err(e) => self.report_error("Failed to load recording", e),
            },
            EngineCommand::SaveRecording(path) => {
                let name = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "recording".into());
                let recording =
                    Recording::from_buffer(name, self.transport.song(), self.transport.status().target_bpm);
                match recording.save(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), "recording saved");
                        self.send(EngineUpdate::Info {
                            message: format!("Saved {}", path.display()),
                        });
                    }
                    Err(e) => self.report_error("Failed to save recording", e),
                }
            }
            EngineCommand::ClearRecording => match self.transport.set_song(EventBuffer::new()) {
                Ok(()) => self.send_song(),
                Err(e) => self.report_error("Clear failed", e),
            },
            EngineCommand::Shutdown => return false,
        }
        self.publish_status(true);
        true
    }
}

fn engine_thread(
    settings: Settings,
    settings_path: Option<PathBuf>,
    backend: Box<dyn MidiBackend>,
    source: Arc<dyn TickSource>,
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let devices = DeviceContext::new(backend);
    let (transport, runner) = TransportController::new(&settings, source, devices);

    let running = Arc::new(AtomicBool::new(true));
    let poll = Duration::from_micros(settings.output_poll_micros.max(1));
    let output_running = running.clone();
    let output_thread = std::thread::Builder::new()
        .name("drum-midi-output".into())
        .spawn(move || runner.run(output_running, poll));
    if let Err(e) = &output_thread {
        error!("failed to spawn output thread: {}", e);
    }

    let interval = Duration::from_millis(settings.schedule_interval_ms.max(1));
    let mut state = EngineState {
        transport,
        settings,
        settings_path,
        update_tx,
        last_status: None,
        last_status_sent: Instant::now(),
    };

    state.refresh_devices();
    state.reopen_devices();
    state.send_song();
    state.publish_status(true);

    let mut next_tick = Instant::now();
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match command_rx.recv_timeout(timeout) {
            Ok(command) => {
                if !state.handle(command) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_tick {
            state.transport.process();
            state.publish_status(false);
            next_tick += interval;
            // fell behind, do not try to catch up tick by tick
            if next_tick < Instant::now() {
                next_tick = Instant::now() + interval;
            }
        }
    }

    state.transport.stop();
    running.store(false, Ordering::Relaxed);
    if let Ok(thread) = output_thread {
        let _ = thread.join();
    }
    state.transport.devices_mut().close_all();
    info!("engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockBackend;
    use crate::timing::ManualSource;

    fn wait_for<F>(handle: &EngineHandle, mut matches: F) -> EngineUpdate
    where
        F: FnMut(&EngineUpdate) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let update = handle
                .update_rx
                .recv_timeout(remaining)
                .expect("engine update");
            if matches(&update) {
                return update;
            }
        }
    }

    #[test]
    fn test_reopens_devices_from_settings() {
        let source = ManualSource::new();
        let backend = MockBackend::new(vec!["Pads".into()], vec!["Kit".into()], source.clone());
        let settings = Settings {
            output_device: Some("Kit".into()),
            input_device: Some("Gone".into()),
            ..Settings::default()
        };
        let handle = spawn_engine_with_source(settings, None, Box::new(backend.clone()), source);

        let update = wait_for(&handle, |u| matches!(u, EngineUpdate::OutputSelected(_)));
        assert!(matches!(update, EngineUpdate::OutputSelected(Some(name)) if name == "Kit"));
        let update = wait_for(&handle, |u| matches!(u, EngineUpdate::InputSelected(_)));
        assert!(matches!(update, EngineUpdate::InputSelected(None)));

        handle.command_tx.send(EngineCommand::SendTestNote).unwrap();
        handle.command_tx.send(EngineCommand::Record).unwrap();
        handle.command_tx.send(EngineCommand::Play).unwrap();
        let update = wait_for(&handle, |u| matches!(u, EngineUpdate::Error { .. }));
        assert!(matches!(update, EngineUpdate::Error { message } if message.contains("recording")));

        handle.shutdown();
        assert_eq!(backend.sent().len(), 1);
    }

    #[test]
    fn test_settings_saved_on_device_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drum-midi.ron");
        let source = ManualSource::new();
        let backend = MockBackend::new(vec!["Pads".into()], vec!["Kit".into()], source.clone());
        let handle =
            spawn_engine_with_source(Settings::default(), Some(path.clone()), Box::new(backend), source);

        handle
            .command_tx
            .send(EngineCommand::SelectInput("Pads".into()))
            .unwrap();
        handle.command_tx.send(EngineCommand::SetTempo(100.0)).unwrap();
        handle.command_tx.send(EngineCommand::SetTempo(1.0)).unwrap();
        wait_for(&handle, |u| matches!(u, EngineUpdate::Error { .. }));
        handle.shutdown();

        let saved = Settings::load(&path).unwrap();
        assert_eq!(saved.input_device.as_deref(), Some("Pads"));
        assert_eq!(saved.tempo_bpm, 100.0);
    }
}
