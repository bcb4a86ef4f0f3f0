use crate::config::Settings;
use crate::devices::DeviceContext;
use crate::error::{Error, Result};
use crate::events::Tick;
use crate::playback::{OutputRunner, PlaybackEngine, PlaybackStats};
use crate::record::{FinishedTake, InputStats, PunchWindow, RecordEngine, RecordState};
use crate::timing::{Clock, ClockReader, ConflictPolicy, EventBuffer, TickSource};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Recording,
    Paused,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Recording => "recording",
            TransportState::Paused => "paused",
        }
    }
}

/// Point-in-time view of the transport for display.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportStatus {
    pub state: TransportState,
    /// What a paused transport returns to.
    pub paused_from: Option<TransportState>,
    pub position: Tick,
    pub bpm: f64,
    pub target_bpm: f64,
    pub armed: bool,
    pub song_events: usize,
    pub take_events: usize,
    pub input: InputStats,
    pub playback: PlaybackStats,
    pub generation: u64,
}

pub struct TransportController {
    clock: Clock,
    recorder: RecordEngine,
    player: PlaybackEngine,
    devices: DeviceContext,
    song: EventBuffer,
    state: TransportState,
    paused_from: Option<TransportState>,
}

impl TransportController {
    pub fn new(
        settings: &Settings,
        source: Arc<dyn TickSource>,
        devices: DeviceContext,
    ) -> (Self, OutputRunner) {
        let clock = Clock::new(source, settings.tempo_bpm);
        let mut recorder = RecordEngine::new(settings.input_queue_capacity, clock.reader());
        recorder.set_conflict_policy(settings.conflict_policy);
        let (player, runner) = PlaybackEngine::new(
            clock.reader(),
            settings.lookahead_ms,
            settings.output_queue_capacity,
            devices.output_sink(),
        );

        let controller = Self {
            clock,
            recorder,
            player,
            devices,
            song: EventBuffer::new(),
            state: TransportState::Stopped,
            paused_from: None,
        };
        (controller, runner)
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    fn reject(&self, action: &'static str) -> Error {
        Error::invalid_state(action, self.state.as_str())
    }

    fn session_active(&self) -> bool {
        self.state == TransportState::Recording
            || self.paused_from == Some(TransportState::Recording)
    }

    pub fn play(&mut self) -> Result<()> {
        match (self.state, self.paused_from) {
            (TransportState::Stopped, _) => {
                let from = self.clock.now();
                self.player.load(&self.song)?;
                self.player.start(from)?;
                self.clock.start();
                self.state = TransportState::Playing;
                info!(from, events = self.song.len(), "playing");
                Ok(())
            }
            (TransportState::Paused, Some(TransportState::Playing)) => self.resume(),
            _ => Err(self.reject("play")),
        }
    }

    /// Arms the recorder at the current position without starting.
    pub fn arm(&mut self) -> Result<()> {
        if self.state != TransportState::Stopped {
            return Err(self.reject("arm"));
        }
        self.recorder.arm(self.song.snapshot(), self.clock.now())
    }

    pub fn record(&mut self) -> Result<()> {
        match (self.state, self.paused_from) {
            (TransportState::Stopped, _) => {
                let from = self.clock.now();
                if self.recorder.state() != RecordState::Armed {
                    self.recorder.arm(self.song.snapshot(), from)?;
                }
                self.recorder.start()?;
                self.clock.set_seek_locked(true);
                self.clock.start();
                self.state = TransportState::Recording;
                info!(from, "recording");
                Ok(())
            }
            (TransportState::Paused, Some(TransportState::Recording)) => self.resume(),
            _ => Err(self.reject("record")),
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            TransportState::Playing => self.player.pause(),
            TransportState::Recording => self.recorder.suspend(),
            _ => return Err(self.reject("pause")),
        }
        self.clock.pause();
        self.paused_from = Some(self.state);
        self.state = TransportState::Paused;
        debug!(position = self.clock.now(), "paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let Some(previous) = self.paused_from.filter(|_| self.state == TransportState::Paused)
        else {
            return Err(self.reject("resume"));
        };
        self.clock.resume();
        match previous {
            TransportState::Recording => self.recorder.resume(),
            _ => self.player.resume(),
        }
        self.paused_from = None;
        self.state = previous;
        debug!(state = previous.as_str(), "resumed");
        Ok(())
    }

    /// Stops everything and rewinds. An active recording session is merged
    /// into the song and returned.
    pub fn stop(&mut self) -> Option<FinishedTake> {
        let finished = if self.session_active() {
            self.recorder.stop()
        } else {
            self.recorder.disarm();
            None
        };
        self.player.stop();
        self.clock.stop();
        self.clock.set_seek_locked(false);

        if let Some(take) = &finished {
            self.song = take.buffer.clone();
        }
        self.state = TransportState::Stopped;
        self.paused_from = None;
        info!("stopped");
        finished
    }

    pub fn seek(&mut self, position: Tick) -> Result<()> {
        if self.session_active() {
            return Err(self.reject("seek"));
        }
        self.clock.seek(position)?;
        match self.state {
            TransportState::Playing | TransportState::Paused => self.player.seek(position),
            TransportState::Stopped if self.recorder.state() == RecordState::Armed => {
                self.recorder.disarm();
                self.recorder.arm(self.song.snapshot(), position)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        self.clock.set_tempo(bpm)?;
        info!(bpm, "tempo set");
        Ok(())
    }

    pub fn set_punch(&mut self, punch: Option<PunchWindow>) {
        self.recorder.set_punch(punch);
    }

    pub fn set_conflict_policy(&mut self, policy: ConflictPolicy) {
        self.recorder.set_conflict_policy(policy);
    }

    /// One scheduling tick.
    pub fn process(&mut self) {
        self.clock.update();
        self.recorder.drain();
        self.player.schedule();
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus {
            state: self.state,
            paused_from: self.paused_from,
            position: self.clock.now(),
            bpm: self.clock.bpm(),
            target_bpm: self.clock.target_bpm(),
            armed: self.recorder.state() != RecordState::Idle,
            song_events: self.song.len(),
            take_events: self.recorder.take().map_or(0, EventBuffer::len),
            input: self.recorder.stats(),
            playback: self.player.stats(),
            generation: self.player.generation(),
        }
    }

    pub fn song(&self) -> &EventBuffer {
        &self.song
    }

    pub fn set_song(&mut self, song: EventBuffer) -> Result<()> {
        if self.state != TransportState::Stopped {
            return Err(self.reject("replace the song"));
        }
        self.song = song;
        if self.recorder.state() == RecordState::Armed {
            self.recorder.disarm();
            self.recorder.arm(self.song.snapshot(), self.clock.now())?;
        }
        Ok(())
    }

    pub fn select_input(&mut self, name: &str) -> Result<()> {
        let handle = self.recorder.input_handle();
        self.devices.select_input(name, handle)
    }

    pub fn select_output(&mut self, name: &str) -> Result<()> {
        self.devices.select_output(name)
    }

    pub fn devices(&self) -> &DeviceContext {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceContext {
        &mut self.devices
    }

    pub fn clock_reader(&self) -> ClockReader {
        self.clock.reader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockBackend;
    use crate::events::{Event, MidiMessage};
    use crate::timing::ManualSource;

    fn controller() -> (Arc<ManualSource>, TransportController) {
        let source = ManualSource::new();
        let backend = MockBackend::new(vec!["Pads".into()], vec!["Kit".into()], source.clone());
        let devices = DeviceContext::new(Box::new(backend));
        let (controller, _runner) =
            TransportController::new(&Settings::default(), source.clone(), devices);
        (source, controller)
    }

    #[test]
    fn test_record_while_playing_is_rejected() {
        let (_source, mut transport) = controller();
        transport.play().unwrap();

        let result = transport.record();
        assert!(matches!(
            result,
            Err(Error::InvalidState {
                action: "record",
                state: "playing"
            })
        ));
        assert_eq!(transport.state(), TransportState::Playing);
    }

    #[test]
    fn test_pause_returns_to_previous_state() {
        let (source, mut transport) = controller();
        transport.record().unwrap();
        source.advance_millis(100);
        transport.pause().unwrap();
        assert_eq!(transport.state(), TransportState::Paused);
        assert!(transport.play().is_err());

        transport.record().unwrap();
        assert_eq!(transport.state(), TransportState::Recording);
        transport.stop();

        transport.play().unwrap();
        transport.pause().unwrap();
        transport.resume().unwrap();
        assert_eq!(transport.state(), TransportState::Playing);
    }

    #[test]
    fn test_illegal_transitions_keep_state() {
        let (_source, mut transport) = controller();
        assert!(transport.pause().is_err());
        assert!(transport.resume().is_err());
        assert_eq!(transport.state(), TransportState::Stopped);

        transport.record().unwrap();
        assert!(transport.play().is_err());
        assert!(transport.arm().is_err());
        assert_eq!(transport.state(), TransportState::Recording);
    }

    #[test]
    fn test_seek_locked_during_recording_session() {
        let (source, mut transport) = controller();
        transport.record().unwrap();
        source.advance_millis(250);
        assert!(matches!(transport.seek(0), Err(Error::InvalidState { .. })));

        transport.pause().unwrap();
        assert!(transport.seek(0).is_err());
        assert_eq!(transport.status().position, 480);

        transport.stop();
        transport.seek(960).unwrap();
        assert_eq!(transport.status().position, 960);
    }

    #[test]
    fn test_stop_merges_take_into_song() {
        let (source, mut transport) = controller();
        transport.select_input("Pads").unwrap();
        let input = transport.recorder.input_handle();
        transport.record().unwrap();

        source.advance_millis(500);
        input.on_input_event(MidiMessage::note_on(9, 36, 100), transport.clock.now());
        source.advance_millis(100);
        input.on_input_event(MidiMessage::note_off(9, 36), transport.clock.now());
        transport.process();
        assert_eq!(transport.status().take_events, 2);

        let finished = transport.stop().unwrap();
        assert_eq!(finished.report.inserted, 2);
        assert_eq!(transport.song().len(), 2);
        assert_eq!(transport.status().position, 0);
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[test]
    fn test_armed_recorder_follows_seek() {
        let (source, mut transport) = controller();
        transport.arm().unwrap();
        transport.seek(1920).unwrap();
        transport.record().unwrap();

        let input = transport.recorder.input_handle();
        input.on_input_event(MidiMessage::control_change(9, 4, 10), 1000);
        source.advance_millis(10);
        input.on_input_event(MidiMessage::control_change(9, 4, 20), transport.clock.now());
        let finished = transport.stop().unwrap();

        assert_eq!(finished.start, 1920);
        let ticks: Vec<Tick> = finished.take.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![1939]);
    }

    #[test]
    fn test_song_replaced_only_when_stopped() {
        let (_source, mut transport) = controller();
        let song = EventBuffer::from_events([Event::new(0, MidiMessage::note_on(9, 42, 70))]);
        transport.set_song(song.clone()).unwrap();

        transport.play().unwrap();
        assert!(transport.set_song(EventBuffer::new()).is_err());
        assert_eq!(transport.song().len(), 1);
    }

    #[test]
    fn test_tempo_status() {
        let (_source, mut transport) = controller();
        transport.set_tempo(90.0).unwrap();
        assert_eq!(transport.status().bpm, 90.0);
        assert!(transport.set_tempo(-1.0).is_err());
    }
}
