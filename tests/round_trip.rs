use drum_midi::{
    DeviceContext, Error, Event, EventBuffer, ManualSource, MidiMessage, MockBackend, OutputRunner,
    Recording, Settings, Tick, TickSource, TransportController, TransportState,
};
use std::sync::Arc;

struct Studio {
    source: Arc<ManualSource>,
    backend: MockBackend,
    transport: TransportController,
    runner: OutputRunner,
}

impl Studio {
    fn new(settings: Settings) -> Self {
        let source = ManualSource::new();
        let backend = MockBackend::new(vec!["Pads".into()], vec!["Kit".into()], source.clone());
        let devices = DeviceContext::new(Box::new(backend.clone()));
        let (mut transport, runner) = TransportController::new(&settings, source.clone(), devices);
        transport.select_input("Pads").unwrap();
        transport.select_output("Kit").unwrap();
        Self {
            source,
            backend,
            transport,
            runner,
        }
    }

    /// Advances time in 1ms scheduling ticks.
    fn run_for(&mut self, millis: u64) {
        for _ in 0..millis {
            self.source.advance_millis(1);
            self.transport.process();
            self.runner.poll();
        }
    }

    fn sent_since(&self, start_micros: u64) -> Vec<(u64, MidiMessage)> {
        self.backend
            .sent()
            .into_iter()
            .filter(|(micros, _)| *micros >= start_micros)
            .map(|(micros, message)| (micros - start_micros, message))
            .collect()
    }
}

fn assert_close(actual_micros: u64, expected_millis: u64) {
    let expected = expected_millis * 1000;
    assert!(
        actual_micros.abs_diff(expected) <= 2000,
        "emitted at {}us, expected {}us",
        actual_micros,
        expected
    );
}

#[test]
fn test_recorded_take_plays_back_at_same_offsets() {
    let mut studio = Studio::new(Settings::default());
    studio.transport.record().unwrap();

    studio.run_for(500);
    studio.backend.play(&[0x99, 36, 100]);
    studio.run_for(100);
    studio.backend.play(&[0x89, 36, 0]);
    studio.run_for(50);

    let finished = studio.transport.stop().unwrap();
    let ticks: Vec<Tick> = finished.buffer.iter().map(|e| e.tick).collect();
    assert_eq!(ticks, vec![960, 1152]);
    assert_eq!(studio.transport.state(), TransportState::Stopped);

    let start = studio.source.micros();
    studio.transport.play().unwrap();
    studio.run_for(700);

    let sent = studio.sent_since(start);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, MidiMessage::note_on(9, 36, 100));
    assert_close(sent[0].0, 500);
    assert!(sent[1].1.is_note_off());
    assert_close(sent[1].0, 600);
}

#[test]
fn test_seek_during_playback_emits_each_event_once() {
    let mut studio = Studio::new(Settings::default());
    let song = EventBuffer::from_events(
        (0..100u8).map(|i| Event::new(i as Tick * 19, MidiMessage::note_on(9, i, 90))),
    );
    studio.transport.set_song(song).unwrap();
    studio.transport.play().unwrap();
    studio.run_for(300);

    studio.transport.seek(60 * 19).unwrap();
    studio.run_for(200);

    let notes: Vec<u8> = studio.sent_since(0).iter().filter_map(|(_, m)| m.note()).collect();
    let position = studio.transport.status().position;
    let mut expected: Vec<u8> = (0..=30).collect();
    expected.extend((60..100u8).filter(|i| *i as Tick * 19 <= position));
    assert_eq!(notes, expected);
}

#[test]
fn test_tempo_change_reschedules_remaining_hits() {
    let mut studio = Studio::new(Settings::default());
    let song = EventBuffer::from_events(
        (0..8u8).map(|i| Event::new(i as Tick * 960, MidiMessage::note_on(9, 42, 80))),
    );
    studio.transport.set_song(song).unwrap();
    studio.transport.play().unwrap();
    studio.run_for(1000);
    studio.transport.set_tempo(60.0).unwrap();
    studio.run_for(5100);

    let sent = studio.sent_since(0);
    assert_eq!(sent.len(), 8);
    assert_close(sent[2].0, 1000);
    assert_close(sent[3].0, 2000);
    assert_close(sent[7].0, 6000);
}

#[test]
fn test_input_burst_overflows_queue() {
    let settings = Settings {
        input_queue_capacity: 16,
        ..Settings::default()
    };
    let mut studio = Studio::new(settings);
    studio.transport.record().unwrap();
    studio.run_for(1);

    for value in 0..100u8 {
        studio.backend.play(&[0xB9, 4, value]);
    }
    let stats = studio.transport.status().input;
    assert_eq!(stats.received, 100);
    assert_eq!(stats.dropped, 100 - 16);

    studio.run_for(1);
    let stats = studio.transport.status().input;
    assert_eq!(stats.drained, 16);
    assert_eq!(stats.dropped, stats.received - stats.queued - stats.drained);
    assert_eq!(studio.transport.status().take_events, 16);

    let finished = studio.transport.stop().unwrap();
    assert_eq!(finished.report.inserted, 16);
    assert_eq!(finished.report.rejected, 0);
    assert_eq!(studio.transport.song().len(), 16);
}

#[test]
fn test_record_while_playing_keeps_playing() {
    let mut studio = Studio::new(Settings::default());
    studio.transport.play().unwrap();
    studio.run_for(10);

    let err = studio.transport.record().unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(err.to_string(), "cannot record while playing");
    assert_eq!(studio.transport.state(), TransportState::Playing);
}

#[test]
fn test_saved_recording_replays_in_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("groove.ron");

    let mut studio = Studio::new(Settings::default());
    studio.transport.record().unwrap();
    studio.run_for(250);
    studio.backend.play(&[0x99, 38, 110]);
    studio.run_for(20);
    studio.backend.play(&[0x99, 38, 0]);
    studio.run_for(10);
    studio.transport.stop().unwrap();
    Recording::from_buffer("groove", studio.transport.song(), 120.0)
        .save(&path)
        .unwrap();

    let mut replay = Studio::new(Settings::default());
    let recording = Recording::load(&path).unwrap();
    let (song, report) = recording.to_buffer();
    assert_eq!(report.rejected, 0);
    replay.transport.set_song(song).unwrap();
    replay.transport.play().unwrap();
    replay.run_for(300);

    let sent = replay.sent_since(0);
    assert_eq!(sent.len(), 2);
    assert_close(sent[0].0, 250);
    assert_close(sent[1].0, 270);
}
