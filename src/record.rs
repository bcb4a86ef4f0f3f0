use crate::error::{Error, Result};
use crate::events::{Event, Lane, MidiMessage, Tick};
use crate::timing::{ClockReader, ConflictPolicy, EventBuffer, MergeReport};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedInput {
    pub message: MidiMessage,
    pub tick: Tick,
}

struct InputQueue {
    queue: ArrayQueue<TimedInput>,
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Callback-side entry point into a [`RecordEngine`]. Pushing never blocks
/// or allocates; when the queue is full the oldest entry is overwritten.
#[derive(Clone)]
pub struct InputHandle {
    queue: Arc<InputQueue>,
    clock: ClockReader,
}

impl InputHandle {
    pub fn on_input_event(&self, message: MidiMessage, timestamp: Tick) {
        self.queue.received.fetch_add(1, Ordering::Relaxed);
        let input = TimedInput {
            message,
            tick: timestamp,
        };
        if self.queue.queue.force_push(input).is_some() {
            self.queue.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Parses raw bytes and stamps them with the current clock position.
    /// Returns false for messages that are not recorded.
    pub fn on_raw_message(&self, bytes: &[u8]) -> bool {
        match MidiMessage::from_bytes(bytes) {
            Some(message) => {
                self.on_input_event(message, self.clock.now());
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Armed,
    Recording,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Idle => "idle",
            RecordState::Armed => "armed",
            RecordState::Recording => "recording",
        }
    }
}

/// Half-open window `[start, end)` outside of which input is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchWindow {
    pub start: Tick,
    pub end: Tick,
}

impl PunchWindow {
    pub fn contains(&self, tick: Tick) -> bool {
        self.start <= tick && tick < self.end
    }
}

struct Session {
    start: Tick,
    target: EventBuffer,
    take: EventBuffer,
    held: HashMap<Lane, Tick>,
}

impl Session {
    /// Closes every held note at `at`, never before the note began.
    fn release_held(&mut self, at: Tick) -> usize {
        let mut held: Vec<(Lane, Tick)> = self.held.drain().collect();
        held.sort();
        for &(lane, started) in &held {
            if let Lane::Note { channel, note } = lane {
                self.take
                    .insert(Event::new(at.max(started), MidiMessage::note_off(channel, note)));
            }
        }
        held.len()
    }
}

/// Where held notes end: the current position, clamped into the session and
/// the punch window.
fn release_position(now: Tick, start: Tick, punch: Option<PunchWindow>) -> Tick {
    let end = now.max(start);
    match punch {
        Some(window) => end.min(window.end),
        None => end,
    }
}

/// Result of stopping a recording session.
#[derive(Debug, Clone)]
pub struct FinishedTake {
    /// The target buffer with the take merged in.
    pub buffer: EventBuffer,
    pub take: EventBuffer,
    pub report: MergeReport,
    pub start: Tick,
    pub end: Tick,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    pub received: u64,
    pub dropped: u64,
    pub drained: u64,
    pub recorded: u64,
    pub discarded: u64,
    pub queued: u64,
}

pub struct RecordEngine {
    input: InputHandle,
    state: RecordState,
    session: Option<Session>,
    policy: ConflictPolicy,
    punch: Option<PunchWindow>,
    drained: u64,
    recorded: u64,
    discarded: u64,
    reported_dropped: u64,
}

impl RecordEngine {
    pub fn new(capacity: usize, clock: ClockReader) -> Self {
        let queue = Arc::new(InputQueue {
            queue: ArrayQueue::new(capacity.max(1)),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        Self {
            input: InputHandle { queue, clock },
            state: RecordState::Idle,
            session: None,
            policy: ConflictPolicy::default(),
            punch: None,
            drained: 0,
            recorded: 0,
            discarded: 0,
            reported_dropped: 0,
        }
    }

    pub fn input_handle(&self) -> InputHandle {
        self.input.clone()
    }

    pub fn on_input_event(&self, message: MidiMessage, timestamp: Tick) {
        self.input.on_input_event(message, timestamp);
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn set_conflict_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    pub fn punch(&self) -> Option<PunchWindow> {
        self.punch
    }

    pub fn set_punch(&mut self, punch: Option<PunchWindow>) {
        self.punch = punch.filter(|window| window.start < window.end);
    }

    /// Events captured so far in the active session.
    pub fn take(&self) -> Option<&EventBuffer> {
        self.session.as_ref().map(|session| &session.take)
    }

    pub fn arm(&mut self, buffer: EventBuffer, start: Tick) -> Result<()> {
        if self.state == RecordState::Recording {
            return Err(Error::invalid_state("arm", self.state.as_str()));
        }
        let stale = self.discard_queued();
        if stale > 0 {
            debug!(stale, "discarded input queued before arming");
        }
        self.session = Some(Session {
            start,
            target: buffer,
            take: EventBuffer::new(),
            held: HashMap::new(),
        });
        self.state = RecordState::Armed;
        debug!(start, "recorder armed");
        Ok(())
    }

    /// Drops the session without merging and hands the target buffer back.
    pub fn disarm(&mut self) -> Option<EventBuffer> {
        self.state = RecordState::Idle;
        self.session.take().map(|session| session.target)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != RecordState::Armed {
            return Err(Error::invalid_state("start recording", self.state.as_str()));
        }
        self.state = RecordState::Recording;
        Ok(())
    }

    /// Pauses capture. Notes still held are released at the pause position;
    /// releases arriving while paused are discarded with other input.
    pub fn suspend(&mut self) {
        if self.state != RecordState::Recording {
            return;
        }
        self.drain();
        self.state = RecordState::Armed;

        let now = self.input.clock.now();
        let punch = self.punch;
        if let Some(session) = self.session.as_mut() {
            let at = release_position(now, session.start, punch);
            let released = session.release_held(at);
            if released > 0 {
                debug!(released, at, "released held notes on pause");
            }
        }
    }

    pub fn resume(&mut self) {
        if self.state == RecordState::Armed && self.session.is_some() {
            self.discard_queued();
            self.state = RecordState::Recording;
        }
    }

    /// Moves queued input into the session take. Returns how many events
    /// were popped.
    pub fn drain(&mut self) -> usize {
        let dropped = self.input.queue.dropped.load(Ordering::Relaxed);
        if dropped > self.reported_dropped {
            let err = Error::QueueOverflow {
                dropped: dropped - self.reported_dropped,
            };
            warn!(total = dropped, "{}", err);
            self.reported_dropped = dropped;
        }

        let mut popped = 0;
        while let Some(input) = self.input.queue.queue.pop() {
            popped += 1;
            if self.state == RecordState::Recording && self.record(input) {
                self.recorded += 1;
            } else {
                self.discarded += 1;
            }
        }
        self.drained += popped as u64;
        popped
    }

    fn record(&mut self, input: TimedInput) -> bool {
        let punch = self.punch;
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if input.tick < session.start {
            return false;
        }
        let lane = input.message.lane();

        if let Some(window) = punch {
            if input.tick >= window.end {
                // a note released past punch-out ends at the window edge
                if input.message.is_note_off() && session.held.remove(&lane).is_some() {
                    session.take.insert(Event::new(window.end, input.message));
                    return true;
                }
                return false;
            }
            if input.tick < window.start {
                return false;
            }
        }

        match input.message {
            MidiMessage::NoteOn { channel, note, .. } => {
                if session.held.insert(lane, input.tick).is_some() {
                    session
                        .take
                        .insert(Event::new(input.tick, MidiMessage::note_off(channel, note)));
                }
            }
            MidiMessage::NoteOff { .. } => {
                if session.held.remove(&lane).is_none() {
                    return false;
                }
            }
            MidiMessage::ControlChange { .. } => {}
        }
        session.take.insert(Event::new(input.tick, input.message));
        true
    }

    fn discard_queued(&mut self) -> usize {
        let mut count = 0;
        while self.input.queue.queue.pop().is_some() {
            count += 1;
        }
        self.drained += count as u64;
        self.discarded += count as u64;
        count
    }

    /// Ends the session: drains, closes held notes and merges the take into
    /// the target buffer.
    pub fn stop(&mut self) -> Option<FinishedTake> {
        if self.state == RecordState::Recording {
            self.drain();
        }
        self.state = RecordState::Idle;
        let mut session = self.session.take()?;

        let end = release_position(self.input.clock.now(), session.start, self.punch);
        session.release_held(end);

        let mut buffer = session.target;
        let report = buffer.merge(&session.take, self.policy);
        info!(
            events = session.take.len(),
            inserted = report.inserted,
            replaced = report.replaced,
            rejected = report.rejected,
            "take finished"
        );
        Some(FinishedTake {
            buffer,
            take: session.take,
            report,
            start: session.start,
            end,
        })
    }

    pub fn stats(&self) -> InputStats {
        let queue = &self.input.queue;
        InputStats {
            received: queue.received.load(Ordering::Relaxed),
            dropped: queue.dropped.load(Ordering::Relaxed),
            drained: self.drained,
            recorded: self.recorded,
            discarded: self.discarded,
            queued: queue.queue.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{Clock, ManualSource};

    fn setup(capacity: usize) -> (Arc<ManualSource>, Clock, RecordEngine) {
        let source = ManualSource::new();
        let clock = Clock::new(source.clone(), 120.0);
        let engine = RecordEngine::new(capacity, clock.reader());
        (source, clock, engine)
    }

    fn kick_on() -> MidiMessage {
        MidiMessage::note_on(9, 36, 100)
    }

    fn kick_off() -> MidiMessage {
        MidiMessage::note_off(9, 36)
    }

    #[test]
    fn test_records_stamped_raw_input() {
        let (source, mut clock, mut engine) = setup(64);
        let input = engine.input_handle();
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();
        clock.start();

        source.advance_millis(500);
        assert!(input.on_raw_message(&[0x99, 36, 100]));
        source.advance_millis(100);
        assert!(input.on_raw_message(&[0x89, 36, 0]));
        assert!(!input.on_raw_message(&[0xF8]));

        assert_eq!(engine.drain(), 2);
        let finished = engine.stop().unwrap();
        let ticks: Vec<Tick> = finished.buffer.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![960, 1152]);
        assert_eq!(engine.state(), RecordState::Idle);
    }

    #[test]
    fn test_input_before_arming_is_discarded() {
        let (_source, _clock, mut engine) = setup(64);
        engine.on_input_event(kick_on(), 10);
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();
        engine.drain();

        let stats = engine.stats();
        assert_eq!(stats.recorded, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(engine.take().map(|t| t.len()), Some(0));
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let (_source, _clock, mut engine) = setup(8);
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();

        for tick in 0..20 {
            engine.on_input_event(MidiMessage::control_change(0, 1, tick as u8), tick);
        }
        let stats = engine.stats();
        assert_eq!(stats.received, 20);
        assert_eq!(stats.dropped, 12);
        assert_eq!(stats.queued, 8);

        engine.drain();
        for tick in 20..25 {
            engine.on_input_event(MidiMessage::control_change(0, 1, tick as u8), tick);
        }
        let stats = engine.stats();
        assert_eq!(stats.dropped, stats.received - stats.queued - stats.drained);

        // the newest events survive
        let first = engine.take().and_then(|t| t.first_tick());
        assert_eq!(first, Some(12));
    }

    #[test]
    fn test_punch_window_gates_input() {
        let (_source, _clock, mut engine) = setup(64);
        engine.set_punch(Some(PunchWindow {
            start: 100,
            end: 200,
        }));
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();

        engine.on_input_event(kick_on(), 50);
        engine.on_input_event(kick_off(), 60);
        engine.on_input_event(kick_on(), 150);
        engine.on_input_event(kick_off(), 250);
        engine.on_input_event(MidiMessage::control_change(9, 4, 90), 300);
        engine.drain();

        let events: Vec<(Tick, bool)> = engine
            .take()
            .unwrap()
            .iter()
            .map(|e| (e.tick, e.message.is_note_on()))
            .collect();
        assert_eq!(events, vec![(150, true), (200, false)]);
        assert_eq!(engine.stats().discarded, 3);
    }

    #[test]
    fn test_retrigger_closes_held_note() {
        let (_source, _clock, mut engine) = setup(64);
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();

        engine.on_input_event(kick_on(), 10);
        engine.on_input_event(kick_on(), 20);
        engine.on_input_event(kick_off(), 30);
        engine.on_input_event(kick_off(), 40);
        engine.drain();

        let take = engine.take().unwrap();
        let kinds: Vec<(Tick, bool)> = take.iter().map(|e| (e.tick, e.message.is_note_on())).collect();
        assert_eq!(
            kinds,
            vec![(10, true), (20, false), (20, true), (30, false)]
        );
        assert_eq!(take.overlap_count(), 0);
    }

    #[test]
    fn test_pause_releases_held_notes() {
        let (source, mut clock, mut engine) = setup(64);
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();
        clock.start();

        source.advance_millis(500);
        engine.on_input_event(kick_on(), clock.now());
        source.advance_millis(50);
        engine.suspend();
        clock.pause();

        // let go while paused
        source.advance_millis(1000);
        engine.on_input_event(kick_off(), clock.now());
        engine.drain();

        engine.resume();
        clock.resume();
        source.advance_millis(100);
        let finished = engine.stop().unwrap();

        let events: Vec<(Tick, bool)> = finished
            .take
            .iter()
            .map(|e| (e.tick, e.message.is_note_on()))
            .collect();
        assert_eq!(events, vec![(960, true), (1056, false)]);
        assert_eq!(engine.stats().discarded, 1);
    }

    #[test]
    fn test_stop_closes_held_notes() {
        let (source, mut clock, mut engine) = setup(64);
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();
        clock.start();

        engine.on_input_event(kick_on(), 100);
        source.advance_millis(500);
        let finished = engine.stop().unwrap();

        let last = finished.buffer.iter().last().copied().unwrap();
        assert_eq!(last, Event::new(960, kick_off()));
        assert_eq!(finished.end, 960);
    }

    #[test]
    fn test_overdub_rejects_overlapping_notes_by_default() {
        let (_source, _clock, mut engine) = setup(64);
        let mut existing = EventBuffer::new();
        existing.insert(Event::new(0, kick_on()));
        existing.insert(Event::new(100, kick_off()));

        engine.arm(existing, 0).unwrap();
        engine.start().unwrap();
        engine.on_input_event(kick_on(), 50);
        engine.on_input_event(kick_off(), 80);
        engine.on_input_event(MidiMessage::note_on(9, 38, 90), 50);
        engine.on_input_event(MidiMessage::note_off(9, 38), 80);

        let finished = engine.stop().unwrap();
        assert_eq!(finished.report.rejected, 2);
        assert_eq!(finished.report.inserted, 2);
        assert_eq!(finished.buffer.len(), 4);
    }

    #[test]
    fn test_suspended_session_ignores_input() {
        let (_source, _clock, mut engine) = setup(64);
        engine.arm(EventBuffer::new(), 0).unwrap();
        engine.start().unwrap();
        engine.suspend();
        assert_eq!(engine.state(), RecordState::Armed);

        engine.on_input_event(kick_on(), 10);
        engine.resume();
        assert_eq!(engine.state(), RecordState::Recording);
        engine.drain();
        assert_eq!(engine.take().map(|t| t.len()), Some(0));
    }

    #[test]
    fn test_start_requires_armed() {
        let (_source, _clock, mut engine) = setup(64);
        assert!(matches!(engine.start(), Err(Error::InvalidState { .. })));
        assert!(engine.stop().is_none());
    }
}
