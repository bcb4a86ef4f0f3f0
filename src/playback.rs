use crate::error::{Error, Result};
use crate::events::{MidiMessage, Tick};
use crate::timing::{ClockReader, EventBuffer, EventKey, millis_to_ticks};
use parking_lot::Mutex;
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Destination for played-back messages. Implementations must not block.
pub trait OutputSink: Send {
    fn send(&mut self, message: &MidiMessage) -> Result<()>;
}

/// The output port shared between device selection and the output thread.
/// `None` while no port is open.
pub type SharedSink = Arc<Mutex<Option<Box<dyn OutputSink>>>>;

pub fn shared_sink() -> SharedSink {
    Arc::new(Mutex::new(None))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub key: EventKey,
    pub message: MidiMessage,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAck {
    Emitted { key: EventKey, generation: u64 },
    Discarded { key: EventKey, generation: u64 },
    Failed { key: EventKey, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Scheduled,
    Playing,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Scheduled => "scheduled",
            PlaybackState::Playing => "playing",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub dispatched: u64,
    pub emitted: u64,
    pub discarded: u64,
    pub failed: u64,
    /// Scheduling passes cut short by a full dispatch ring.
    pub overruns: u64,
}

pub struct PlaybackEngine {
    clock: ClockReader,
    buffer: Option<EventBuffer>,
    state: PlaybackState,
    paused: bool,
    lookahead_ms: f64,
    dispatch: HeapProd<Dispatched>,
    acks: HeapCons<OutputAck>,
    generation: Arc<AtomicU64>,
    session_floor: u64,
    origin: Tick,
    cursor: Bound<EventKey>,
    last_emitted: Option<EventKey>,
    stats: PlaybackStats,
}

impl PlaybackEngine {
    /// Creates the engine and the [`OutputRunner`] that must be polled from
    /// the output thread.
    pub fn new(
        clock: ClockReader,
        lookahead_ms: f64,
        capacity: usize,
        sink: SharedSink,
    ) -> (PlaybackEngine, OutputRunner) {
        let capacity = capacity.max(1);
        let (dispatch, dispatch_rx) = HeapRb::<Dispatched>::new(capacity).split();
        let (ack_tx, acks) = HeapRb::<OutputAck>::new(capacity * 2).split();
        let generation = Arc::new(AtomicU64::new(0));

        let runner = OutputRunner {
            dispatch: dispatch_rx,
            acks: ack_tx,
            pending: None,
            generation: generation.clone(),
            clock: clock.clone(),
            sink,
        };
        let engine = PlaybackEngine {
            clock,
            buffer: None,
            state: PlaybackState::Idle,
            paused: false,
            lookahead_ms: lookahead_ms.max(0.0),
            dispatch,
            acks,
            generation,
            session_floor: 0,
            origin: 0,
            cursor: Bound::Unbounded,
            last_emitted: None,
            stats: PlaybackStats::default(),
        };
        (engine, runner)
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Counters as of the last drained acknowledgement. Emissions made
    /// since the previous `schedule()` are counted on the next one.
    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn last_emitted(&self) -> Option<EventKey> {
        self.last_emitted
    }

    pub fn lookahead_ms(&self) -> f64 {
        self.lookahead_ms
    }

    pub fn set_lookahead_ms(&mut self, lookahead_ms: f64) {
        self.lookahead_ms = lookahead_ms.max(0.0);
    }

    /// Takes a snapshot of `buffer` to play from.
    pub fn load(&mut self, buffer: &EventBuffer) -> Result<()> {
        if self.state == PlaybackState::Playing {
            return Err(Error::invalid_state("load", self.state.as_str()));
        }
        self.buffer = Some(buffer.snapshot());
        self.state = PlaybackState::Scheduled;
        debug!(events = buffer.len(), "playback loaded");
        Ok(())
    }

    pub fn start(&mut self, from: Tick) -> Result<()> {
        if self.state == PlaybackState::Idle {
            return Err(Error::invalid_state("play", self.state.as_str()));
        }
        self.restart_at(from);
        self.state = PlaybackState::Playing;
        self.paused = false;
        debug!(from, generation = self.generation(), "playback started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.bump_generation();
        self.drain_acks();
        self.state = if self.buffer.is_some() {
            PlaybackState::Scheduled
        } else {
            PlaybackState::Idle
        };
        self.paused = false;
        self.last_emitted = None;
        self.cursor = Bound::Unbounded;
    }

    pub fn pause(&mut self) {
        if self.state != PlaybackState::Playing || self.paused {
            return;
        }
        self.drain_acks();
        self.bump_generation();
        self.paused = true;
    }

    /// Continues right after the last event the output acknowledged, so
    /// nothing is lost or repeated across the pause.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.drain_acks();
        self.cursor = match self.last_emitted {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(EventKey::first_at(self.origin)),
        };
        self.paused = false;
        debug!(cursor = ?self.cursor, "playback resumed");
    }

    pub fn seek(&mut self, position: Tick) {
        if self.state != PlaybackState::Playing {
            return;
        }
        self.restart_at(position);
        debug!(position, generation = self.generation(), "playback seek");
    }

    fn restart_at(&mut self, position: Tick) {
        self.session_floor = self.bump_generation();
        self.drain_acks();
        self.origin = position;
        self.cursor = Bound::Included(EventKey::first_at(position));
        self.last_emitted = None;
    }

    fn bump_generation(&mut self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn drain_acks(&mut self) {
        while let Some(ack) = self.acks.try_pop() {
            match ack {
                OutputAck::Emitted { key, generation } => {
                    self.stats.emitted += 1;
                    if generation >= self.session_floor
                        && self.last_emitted.is_none_or(|last| key > last)
                    {
                        self.last_emitted = Some(key);
                    }
                }
                OutputAck::Discarded { .. } => self.stats.discarded += 1,
                OutputAck::Failed { key, generation } => {
                    self.stats.failed += 1;
                    warn!(tick = key.tick, generation, "output send failed");
                }
            }
        }
    }

    /// One scheduling pass: hands every event up to the lookahead horizon to
    /// the output ring. Returns how many were dispatched.
    pub fn schedule(&mut self) -> usize {
        self.drain_acks();
        if self.state != PlaybackState::Playing || self.paused || !self.clock.is_running() {
            return 0;
        }
        let Some(buffer) = &self.buffer else {
            return 0;
        };

        let horizon = self
            .clock
            .now()
            .saturating_add(millis_to_ticks(self.lookahead_ms, self.clock.bpm()));
        let range = buffer.query_keys(self.cursor, Bound::Included(EventKey::last_at(horizon)));
        let generation = self.generation();

        let mut pushed = 0;
        let mut ring_full = false;
        for (key, event) in range.entries().into_iter().flatten() {
            let dispatched = Dispatched {
                key: *key,
                message: event.message,
                generation,
            };
            if self.dispatch.try_push(dispatched).is_err() {
                self.stats.overruns += 1;
                ring_full = true;
                trace!(tick = key.tick, "dispatch ring full");
                break;
            }
            self.cursor = Bound::Excluded(*key);
            pushed += 1;
        }
        // the rest of the window follows on the next pass
        if !ring_full {
            self.cursor = max_bound(self.cursor, Bound::Excluded(EventKey::last_at(horizon)));
        }
        self.stats.dispatched += pushed as u64;
        pushed
    }
}

fn max_bound(a: Bound<EventKey>, b: Bound<EventKey>) -> Bound<EventKey> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other,
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.max(y)),
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.max(y)),
        (Bound::Excluded(x), Bound::Included(y)) | (Bound::Included(y), Bound::Excluded(x)) => {
            if y > x {
                Bound::Included(y)
            } else {
                Bound::Excluded(x)
            }
        }
    }
}

/// Real-time side of playback. Emits due events to the sink; never blocks.
pub struct OutputRunner {
    dispatch: HeapCons<Dispatched>,
    acks: HeapProd<OutputAck>,
    pending: Option<Dispatched>,
    generation: Arc<AtomicU64>,
    clock: ClockReader,
    sink: SharedSink,
}

impl OutputRunner {
    /// Emits every dispatched event that is due. Returns how many reached
    /// the sink.
    pub fn poll(&mut self) -> usize {
        let now = self.clock.now();
        let current = self.generation.load(Ordering::Acquire);
        let mut emitted = 0;

        loop {
            if self.acks.is_full() {
                break;
            }
            let event = match self.pending.take() {
                Some(event) => event,
                None => match self.dispatch.try_pop() {
                    Some(event) => event,
                    None => break,
                },
            };
            let key = event.key;
            let generation = event.generation;

            if generation != current {
                let _ = self.acks.try_push(OutputAck::Discarded { key, generation });
                continue;
            }
            if key.tick > now {
                self.pending = Some(event);
                break;
            }

            let Some(mut guard) = self.sink.try_lock() else {
                self.pending = Some(event);
                break;
            };
            let ack = match guard.as_mut() {
                Some(sink) => match sink.send(&event.message) {
                    Ok(()) => {
                        emitted += 1;
                        OutputAck::Emitted { key, generation }
                    }
                    Err(_) => OutputAck::Failed { key, generation },
                },
                None => OutputAck::Failed { key, generation },
            };
            drop(guard);
            let _ = self.acks.try_push(ack);
        }
        emitted
    }

    /// Polls until `running` is cleared.
    pub fn run(mut self, running: Arc<AtomicBool>, interval: Duration) {
        while running.load(Ordering::Relaxed) {
            self.poll();
            std::thread::sleep(interval);
        }
    }
}
