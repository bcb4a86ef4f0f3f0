use super::{MAX_BPM, MIN_BPM, micros_to_ticks, ticks_to_micros};
use crate::error::{Error, Result};
use crate::events::Tick;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Free-running time base the clock extrapolates from.
pub trait TickSource: Send + Sync {
    /// Microseconds since a fixed origin. Never decreases.
    fn micros(&self) -> u64;
}

pub struct MonotonicSource {
    origin: Instant,
}

impl MonotonicSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicSource {
    fn micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// A source that only moves when told to. Drives deterministic tests and
/// offline runs.
#[derive(Debug, Default)]
pub struct ManualSource {
    micros: AtomicU64,
}

impl ManualSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.advance(millis * 1000);
    }

    /// Moves to `micros`, ignoring requests to go backwards.
    pub fn set(&self, micros: u64) {
        self.micros.fetch_max(micros, Ordering::SeqCst);
    }
}

impl TickSource for ManualSource {
    fn micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
    Paused,
}

/// Published clock state. Readers extrapolate the position from the origin
/// using the tick source. A tempo change waiting for its tick boundary keeps
/// the previous anchor as `lead_in` until `origin_micros` is reached.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    origin_micros: f64,
    origin_ticks: f64,
    bpm: f64,
    running: bool,
    lead_in: Option<LeadIn>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LeadIn {
    origin_micros: f64,
    origin_ticks: f64,
    bpm: f64,
}

impl Anchor {
    fn held(position: f64, bpm: f64) -> Self {
        Self {
            origin_micros: 0.0,
            origin_ticks: position,
            bpm,
            running: false,
            lead_in: None,
        }
    }

    fn running(position: f64, micros: u64, bpm: f64) -> Self {
        Self {
            origin_micros: micros as f64,
            origin_ticks: position,
            bpm,
            running: true,
            lead_in: None,
        }
    }

    fn position_at(&self, micros: u64) -> f64 {
        if !self.running {
            return self.origin_ticks;
        }
        let now = micros as f64;
        if now >= self.origin_micros {
            return self.origin_ticks + micros_to_ticks(now - self.origin_micros, self.bpm);
        }
        match self.lead_in {
            Some(lead_in) if now >= lead_in.origin_micros => {
                let previous =
                    lead_in.origin_ticks + micros_to_ticks(now - lead_in.origin_micros, lead_in.bpm);
                previous.min(self.origin_ticks)
            }
            Some(lead_in) => lead_in.origin_ticks,
            None => self.origin_ticks,
        }
    }
}

/// Lock-free, read-only view of a [`Clock`]. Safe to call from real-time
/// callbacks.
#[derive(Clone)]
pub struct ClockReader {
    source: Arc<dyn TickSource>,
    published: Arc<ArcSwap<Anchor>>,
}

impl ClockReader {
    pub fn now(&self) -> Tick {
        let anchor = self.published.load();
        anchor.position_at(self.source.micros()) as Tick
    }

    pub fn is_running(&self) -> bool {
        self.published.load().running
    }

    pub fn bpm(&self) -> f64 {
        self.published.load().bpm
    }

    pub fn micros(&self) -> u64 {
        self.source.micros()
    }
}

/// Transport clock. Mutated only from the regular processing context; the
/// position is published for lock-free readers.
pub struct Clock {
    reader: ClockReader,
    state: ClockState,
    pending_bpm: Option<f64>,
    seek_locked: bool,
}

impl Clock {
    pub fn new(source: Arc<dyn TickSource>, bpm: f64) -> Self {
        let bpm = if validate_bpm(bpm).is_ok() { bpm } else { 120.0 };
        Self {
            reader: ClockReader {
                source,
                published: Arc::new(ArcSwap::from_pointee(Anchor::held(0.0, bpm))),
            },
            state: ClockState::Stopped,
            pending_bpm: None,
            seek_locked: false,
        }
    }

    pub fn reader(&self) -> ClockReader {
        self.reader.clone()
    }

    pub fn now(&self) -> Tick {
        self.reader.now()
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    /// Tempo currently driving the position.
    pub fn bpm(&self) -> f64 {
        self.anchor().bpm
    }

    /// Tempo the clock will run at once any pending change lands.
    pub fn target_bpm(&self) -> f64 {
        self.pending_bpm.unwrap_or_else(|| self.bpm())
    }

    fn anchor(&self) -> Anchor {
        **self.reader.published.load()
    }

    fn exact_position(&self) -> f64 {
        self.anchor().position_at(self.reader.source.micros())
    }

    fn publish(&self, anchor: Anchor) {
        self.reader.published.store(Arc::new(anchor));
    }

    fn settled_bpm(&mut self) -> f64 {
        self.pending_bpm.take().unwrap_or_else(|| self.bpm())
    }

    /// Runs from the current position.
    pub fn start(&mut self) {
        if self.state == ClockState::Running {
            return;
        }
        let position = self.exact_position();
        let bpm = self.settled_bpm();
        self.publish(Anchor::running(position, self.reader.source.micros(), bpm));
        self.state = ClockState::Running;
        debug!(position, bpm, "clock started");
    }

    /// Halts and rewinds to zero.
    pub fn stop(&mut self) {
        let bpm = self.settled_bpm();
        self.publish(Anchor::held(0.0, bpm));
        self.state = ClockState::Stopped;
        debug!("clock stopped");
    }

    pub fn pause(&mut self) {
        if self.state != ClockState::Running {
            return;
        }
        let position = self.exact_position();
        let bpm = self.settled_bpm();
        self.publish(Anchor::held(position, bpm));
        self.state = ClockState::Paused;
        debug!(position, "clock paused");
    }

    pub fn resume(&mut self) {
        if self.state == ClockState::Paused {
            self.start();
        }
    }

    pub fn seek(&mut self, position: Tick) -> Result<()> {
        if self.seek_locked {
            return Err(Error::invalid_state("seek", "recording"));
        }
        let anchor = self.anchor();
        let next = if self.state == ClockState::Running {
            Anchor::running(position as f64, self.reader.source.micros(), anchor.bpm)
        } else {
            Anchor::held(position as f64, anchor.bpm)
        };
        self.publish(next);
        debug!(position, "clock seek");
        Ok(())
    }

    /// Blocks or allows seeking. Held while a recording session is active.
    pub fn set_seek_locked(&mut self, locked: bool) {
        self.seek_locked = locked;
    }

    /// While running the change waits for the next [`Clock::update`] and lands
    /// on the following tick boundary; otherwise it applies at once.
    pub fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        validate_bpm(bpm)?;
        if self.state == ClockState::Running {
            self.pending_bpm = Some(bpm);
        } else {
            let anchor = self.anchor();
            self.publish(Anchor { bpm, ..anchor });
        }
        Ok(())
    }

    /// Called by the scheduling loop at a fixed interval. Applies a pending
    /// tempo change and returns the current position.
    pub fn update(&mut self) -> Tick {
        if self.state != ClockState::Running {
            return self.now();
        }
        let Some(bpm) = self.pending_bpm.take() else {
            return self.now();
        };

        let micros = self.reader.source.micros();
        let current = self.anchor();
        let next = if (micros as f64) < current.origin_micros {
            Anchor { bpm, ..current }
        } else {
            let exact = current.position_at(micros);
            let boundary = exact.floor() + 1.0;
            Anchor {
                origin_micros: micros as f64 + ticks_to_micros(boundary - exact, current.bpm),
                origin_ticks: boundary,
                bpm,
                running: true,
                lead_in: Some(LeadIn {
                    origin_micros: micros as f64,
                    origin_ticks: exact,
                    bpm: current.bpm,
                }),
            }
        };
        self.publish(next);
        info!(bpm, boundary = next.origin_ticks, "tempo change applied");
        self.now()
    }
}

pub(crate) fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && (MIN_BPM..=MAX_BPM).contains(&bpm) {
        Ok(())
    } else {
        Err(Error::InvalidTempo(bpm))
    }
}
