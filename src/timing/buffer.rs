use crate::events::{Event, Lane, MidiMessage, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::collections::btree_map;
use std::ops::Bound;
use std::sync::Arc;

/// Ordering key of a buffered event: timestamp first, insertion order on ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub tick: Tick,
    pub seq: u64,
}

impl EventKey {
    /// Sorts before every event at `tick`.
    pub fn first_at(tick: Tick) -> Self {
        Self { tick, seq: 0 }
    }

    /// Sorts after every event at `tick`.
    pub fn last_at(tick: Tick) -> Self {
        Self { tick, seq: u64::MAX }
    }
}

/// How incoming notes are reconciled with notes already in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Overlapped existing notes are removed.
    Replace,
    /// Everything is kept (overdub).
    Layer,
    /// Incoming notes that overlap existing ones are dropped.
    #[default]
    RejectOverlap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub rejected: usize,
}

type EventMap = BTreeMap<EventKey, Event>;

/// Time-ordered event storage. Cloning is cheap and yields a snapshot:
/// mutations copy the map if any snapshot is still alive.
#[derive(Debug, Clone, Default)]
pub struct EventBuffer {
    events: Arc<EventMap>,
    next_seq: u64,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<I: IntoIterator<Item = Event>>(events: I) -> Self {
        let mut buffer = Self::new();
        for event in events {
            buffer.insert(event);
        }
        buffer
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn snapshot(&self) -> EventBuffer {
        self.clone()
    }

    pub fn insert(&mut self, event: Event) -> EventKey {
        let key = EventKey {
            tick: event.tick,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        Arc::make_mut(&mut self.events).insert(key, event);
        key
    }

    pub fn get(&self, key: EventKey) -> Option<&Event> {
        self.events.get(&key)
    }

    /// Removes every event matching `predicate`. Returns how many went.
    pub fn remove<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Event) -> bool,
    {
        if !self.events.values().any(&mut predicate) {
            return 0;
        }
        let before = self.events.len();
        Arc::make_mut(&mut self.events).retain(|_, event| !predicate(event));
        before - self.events.len()
    }

    /// Swaps the event at `key` for `event`, reinserting it under a fresh key.
    pub fn replace(&mut self, key: EventKey, event: Event) -> Option<EventKey> {
        Arc::make_mut(&mut self.events).remove(&key)?;
        Some(self.insert(event))
    }

    pub fn clear(&mut self) {
        self.events = Arc::new(EventMap::new());
    }

    /// Events with `start <= tick < end`.
    pub fn query_range(&self, start: Tick, end: Tick) -> EventRange {
        self.query_keys(
            Bound::Included(EventKey::first_at(start)),
            Bound::Excluded(EventKey::first_at(end)),
        )
    }

    pub fn query_keys(&self, lower: Bound<EventKey>, upper: Bound<EventKey>) -> EventRange {
        EventRange {
            snapshot: Arc::clone(&self.events),
            lower,
            upper,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = (EventKey, &Event)> + '_ {
        self.events.iter().map(|(key, event)| (*key, event))
    }

    pub fn first_tick(&self) -> Option<Tick> {
        self.events.keys().next().map(|key| key.tick)
    }

    pub fn last_tick(&self) -> Option<Tick> {
        self.events.keys().next_back().map(|key| key.tick)
    }

    pub fn to_vec(&self) -> Vec<Event> {
        self.events.values().copied().collect()
    }

    /// Folds `other` into this buffer under `policy`.
    pub fn merge(&mut self, other: &EventBuffer, policy: ConflictPolicy) -> MergeReport {
        let mut report = MergeReport::default();

        if policy == ConflictPolicy::Layer {
            for event in other.iter() {
                self.insert(*event);
                report.inserted += 1;
            }
            return report;
        }

        let mut existing = spans(self);
        let mut accepted = BTreeSet::new();
        for incoming in spans(other).into_values().flatten() {
            let lane_spans = existing.entry(incoming.lane).or_default();
            let overlapping: Vec<usize> = lane_spans
                .iter()
                .enumerate()
                .filter(|(_, span)| span.overlaps(&incoming))
                .map(|(idx, _)| idx)
                .collect();

            if !overlapping.is_empty() {
                if policy == ConflictPolicy::RejectOverlap {
                    report.rejected += incoming.keys.len();
                    continue;
                }
                let events = Arc::make_mut(&mut self.events);
                for idx in overlapping.into_iter().rev() {
                    let span = lane_spans.remove(idx);
                    for key in &span.keys {
                        if events.remove(key).is_some() {
                            report.replaced += 1;
                        }
                    }
                }
            }

            accepted.extend(incoming.keys.iter().copied());
            // keys of `other` must never be removed from this buffer
            lane_spans.push(Span {
                keys: Vec::new(),
                ..incoming
            });
        }

        // controller events have no duration and are always kept
        for (key, event) in other.entries() {
            if !event.message.is_note() || accepted.contains(&key) {
                self.insert(*event);
                report.inserted += 1;
            }
        }
        report
    }

    /// Releases every note that has no NoteOff, at the tick it started.
    /// Returns how many notes were closed.
    pub fn close_open_notes(&mut self) -> usize {
        let mut open: BTreeMap<Lane, Tick> = BTreeMap::new();
        for event in self.iter() {
            match event.message {
                MidiMessage::NoteOn { .. } => {
                    open.insert(event.message.lane(), event.tick);
                }
                MidiMessage::NoteOff { .. } => {
                    open.remove(&event.message.lane());
                }
                MidiMessage::ControlChange { .. } => {}
            }
        }

        let closed = open.len();
        for (lane, tick) in open {
            if let Lane::Note { channel, note } = lane {
                self.insert(Event::new(tick, MidiMessage::note_off(channel, note)));
            }
        }
        closed
    }

    /// Pairs of same-lane notes that overlap. Zero for any buffer built
    /// without the `Layer` policy.
    pub fn overlap_count(&self) -> usize {
        spans(self)
            .values()
            .map(|lane| {
                let mut count = 0;
                for (idx, a) in lane.iter().enumerate() {
                    count += lane[idx + 1..].iter().filter(|b| a.overlaps(b)).count();
                }
                count
            })
            .sum()
    }
}

/// A note from NoteOn to its NoteOff.
#[derive(Debug, Clone)]
struct Span {
    lane: Lane,
    start: Tick,
    end: Tick,
    keys: Vec<EventKey>,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.lane == other.lane
            && (self.start == other.start || (self.start < other.end && other.start < self.end))
    }
}

fn spans(buffer: &EventBuffer) -> BTreeMap<Lane, Vec<Span>> {
    let mut by_lane: BTreeMap<Lane, Vec<Span>> = BTreeMap::new();
    let mut open: BTreeMap<Lane, (Tick, EventKey)> = BTreeMap::new();

    for (key, event) in buffer.entries() {
        let lane = event.message.lane();
        if event.message.is_note_on() {
            if let Some((start, on_key)) = open.insert(lane, (event.tick, key)) {
                // retriggered without a release
                by_lane.entry(lane).or_default().push(Span {
                    lane,
                    start,
                    end: event.tick,
                    keys: vec![on_key],
                });
            }
        } else if event.message.is_note_off() {
            let (start, keys) = match open.remove(&lane) {
                Some((start, on_key)) => (start, vec![on_key, key]),
                None => (event.tick, vec![key]),
            };
            by_lane.entry(lane).or_default().push(Span {
                lane,
                start,
                end: event.tick,
                keys,
            });
        }
    }

    for (lane, (start, key)) in open {
        by_lane.entry(lane).or_default().push(Span {
            lane,
            start,
            end: Tick::MAX,
            keys: vec![key],
        });
    }
    by_lane
}

/// A read-only window over a buffer snapshot. Inserts made after the range
/// was taken are never observed; every call to [`EventRange::iter`] starts
/// from the beginning again.
#[derive(Debug, Clone)]
pub struct EventRange {
    snapshot: Arc<EventMap>,
    lower: Bound<EventKey>,
    upper: Bound<EventKey>,
}

impl EventRange {
    pub fn iter(&self) -> RangeIter<'_> {
        RangeIter {
            inner: self.entries(),
        }
    }

    pub fn entries(&self) -> Option<btree_map::Range<'_, EventKey, Event>> {
        if is_empty_range(&self.lower, &self.upper) {
            None
        } else {
            Some(self.snapshot.range((self.lower, self.upper)))
        }
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for &'a EventRange {
    type Item = &'a Event;
    type IntoIter = RangeIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RangeIter<'a> {
    inner: Option<btree_map::Range<'a, EventKey, Event>>,
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next().map(|(_, event)| event)
    }
}

// BTreeMap::range panics on inverted bounds.
fn is_empty_range(lower: &Bound<EventKey>, upper: &Bound<EventKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}
