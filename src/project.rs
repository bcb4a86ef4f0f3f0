use crate::error::{Error, Result};
use crate::events::{Event, Tick};
use crate::timing::{ConflictPolicy, EventBuffer, MergeReport, TICKS_PER_QUARTER};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

pub const RECORDING_VERSION: &str = "1.0";

/// A song as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub name: String,
    pub version: String,
    pub tempo_bpm: f64,
    pub ticks_per_quarter: u64,
    pub events: Vec<Event>,
}

impl Recording {
    pub fn from_buffer(name: impl Into<String>, buffer: &EventBuffer, tempo_bpm: f64) -> Self {
        Self {
            name: name.into(),
            version: RECORDING_VERSION.to_string(),
            tempo_bpm,
            ticks_per_quarter: TICKS_PER_QUARTER,
            events: buffer.to_vec(),
        }
    }

    /// Rebuilds the song at the clock's resolution. Notes left without a
    /// release are closed where they start, and notes overlapping an earlier
    /// one on the same lane are dropped; the report counts them.
    pub fn to_buffer(&self) -> (EventBuffer, MergeReport) {
        let mut raw = EventBuffer::from_events(self.events.iter().map(|event| Event {
            tick: rescale(event.tick, self.ticks_per_quarter),
            ..*event
        }));
        let closed = raw.close_open_notes();
        if closed > 0 {
            warn!(closed, recording = %self.name, "closed notes without a release");
        }

        let mut song = EventBuffer::new();
        let report = song.merge(&raw, ConflictPolicy::RejectOverlap);
        if report.rejected > 0 {
            warn!(rejected = report.rejected, recording = %self.name, "dropped overlapping notes");
        }
        (song, report)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        let recording: Recording = ron::from_str(&ron_string)?;

        let major = recording.version.split('.').next().unwrap_or_default();
        if major != "1" {
            return Err(Error::UnsupportedVersion(recording.version));
        }
        if let Some(event) = recording.events.iter().find(|event| !event.message.is_valid()) {
            return Err(Error::InvalidRecording(format!(
                "{:?} at tick {} is out of MIDI range",
                event.message, event.tick
            )));
        }
        Ok(recording)
    }
}

fn rescale(tick: Tick, ticks_per_quarter: u64) -> Tick {
    if ticks_per_quarter == 0 || ticks_per_quarter == TICKS_PER_QUARTER {
        return tick;
    }
    let scaled = (tick as u128 * TICKS_PER_QUARTER as u128 + ticks_per_quarter as u128 / 2)
        / ticks_per_quarter as u128;
    scaled.min(Tick::MAX as u128) as Tick
}
