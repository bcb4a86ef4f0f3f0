use serde::{Deserialize, Serialize};

/// Transport position in clock ticks.
pub type Tick = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
}

/// The per-channel slot a message occupies. Overlap rules are evaluated per
/// lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Note { channel: u8, note: u8 },
    Controller { channel: u8, controller: u8 },
}

impl MidiMessage {
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        MidiMessage::NoteOn {
            channel: channel & 0x0F,
            note: note & 0x7F,
            velocity: velocity & 0x7F,
        }
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        MidiMessage::NoteOff {
            channel: channel & 0x0F,
            note: note & 0x7F,
            velocity: 0,
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        MidiMessage::ControlChange {
            channel: channel & 0x0F,
            controller: controller & 0x7F,
            value: value & 0x7F,
        }
    }

    /// Parses a raw channel message. Anything that is not a note or a
    /// control change is ignored.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        let channel = data[0] & 0x0F;
        let (d1, d2) = (data[1] & 0x7F, data[2] & 0x7F);

        match data[0] & 0xF0 {
            0x90 if d2 > 0 => Some(MidiMessage::NoteOn {
                channel,
                note: d1,
                velocity: d2,
            }),
            0x80 | 0x90 => Some(MidiMessage::NoteOff {
                channel,
                note: d1,
                velocity: d2,
            }),
            0xB0 => Some(MidiMessage::ControlChange {
                channel,
                controller: d1,
                value: d2,
            }),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => [0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => [0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F],
        }
    }

    /// True when the channel and both data bytes fit the MIDI ranges.
    /// Messages built by the constructors or parsed from bytes always do.
    pub fn is_valid(&self) -> bool {
        let (channel, d1, d2) = match *self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            }
            | MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => (channel, note, velocity),
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => (channel, controller, value),
        };
        channel <= 0x0F && d1 <= 0x7F && d2 <= 0x7F
    }

    pub fn channel(&self) -> u8 {
        match *self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::ControlChange { channel, .. } => channel,
        }
    }

    pub fn lane(&self) -> Lane {
        match *self {
            MidiMessage::NoteOn { channel, note, .. } | MidiMessage::NoteOff { channel, note, .. } => {
                Lane::Note { channel, note }
            }
            MidiMessage::ControlChange {
                channel,
                controller,
                ..
            } => Lane::Controller {
                channel,
                controller,
            },
        }
    }

    pub fn note(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOn { note, .. } | MidiMessage::NoteOff { note, .. } => Some(note),
            MidiMessage::ControlChange { .. } => None,
        }
    }

    pub fn is_note(&self) -> bool {
        !matches!(self, MidiMessage::ControlChange { .. })
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }

    pub fn is_note_off(&self) -> bool {
        matches!(self, MidiMessage::NoteOff { .. })
    }
}

/// A message stamped with its transport position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub tick: Tick,
    pub message: MidiMessage,
}

impl Event {
    pub fn new(tick: Tick, message: MidiMessage) -> Self {
        Self { tick, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_velocity_note_on_is_note_off() {
        let msg = MidiMessage::from_bytes(&[0x99, 36, 0]).unwrap();
        assert_eq!(
            msg,
            MidiMessage::NoteOff {
                channel: 9,
                note: 36,
                velocity: 0
            }
        );
    }

    #[test]
    fn test_unsupported_status_is_ignored() {
        assert_eq!(MidiMessage::from_bytes(&[0xE0, 0x00, 0x40]), None);
        assert_eq!(MidiMessage::from_bytes(&[0xF8]), None);
        assert_eq!(MidiMessage::from_bytes(&[0x90, 60]), None);
    }

    #[test]
    fn test_constructors_mask_out_of_range_values() {
        let msg = MidiMessage::note_on(0x1A, 200, 255);
        assert_eq!(msg.channel(), 0x0A);
        assert_eq!(msg.to_bytes(), [0x9A, 200 & 0x7F, 0x7F]);
    }

    #[test]
    fn test_out_of_range_data_never_reaches_the_wire() {
        let msg = MidiMessage::NoteOn {
            channel: 9,
            note: 200,
            velocity: 255,
        };
        assert!(!msg.is_valid());
        assert!(msg.to_bytes()[1..].iter().all(|byte| *byte < 0x80));
        assert_eq!(msg.to_bytes(), [0x99, 0x48, 0x7F]);

        let cc = MidiMessage::ControlChange {
            channel: 16,
            controller: 7,
            value: 100,
        };
        assert!(!cc.is_valid());
        assert!(MidiMessage::control_change(16, 7, 100).is_valid());
    }

    #[test]
    fn test_lane_ignores_velocity_and_direction() {
        let on = MidiMessage::note_on(9, 38, 120);
        let off = MidiMessage::note_off(9, 38);
        assert_eq!(on.lane(), off.lane());
        assert_ne!(on.lane(), MidiMessage::control_change(9, 38, 1).lane());
    }

    #[test]
    fn test_control_change_bytes() {
        let bytes = [0xB3, 64, 127];
        let msg = MidiMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg.to_bytes(), bytes);
        assert_eq!(msg.note(), None);
    }
}
