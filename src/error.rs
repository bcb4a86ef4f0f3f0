use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MIDI device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error("input queue overflow, {dropped} events dropped")]
    QueueOverflow { dropped: u64 },

    #[error("tempo {0} BPM is out of range")]
    InvalidTempo(f64),

    #[error("unsupported recording version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid recording: {0}")]
    InvalidRecording(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RON error: {0}")]
    RonSerialize(#[from] ron::Error),

    #[error("RON parse error: {0}")]
    RonParse(#[from] ron::error::SpannedError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_state(action: &'static str, state: &'static str) -> Self {
        Error::InvalidState { action, state }
    }
}
