use crate::error::Result;
use crate::timing::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_ENV: &str = "DRUM_MIDI_CONFIG";
pub const CONFIG_FILE: &str = "drum-midi.ron";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tempo_bpm: f64,
    pub lookahead_ms: f64,
    pub input_queue_capacity: usize,
    pub output_queue_capacity: usize,
    pub schedule_interval_ms: u64,
    pub output_poll_micros: u64,
    pub conflict_policy: ConflictPolicy,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub client_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tempo_bpm: 120.0,
            lookahead_ms: 10.0,
            input_queue_capacity: 1024,
            output_queue_capacity: 1024,
            schedule_interval_ms: 1,
            output_poll_micros: 250,
            conflict_policy: ConflictPolicy::RejectOverlap,
            input_device: None,
            output_device: None,
            client_name: "Drum MIDI App".to_string(),
        }
    }
}

impl Settings {
    /// `$DRUM_MIDI_CONFIG`, or `drum-midi.ron` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        let settings: Settings = ron::from_str(&ron_string)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    /// Never fails: a missing or unreadable file yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), "ignoring settings file: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = ron::from_str("(tempo_bpm: 95.0, conflict_policy: Layer)").unwrap();
        assert_eq!(settings.tempo_bpm, 95.0);
        assert_eq!(settings.conflict_policy, ConflictPolicy::Layer);
        assert_eq!(settings.lookahead_ms, 10.0);
        assert_eq!(settings.output_device, None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let settings = Settings {
            output_device: Some("Drum Module".into()),
            tempo_bpm: 140.0,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "(tempo_bpm: \"fast\"").unwrap();
        assert_eq!(Settings::load_or_default(&path), Settings::default());
        assert_eq!(
            Settings::load_or_default(&dir.path().join("missing.ron")),
            Settings::default()
        );
    }
}
