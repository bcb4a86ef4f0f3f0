pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;
pub mod project;
pub mod record;
pub mod timing;
pub mod transport;
pub mod ui;

pub use config::Settings;
pub use devices::{DeviceContext, MidiBackend, MidirBackend, MockBackend};
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine, spawn_engine_with_source};
pub use error::{Error, Result};
pub use events::{Event, Lane, MidiMessage, Tick};
pub use playback::{OutputRunner, OutputSink, PlaybackEngine, PlaybackState};
pub use project::Recording;
pub use record::{FinishedTake, InputHandle, PunchWindow, RecordEngine, RecordState};
pub use timing::{Clock, ClockReader, ConflictPolicy, EventBuffer, ManualSource, TickSource};
pub use transport::{TransportController, TransportState, TransportStatus};
pub use ui::DrumApp;
