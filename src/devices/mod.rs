//! MIDI port enumeration and selection.
//!
//! [`MidiBackend`] hides the platform layer; [`MidirBackend`] talks to real
//! ports and [`MockBackend`] keeps everything in memory for tests and
//! headless runs. [`DeviceContext`] owns the open ports and is handed to the
//! transport explicitly.

mod mock;

pub use mock::MockBackend;

use crate::error::{Error, Result};
use crate::events::MidiMessage;
use crate::playback::{OutputSink, SharedSink, shared_sink};
use crate::record::InputHandle;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{error, info, warn};

pub trait MidiBackend: Send {
    fn list_inputs(&self) -> Result<Vec<String>>;
    fn list_outputs(&self) -> Result<Vec<String>>;
    /// Opens `name` and feeds every incoming message to `handle`.
    fn open_input(&mut self, name: &str, handle: InputHandle) -> Result<Box<dyn InputConnection>>;
    fn open_output(&mut self, name: &str) -> Result<Box<dyn OutputSink>>;
}

/// An open input port. Dropping it also closes the port.
pub trait InputConnection: Send {
    fn close(self: Box<Self>);
}

pub struct MidirBackend {
    client_name: String,
}

impl MidirBackend {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn input_client(&self) -> Result<MidiInput> {
        let mut input = MidiInput::new(&self.client_name)
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        input.ignore(Ignore::All);
        Ok(input)
    }

    fn output_client(&self) -> Result<MidiOutput> {
        MidiOutput::new(&self.client_name).map_err(|e| Error::DeviceUnavailable(e.to_string()))
    }
}

impl MidiBackend for MidirBackend {
    fn list_inputs(&self) -> Result<Vec<String>> {
        let input = self.input_client()?;
        Ok(input
            .ports()
            .iter()
            .filter_map(|port| input.port_name(port).ok())
            .collect())
    }

    fn list_outputs(&self) -> Result<Vec<String>> {
        let output = self.output_client()?;
        Ok(output
            .ports()
            .iter()
            .filter_map(|port| output.port_name(port).ok())
            .collect())
    }

    fn open_input(&mut self, name: &str, handle: InputHandle) -> Result<Box<dyn InputConnection>> {
        let input = self.input_client()?;
        let ports = input.ports();
        let port = ports
            .iter()
            .find(|port| input.port_name(port).is_ok_and(|port_name| port_name == name))
            .ok_or_else(|| Error::DeviceUnavailable(format!("no MIDI input named '{}'", name)))?;

        let connection = input
            .connect(
                port,
                "drum-midi-in",
                move |_stamp, bytes, _| {
                    handle.on_raw_message(bytes);
                },
                (),
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        Ok(Box::new(MidirInputConnection(connection)))
    }

    fn open_output(&mut self, name: &str) -> Result<Box<dyn OutputSink>> {
        let output = self.output_client()?;
        let ports = output.ports();
        let port = ports
            .iter()
            .find(|port| output.port_name(port).is_ok_and(|port_name| port_name == name))
            .ok_or_else(|| Error::DeviceUnavailable(format!("no MIDI output named '{}'", name)))?;

        let connection = output
            .connect(port, "drum-midi-out")
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        Ok(Box::new(MidirSink(connection)))
    }
}

struct MidirInputConnection(MidiInputConnection<()>);

impl InputConnection for MidirInputConnection {
    fn close(self: Box<Self>) {
        self.0.close();
    }
}

struct MidirSink(MidiOutputConnection);

impl OutputSink for MidirSink {
    fn send(&mut self, message: &MidiMessage) -> Result<()> {
        self.0
            .send(&message.to_bytes())
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))
    }
}

struct OpenInput {
    name: String,
    connection: Box<dyn InputConnection>,
}

/// Owns the selected ports. The output port lives in a [`SharedSink`] so the
/// playback thread can reach it without going through the context.
pub struct DeviceContext {
    backend: Box<dyn MidiBackend>,
    input: Option<OpenInput>,
    output_name: Option<String>,
    output: SharedSink,
}

impl DeviceContext {
    pub fn new(backend: Box<dyn MidiBackend>) -> Self {
        Self {
            backend,
            input: None,
            output_name: None,
            output: shared_sink(),
        }
    }

    pub fn list_inputs(&self) -> Vec<String> {
        self.backend.list_inputs().unwrap_or_else(|e| {
            error!("Error listing MIDI input ports: {}", e);
            Vec::new()
        })
    }

    pub fn list_outputs(&self) -> Vec<String> {
        self.backend.list_outputs().unwrap_or_else(|e| {
            error!("Error listing MIDI output ports: {}", e);
            Vec::new()
        })
    }

    /// Closes the current input and opens `name`. An empty name only closes.
    pub fn select_input(&mut self, name: &str, handle: InputHandle) -> Result<()> {
        if let Some(open) = self.input.take() {
            open.connection.close();
            info!(device = %open.name, "closed MIDI input");
        }
        if name.is_empty() {
            return Ok(());
        }

        match self.backend.open_input(name, handle) {
            Ok(connection) => {
                self.input = Some(OpenInput {
                    name: name.to_string(),
                    connection,
                });
                info!(device = name, "opened MIDI input");
                Ok(())
            }
            Err(e) => {
                warn!(device = name, "error opening MIDI input: {}", e);
                Err(e)
            }
        }
    }

    /// Closes the current output and opens `name`. An empty name only closes.
    pub fn select_output(&mut self, name: &str) -> Result<()> {
        if let Some(previous) = self.output_name.take() {
            self.output.lock().take();
            info!(device = %previous, "closed MIDI output");
        }
        if name.is_empty() {
            return Ok(());
        }

        match self.backend.open_output(name) {
            Ok(sink) => {
                *self.output.lock() = Some(sink);
                self.output_name = Some(name.to_string());
                info!(device = name, "opened MIDI output");
                Ok(())
            }
            Err(e) => {
                warn!(device = name, "error opening MIDI output: {}", e);
                Err(e)
            }
        }
    }

    pub fn current_input(&self) -> Option<&str> {
        self.input.as_ref().map(|open| open.name.as_str())
    }

    pub fn current_output(&self) -> Option<&str> {
        self.output_name.as_deref()
    }

    pub fn output_sink(&self) -> SharedSink {
        self.output.clone()
    }

    pub fn send_message(&self, message: &MidiMessage) -> Result<()> {
        match self.output.lock().as_mut() {
            Some(sink) => sink.send(message),
            None => Err(Error::DeviceUnavailable("no MIDI output selected".into())),
        }
    }

    /// A single hit on channel 0, note 60.
    pub fn send_test_note(&self) -> Result<()> {
        self.send_message(&MidiMessage::note_on(0, 60, 100))?;
        info!("sent test note 60");
        Ok(())
    }

    pub fn close_all(&mut self) {
        if let Some(open) = self.input.take() {
            open.connection.close();
        }
        self.output.lock().take();
        self.output_name = None;
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordEngine;
    use crate::timing::{Clock, ManualSource};

    fn context() -> (MockBackend, DeviceContext) {
        let backend = MockBackend::new(
            vec!["Pads".into()],
            vec!["Drum Module".into(), "Synth".into()],
            ManualSource::new(),
        );
        let context = DeviceContext::new(Box::new(backend.clone()));
        (backend, context)
    }

    #[test]
    fn test_select_output_and_send_test_note() {
        let (backend, mut devices) = context();
        assert_eq!(devices.list_outputs(), vec!["Drum Module", "Synth"]);

        devices.select_output("Drum Module").unwrap();
        assert_eq!(devices.current_output(), Some("Drum Module"));
        devices.send_test_note().unwrap();

        let sent: Vec<MidiMessage> = backend.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(sent, vec![MidiMessage::note_on(0, 60, 100)]);
    }

    #[test]
    fn test_empty_name_only_closes() {
        let (_backend, mut devices) = context();
        devices.select_output("Synth").unwrap();
        devices.select_output("").unwrap();
        assert_eq!(devices.current_output(), None);
        assert!(matches!(
            devices.send_test_note(),
            Err(Error::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_unknown_device_stays_unselected() {
        let (_backend, mut devices) = context();
        devices.select_output("Synth").unwrap();
        let result = devices.select_output("Missing");
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
        assert_eq!(devices.current_output(), None);
    }

    #[test]
    fn test_input_reaches_record_queue() {
        let (backend, mut devices) = context();
        let clock = Clock::new(ManualSource::new(), 120.0);
        let recorder = RecordEngine::new(16, clock.reader());

        devices.select_input("Pads", recorder.input_handle()).unwrap();
        assert_eq!(devices.current_input(), Some("Pads"));
        backend.play(&[0x99, 38, 90]);
        assert_eq!(recorder.stats().queued, 1);

        devices.close_all();
        backend.play(&[0x99, 38, 90]);
        assert_eq!(recorder.stats().received, 1);
    }

    #[test]
    fn test_unplugged_device_fails_without_panicking() {
        let (backend, mut devices) = context();
        devices.select_output("Synth").unwrap();
        backend.unplug();
        assert!(devices.send_test_note().is_err());
        assert!(devices.list_inputs().is_empty());
    }
}
