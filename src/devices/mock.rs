use super::{InputConnection, MidiBackend};
use crate::error::{Error, Result};
use crate::events::MidiMessage;
use crate::playback::OutputSink;
use crate::record::InputHandle;
use crate::timing::TickSource;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct Listener {
    id: u64,
    handle: InputHandle,
}

struct MockShared {
    inputs: Vec<String>,
    outputs: Vec<String>,
    source: Arc<dyn TickSource>,
    connected: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
    sent: Mutex<Vec<(u64, MidiMessage)>>,
}

/// In-memory backend. Messages sent to any of its outputs are recorded with
/// the source time they arrived at; [`MockBackend::play`] plays bytes into
/// every open input.
#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<MockShared>,
}

impl MockBackend {
    pub fn new(inputs: Vec<String>, outputs: Vec<String>, source: Arc<dyn TickSource>) -> Self {
        Self {
            shared: Arc::new(MockShared {
                inputs,
                outputs,
                source,
                connected: AtomicBool::new(true),
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Delivers raw bytes to every open input, as a device callback would.
    pub fn play(&self, bytes: &[u8]) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        for listener in self.shared.listeners.lock().iter() {
            listener.handle.on_raw_message(bytes);
        }
    }

    /// Everything sent so far, stamped with source microseconds.
    pub fn sent(&self) -> Vec<(u64, MidiMessage)> {
        self.shared.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.shared.sent.lock().clear();
    }

    pub fn unplug(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    pub fn plug(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
    }

    fn check_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable("mock device unplugged".into()))
        }
    }
}

impl MidiBackend for MockBackend {
    fn list_inputs(&self) -> Result<Vec<String>> {
        self.check_connected()?;
        Ok(self.shared.inputs.clone())
    }

    fn list_outputs(&self) -> Result<Vec<String>> {
        self.check_connected()?;
        Ok(self.shared.outputs.clone())
    }

    fn open_input(&mut self, name: &str, handle: InputHandle) -> Result<Box<dyn InputConnection>> {
        self.check_connected()?;
        if !self.shared.inputs.iter().any(|input| input == name) {
            return Err(Error::DeviceUnavailable(format!("no MIDI input named '{}'", name)));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.lock().push(Listener { id, handle });
        Ok(Box::new(MockInput {
            shared: self.shared.clone(),
            id,
        }))
    }

    fn open_output(&mut self, name: &str) -> Result<Box<dyn OutputSink>> {
        self.check_connected()?;
        if !self.shared.outputs.iter().any(|output| output == name) {
            return Err(Error::DeviceUnavailable(format!("no MIDI output named '{}'", name)));
        }
        Ok(Box::new(MockOutput {
            shared: self.shared.clone(),
        }))
    }
}

struct MockInput {
    shared: Arc<MockShared>,
    id: u64,
}

impl InputConnection for MockInput {
    fn close(self: Box<Self>) {}
}

impl Drop for MockInput {
    fn drop(&mut self) {
        self.shared.listeners.lock().retain(|listener| listener.id != self.id);
    }
}

struct MockOutput {
    shared: Arc<MockShared>,
}

impl OutputSink for MockOutput {
    fn send(&mut self, message: &MidiMessage) -> Result<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("mock device unplugged".into()));
        }
        let micros = self.shared.source.micros();
        self.shared.sent.lock().push((micros, *message));
        Ok(())
    }
}
