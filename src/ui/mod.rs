mod timeline;

use crate::events::Event;
use crate::transport::{TransportState, TransportStatus};
use crate::{EngineCommand, EngineHandle, EngineUpdate};
use eframe::egui;
use timeline::{DrumGrid, TimelineState};

const PLACEHOLDER: &str = "Drum MIDI App\n(Timeline / Drum Grid will go here)";

pub struct DrumApp {
    engine: Option<EngineHandle>,
    status: Option<TransportStatus>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    selected_input: Option<String>,
    selected_output: Option<String>,
    song: Vec<Event>,
    tempo: f64,
    message: String,
    error_message: Option<String>,
    timeline: TimelineState,
}

impl DrumApp {
    pub fn new(engine: EngineHandle, tempo: f64) -> Self {
        Self {
            engine: Some(engine),
            status: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            selected_input: None,
            selected_output: None,
            song: Vec::new(),
            tempo,
            message: PLACEHOLDER.to_string(),
            error_message: None,
            timeline: TimelineState::default(),
        }
    }

    fn send(&self, command: EngineCommand) {
        if let Some(engine) = &self.engine {
            let _ = engine.command_tx.send(command);
        }
    }

    fn process_engine_updates(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };
        while let Ok(update) = engine.update_rx.try_recv() {
            match update {
                EngineUpdate::Devices { inputs, outputs } => {
                    self.inputs = inputs;
                    self.outputs = outputs;
                }
                EngineUpdate::Status(status) => {
                    let previous = self.status.as_ref().map(|s| s.target_bpm);
                    if previous != Some(status.target_bpm) {
                        self.tempo = status.target_bpm;
                    }
                    self.status = Some(status);
                }
                EngineUpdate::InputSelected(name) => self.selected_input = name,
                EngineUpdate::OutputSelected(name) => self.selected_output = name,
                EngineUpdate::RecordingFinished { recorded, rejected } => {
                    self.message = if rejected > 0 {
                        format!("Recorded {} events ({} overlapping dropped)", recorded, rejected)
                    } else {
                        format!("Recorded {} events", recorded)
                    };
                }
                EngineUpdate::Song(events) => self.song = events,
                EngineUpdate::Error { message } => self.error_message = Some(message),
                EngineUpdate::Info { message } => self.message = message,
            }
        }
    }

    fn state(&self) -> TransportState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    fn recording(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.state == TransportState::Recording || s.paused_from == Some(TransportState::Recording)
        })
    }

    fn menu_bar(&mut self, ui: &mut egui::Ui) {
        egui::MenuBar::new().ui(ui, |ui| {
            ui.menu_button("File", |ui| {
                let stopped = self.state() == TransportState::Stopped;

                if ui.add_enabled(stopped, egui::Button::new("New Recording")).clicked() {
                    self.send(EngineCommand::ClearRecording);
                    ui.close();
                }

                if ui.add_enabled(stopped, egui::Button::new("Open Recording...")).clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .set_title("Open Recording")
                        .add_filter("Recording", &["ron"])
                        .pick_file()
                    {
                        self.send(EngineCommand::LoadRecording(path));
                    }
                    ui.close();
                }

                if ui.button("💾 Save Recording...").clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .set_title("Save Recording")
                        .add_filter("Recording", &["ron"])
                        .set_file_name("recording.ron")
                        .save_file()
                    {
                        self.send(EngineCommand::SaveRecording(path));
                    }
                    ui.close();
                }

                ui.separator();

                if ui.button("Quit").clicked() {
                    ui.ctx().send_viewport_cmd(egui::ViewportCommand::Close);
                }
            });
        });
    }

    fn transport_controls(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let state = self.state();

            if ui.button("▶ Play").clicked() {
                self.send(EngineCommand::Play);
            }
            if ui.button("⏹ Stop").clicked() {
                self.send(EngineCommand::Stop);
            }

            let mut recording = self.recording();
            if ui.toggle_value(&mut recording, "⏺ Record").changed() {
                self.send(if recording {
                    EngineCommand::Record
                } else {
                    EngineCommand::Stop
                });
            }

            if state == TransportState::Paused {
                if ui.button("⏵ Resume").clicked() {
                    self.send(EngineCommand::Resume);
                }
            } else if ui
                .add_enabled(
                    matches!(state, TransportState::Playing | TransportState::Recording),
                    egui::Button::new("⏸ Pause"),
                )
                .clicked()
            {
                self.send(EngineCommand::Pause);
            }

            ui.label("BPM");
            let tempo = ui.add(egui::DragValue::new(&mut self.tempo).range(20.0..=400.0).speed(0.5));
            if tempo.drag_stopped() || tempo.lost_focus() {
                self.send(EngineCommand::SetTempo(self.tempo));
            }

            ui.separator();
            self.device_controls(ui);
        });
    }

    fn device_controls(&mut self, ui: &mut egui::Ui) {
        ui.label("Out:");
        let mut chosen_output = None;
        ui.add_enabled_ui(!self.outputs.is_empty(), |ui| {
            let text = match (&self.selected_output, self.outputs.is_empty()) {
                (_, true) => "No MIDI outputs",
                (Some(name), false) => name.as_str(),
                (None, false) => "Select MIDI Output",
            };
            egui::ComboBox::from_id_salt("midi_output")
                .width(200.0)
                .selected_text(text)
                .show_ui(ui, |ui| {
                    for name in &self.outputs {
                        let selected = self.selected_output.as_ref() == Some(name);
                        if ui.selectable_label(selected, name).clicked() && !selected {
                            chosen_output = Some(name.clone());
                        }
                    }
                });
        });
        if let Some(name) = chosen_output {
            self.send(EngineCommand::SelectOutput(name));
        }

        ui.label("In:");
        let mut chosen_input = None;
        ui.add_enabled_ui(!self.inputs.is_empty(), |ui| {
            let text = match (&self.selected_input, self.inputs.is_empty()) {
                (_, true) => "No MIDI inputs",
                (Some(name), false) => name.as_str(),
                (None, false) => "Select MIDI Input",
            };
            egui::ComboBox::from_id_salt("midi_input")
                .width(200.0)
                .selected_text(text)
                .show_ui(ui, |ui| {
                    for name in &self.inputs {
                        let selected = self.selected_input.as_ref() == Some(name);
                        if ui.selectable_label(selected, name).clicked() && !selected {
                            chosen_input = Some(name.clone());
                        }
                    }
                });
        });
        if let Some(name) = chosen_input {
            self.send(EngineCommand::SelectInput(name));
        }

        if ui
            .add_enabled(self.selected_output.is_some(), egui::Button::new("Test Note"))
            .clicked()
        {
            self.send(EngineCommand::SendTestNote);
        }
        if ui.button("Refresh MIDI").clicked() {
            self.send(EngineCommand::RefreshDevices);
        }
    }

    fn status_line(&self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            match &self.status {
                Some(status) => {
                    let beats = status.position as f64 / crate::timing::TICKS_PER_QUARTER as f64;
                    ui.label(format!(
                        "{} | bar {} beat {:.2} | {:.1} BPM | {} events",
                        status.state.as_str(),
                        (beats / 4.0).floor() as u64 + 1,
                        beats % 4.0 + 1.0,
                        status.bpm,
                        status.song_events + status.take_events,
                    ));
                    if status.input.dropped > 0 {
                        ui.colored_label(
                            egui::Color32::YELLOW,
                            format!("{} input events dropped", status.input.dropped),
                        );
                    }
                }
                None => {
                    ui.label("starting engine...");
                }
            }
            ui.separator();
            ui.label(&self.message);
        });
    }
}

impl eframe::App for DrumApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.process_engine_updates();

        egui::TopBottomPanel::top("menu_bar").show(ctx, |ui| {
            self.menu_bar(ui);
        });

        egui::TopBottomPanel::top("transport").show(ctx, |ui| {
            self.transport_controls(ui);
        });

        if let Some(error) = self.error_message.clone() {
            egui::TopBottomPanel::top("error").show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.colored_label(egui::Color32::RED, &error);
                    if ui.small_button("✕").clicked() {
                        self.error_message = None;
                    }
                });
            });
        }

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            self.status_line(ui);
        });

        let position = self.status.as_ref().map_or(0, |s| s.position);
        egui::CentralPanel::default().show(ctx, |ui| {
            let response = DrumGrid::new(&self.song, position, &mut self.timeline).show(ui);
            if let Some(tick) = response.seek {
                self.timeline.follow_playhead = true;
                self.send(EngineCommand::Seek(tick));
            }
        });

        ctx.request_repaint();
    }
}

impl Drop for DrumApp {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
    }
}
