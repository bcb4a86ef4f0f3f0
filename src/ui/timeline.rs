use crate::events::{Event, Lane, MidiMessage, Tick};
use crate::timing::TICKS_PER_QUARTER;
use eframe::egui;
use std::collections::BTreeMap;

const BEATS_PER_BAR: u64 = 4;

#[derive(Clone)]
pub struct TimelineState {
    pub lane_height: f32,
    pub beat_width: f32,
    pub pan_beats: f32,
    pub follow_playhead: bool,
}

impl Default for TimelineState {
    fn default() -> Self {
        Self {
            lane_height: 28.0,
            beat_width: 60.0,
            pan_beats: 0.0,
            follow_playhead: true,
        }
    }
}

/// A note drawn on the grid, from its NoteOn to its NoteOff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub lane: Lane,
    pub start: Tick,
    pub end: Option<Tick>,
    pub velocity: u8,
}

/// Note lanes present in `events`, ordered by channel and note.
pub fn lanes(events: &[Event]) -> Vec<Lane> {
    let mut lanes: Vec<Lane> = events
        .iter()
        .map(|event| event.message.lane())
        .filter(|lane| matches!(lane, Lane::Note { .. }))
        .collect();
    lanes.sort();
    lanes.dedup();
    lanes
}

pub fn hits(events: &[Event]) -> Vec<Hit> {
    let mut open: BTreeMap<Lane, usize> = BTreeMap::new();
    let mut hits = Vec::new();
    for event in events {
        let lane = event.message.lane();
        match event.message {
            MidiMessage::NoteOn { velocity, .. } => {
                if let Some(idx) = open.insert(lane, hits.len()) {
                    hits[idx] = Hit {
                        end: Some(event.tick),
                        ..hits[idx]
                    };
                }
                hits.push(Hit {
                    lane,
                    start: event.tick,
                    end: None,
                    velocity,
                });
            }
            MidiMessage::NoteOff { .. } => {
                if let Some(idx) = open.remove(&lane) {
                    hits[idx].end = Some(event.tick);
                }
            }
            MidiMessage::ControlChange { .. } => {}
        }
    }
    hits
}

/// General MIDI percussion name for drum-channel notes.
pub fn lane_label(lane: Lane) -> String {
    match lane {
        Lane::Note { channel: 9, note } => match note {
            35 | 36 => "Kick".to_string(),
            37 => "Side Stick".to_string(),
            38 | 40 => "Snare".to_string(),
            39 => "Clap".to_string(),
            41 | 43 => "Low Tom".to_string(),
            45 | 47 => "Mid Tom".to_string(),
            48 | 50 => "High Tom".to_string(),
            42 => "Closed HH".to_string(),
            44 => "Pedal HH".to_string(),
            46 => "Open HH".to_string(),
            49 | 57 => "Crash".to_string(),
            51 | 59 => "Ride".to_string(),
            _ => format!("Drum {}", note),
        },
        Lane::Note { channel, note } => format!("Ch{} {}", channel + 1, note),
        Lane::Controller {
            channel,
            controller,
        } => format!("Ch{} CC{}", channel + 1, controller),
    }
}

pub struct TimelineResponse {
    /// Set when the user clicked the ruler to move the playhead.
    pub seek: Option<Tick>,
}

pub struct DrumGrid<'a> {
    events: &'a [Event],
    position: Tick,
    state: &'a mut TimelineState,
}

impl<'a> DrumGrid<'a> {
    pub fn new(events: &'a [Event], position: Tick, state: &'a mut TimelineState) -> Self {
        Self {
            events,
            position,
            state,
        }
    }

    pub fn show(mut self, ui: &mut egui::Ui) -> TimelineResponse {
        let mut response = TimelineResponse { seek: None };

        let (rect_response, painter) =
            ui.allocate_painter(ui.available_size(), egui::Sense::click_and_drag());
        let rect = rect_response.rect;
        let label_width = 90.0;
        let ruler_height = 18.0;

        self.handle_input(ui);

        let visible_beats = (rect.width() - label_width) / self.state.beat_width;
        let playhead_beat = self.position as f32 / TICKS_PER_QUARTER as f32;
        if self.state.follow_playhead && playhead_beat > self.state.pan_beats + visible_beats * 0.9 {
            self.state.pan_beats = playhead_beat - visible_beats * 0.1;
        }

        painter.rect_filled(rect, 0.0, egui::Color32::from_rgb(30, 30, 30));

        let lanes = lanes(self.events);
        let grid_rect = egui::Rect::from_min_max(
            egui::Pos2::new(rect.left() + label_width, rect.top() + ruler_height),
            rect.max,
        );
        painter.rect_filled(grid_rect, 0.0, egui::Color32::from_rgb(40, 40, 40));

        self.draw_beats(&painter, rect, label_width, ruler_height, visible_beats);
        self.draw_lanes(&painter, rect, label_width, ruler_height, &lanes);
        self.draw_hits(&painter, grid_rect, label_width, ruler_height, &lanes);

        let x = self.tick_to_screen_x(self.position, rect, label_width);
        if x >= grid_rect.left() && x <= rect.right() {
            painter.line_segment(
                [egui::Pos2::new(x, rect.top()), egui::Pos2::new(x, rect.bottom())],
                egui::Stroke::new(2.0, egui::Color32::from_rgb(220, 60, 60)),
            );
        }

        if rect_response.clicked() {
            if let Some(pos) = rect_response.interact_pointer_pos() {
                if pos.x > rect.left() + label_width && pos.y < rect.top() + ruler_height {
                    response.seek = Some(self.screen_x_to_tick(pos.x, rect, label_width));
                }
            }
        }

        if lanes.is_empty() {
            painter.text(
                grid_rect.center(),
                egui::Align2::CENTER_CENTER,
                "Drum MIDI App\n(arm Record and play some pads)",
                egui::FontId::proportional(18.0),
                egui::Color32::from_rgb(85, 85, 85),
            );
        }

        response
    }

    fn handle_input(&mut self, ui: &egui::Ui) {
        let modifiers = ui.input(|i| i.modifiers);

        ui.input(|i| {
            let scroll_delta = i.smooth_scroll_delta;
            if scroll_delta == egui::Vec2::ZERO {
                return;
            }
            if modifiers.alt {
                let zoom_factor = 1.0 + scroll_delta.y * 0.01;
                self.state.beat_width = (self.state.beat_width * zoom_factor).clamp(10.0, 400.0);
            } else {
                let delta = if scroll_delta.x != 0.0 {
                    scroll_delta.x
                } else {
                    scroll_delta.y
                };
                self.state.pan_beats = (self.state.pan_beats - delta / self.state.beat_width).max(0.0);
                self.state.follow_playhead = false;
            }
        });
    }

    fn draw_beats(
        &self,
        painter: &egui::Painter,
        rect: egui::Rect,
        label_width: f32,
        ruler_height: f32,
        visible_beats: f32,
    ) {
        let first = self.state.pan_beats.floor().max(0.0) as u64;
        let last = (self.state.pan_beats + visible_beats).ceil() as u64;

        for beat in first..=last {
            let x = self.tick_to_screen_x(beat * TICKS_PER_QUARTER, rect, label_width);
            if x < rect.left() + label_width || x > rect.right() {
                continue;
            }

            let is_bar_line = beat % BEATS_PER_BAR == 0;
            let (width, color) = if is_bar_line {
                (2.0, egui::Color32::from_rgb(100, 100, 100))
            } else {
                (1.0, egui::Color32::from_rgb(60, 60, 60))
            };
            painter.line_segment(
                [
                    egui::Pos2::new(x, rect.top() + ruler_height),
                    egui::Pos2::new(x, rect.bottom()),
                ],
                egui::Stroke::new(width, color),
            );

            if is_bar_line {
                painter.text(
                    egui::Pos2::new(x + 4.0, rect.top() + 2.0),
                    egui::Align2::LEFT_TOP,
                    format!("{}", beat / BEATS_PER_BAR + 1),
                    egui::FontId::proportional(11.0),
                    egui::Color32::LIGHT_GRAY,
                );
            }
        }
    }

    fn draw_lanes(
        &self,
        painter: &egui::Painter,
        rect: egui::Rect,
        label_width: f32,
        ruler_height: f32,
        lanes: &[Lane],
    ) {
        for (row, lane) in lanes.iter().enumerate() {
            let y = rect.top() + ruler_height + row as f32 * self.state.lane_height;
            if y > rect.bottom() {
                break;
            }
            let label_rect = egui::Rect::from_min_size(
                egui::Pos2::new(rect.left(), y),
                egui::Vec2::new(label_width, self.state.lane_height),
            );
            painter.rect_filled(label_rect, 0.0, egui::Color32::from_rgb(55, 55, 55));
            painter.rect_stroke(
                label_rect,
                0.0,
                egui::Stroke::new(1.0, egui::Color32::from_rgb(80, 80, 80)),
                egui::StrokeKind::Inside,
            );
            painter.text(
                label_rect.left_center() + egui::Vec2::new(6.0, 0.0),
                egui::Align2::LEFT_CENTER,
                lane_label(*lane),
                egui::FontId::proportional(12.0),
                egui::Color32::WHITE,
            );
            painter.line_segment(
                [
                    egui::Pos2::new(rect.left() + label_width, y + self.state.lane_height),
                    egui::Pos2::new(rect.right(), y + self.state.lane_height),
                ],
                egui::Stroke::new(1.0, egui::Color32::from_rgb(60, 60, 60)),
            );
        }
    }

    fn draw_hits(
        &self,
        painter: &egui::Painter,
        grid_rect: egui::Rect,
        label_width: f32,
        ruler_height: f32,
        lanes: &[Lane],
    ) {
        let rect = egui::Rect::from_min_max(
            egui::Pos2::new(grid_rect.left() - label_width, grid_rect.top() - ruler_height),
            grid_rect.max,
        );
        for hit in hits(self.events) {
            let Some(row) = lanes.iter().position(|lane| *lane == hit.lane) else {
                continue;
            };
            let end = hit.end.unwrap_or(self.position.max(hit.start));
            let left = self.tick_to_screen_x(hit.start, rect, label_width);
            let right = self.tick_to_screen_x(end, rect, label_width).max(left + 4.0);
            if right < grid_rect.left() || left > grid_rect.right() {
                continue;
            }

            let top = grid_rect.top() + row as f32 * self.state.lane_height + 3.0;
            let hit_rect = egui::Rect::from_min_max(
                egui::Pos2::new(left.max(grid_rect.left()), top),
                egui::Pos2::new(right, top + self.state.lane_height - 6.0),
            );

            let velocity_factor = hit.velocity as f32 / 127.0;
            let color = egui::Color32::from_rgb(
                (200.0 + 55.0 * velocity_factor) as u8,
                (120.0 + 80.0 * velocity_factor) as u8,
                (40.0 + 40.0 * velocity_factor) as u8,
            );
            painter.rect_filled(hit_rect, 2.0, color);
        }
    }

    fn tick_to_screen_x(&self, tick: Tick, rect: egui::Rect, label_width: f32) -> f32 {
        let beats = tick as f32 / TICKS_PER_QUARTER as f32 - self.state.pan_beats;
        rect.left() + label_width + beats * self.state.beat_width
    }

    fn screen_x_to_tick(&self, x: f32, rect: egui::Rect, label_width: f32) -> Tick {
        let beats = self.state.pan_beats + (x - rect.left() - label_width) / self.state.beat_width;
        (beats.max(0.0) * TICKS_PER_QUARTER as f32) as Tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_pair_note_on_and_off() {
        let events = vec![
            Event::new(0, MidiMessage::note_on(9, 36, 100)),
            Event::new(0, MidiMessage::note_on(9, 42, 60)),
            Event::new(100, MidiMessage::note_off(9, 36)),
            Event::new(480, MidiMessage::note_on(9, 42, 70)),
            Event::new(500, MidiMessage::control_change(9, 4, 10)),
        ];
        let hits = hits(&events);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].end, Some(100));
        assert_eq!(hits[1].end, Some(480));
        assert_eq!(hits[2].end, None);

        assert_eq!(
            lanes(&events),
            vec![
                Lane::Note { channel: 9, note: 36 },
                Lane::Note { channel: 9, note: 42 }
            ]
        );
    }

    #[test]
    fn test_lane_labels() {
        assert_eq!(lane_label(Lane::Note { channel: 9, note: 36 }), "Kick");
        assert_eq!(lane_label(Lane::Note { channel: 9, note: 99 }), "Drum 99");
        assert_eq!(lane_label(Lane::Note { channel: 0, note: 60 }), "Ch1 60");
    }
}
