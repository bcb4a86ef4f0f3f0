use drum_midi::{DrumApp, MidirBackend, Settings, spawn_engine};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drum_midi=info")),
        )
        .init();

    let settings_path = Settings::default_path();
    let settings = Settings::load_or_default(&settings_path);
    let tempo = settings.tempo_bpm;
    let backend = MidirBackend::new(settings.client_name.clone());
    let engine = spawn_engine(settings, Some(settings_path), Box::new(backend));

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_title("Drum MIDI App"),
        ..Default::default()
    };

    if let Err(e) = eframe::run_native(
        "Drum MIDI App",
        options,
        Box::new(move |_cc| Ok(Box::new(DrumApp::new(engine, tempo)))),
    ) {
        tracing::error!("UI exited with error: {}", e);
    }
}
