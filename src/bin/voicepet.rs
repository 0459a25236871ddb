//! Voicepet host runner
//!
//! Runs the firmware core against the default host audio devices and an
//! in-process loopback protocol, so a spoken turn is echoed back through
//! the full encode/decode pipeline.

use anyhow::Result;
use std::io::BufRead;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicepet::{
    app::{ActionState, Application, Collaborators, MotionDriver},
    audio::CpalDriver,
    config::AppConfig,
    display::ConsoleDisplay,
    ota::DisabledOta,
    protocol::LoopbackProtocol,
};

/// Motion driver that only narrates; host machines have no servos
struct LoggingMotion;

impl MotionDriver for LoggingMotion {
    fn perform(&self, action: ActionState) {
        tracing::info!(%action, "motion");
    }

    fn halt(&self) {
        tracing::info!("motion halted");
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voicepet");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let app = Application::new(
        &config,
        Collaborators {
            driver: Box::new(CpalDriver::new(config.audio.device_sample_rate)),
            protocol: Arc::new(LoopbackProtocol::new(config.audio.network_sample_rate)),
            display: Arc::new(ConsoleDisplay),
            ota: Arc::new(DisabledOta),
            motion: Arc::new(LoggingMotion),
            wake_word: None,
        },
    )?;
    app.start()?;

    println!("commands: t = toggle chat, w = wave, s = sit, q = quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line?.trim() {
            "t" => app.toggle_chat_state(),
            "w" => app.set_action_state(ActionState::Wave),
            "s" => app.set_action_state(ActionState::SitDown),
            "q" => break,
            "" => {}
            other => println!("unknown command: {}", other),
        }
    }

    app.stop();
    Ok(())
}
