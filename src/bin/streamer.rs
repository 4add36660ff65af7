//! Streamer Application
//!
//! Captures nursery audio, classifies loudness and multicasts the raw PCM
//! stream while answering monitor discovery requests.

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use babymon::{
    analyzer::AnalyzerEvent,
    audio::CaptureSource,
    config::AppConfig,
    streamer::StreamerService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting baby monitor streamer");

    let config = AppConfig::load_or_default();
    tracing::info!(
        "Discovery on port {}, streaming to {}",
        config.network.discovery_port,
        config.network.stream_target()
    );

    let capture = CaptureSource::start()?;
    let service = StreamerService::start(config.network.clone(), capture.frames()).await?;

    service.set_notification_threshold(config.analyzer.notification_threshold);
    service.set_alarm_threshold(config.analyzer.alarm_threshold);
    service.set_alarm_trigger_period(config.analyzer.alarm_trigger_period);
    service.start_streaming();

    let events = service.subscribe_analyzer();
    tracing::info!("Streaming started - press Ctrl+C to stop");

    loop {
        while let Ok(event) = events.try_recv() {
            match event {
                AnalyzerEvent::PeakChanged(peak) => tracing::debug!("Peak: {}", peak),
                AnalyzerEvent::NotifyTriggered => tracing::info!("Noise above notification level"),
                AnalyzerEvent::AlarmTriggered => tracing::warn!("ALARM: sustained loud noise"),
                AnalyzerEvent::ConfigChanged(field) => {
                    tracing::info!("Configuration changed: {:?}", field)
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
