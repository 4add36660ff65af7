//! Monitor Application
//!
//! Discovers a streamer on the local network, runs the session state machine
//! and plays the received audio stream back.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use babymon::{
    audio::{ChannelSink, CpalPlayback, PlaybackSink},
    config::AppConfig,
    session::driver::SessionDriver,
    session::SessionState,
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

    tracing::info!("Starting baby monitor");

    let config = AppConfig::load_or_default();

    // Fall back to a headless sink when no output device is available
    let sink: Box<dyn PlaybackSink + Send> = match CpalPlayback::start(16000) {
        Ok(playback) => Box::new(playback),
        Err(e) => {
            tracing::warn!("No audio output ({}), running headless", e);
            let (sink, rx) = ChannelSink::new();
            std::thread::spawn(move || for _ in rx {});
            Box::new(sink)
        }
    };

    let mut driver = SessionDriver::new(config.network.clone(), sink).await?;
    let changes = driver.subscribe();
    let stop = driver.stop_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            stop.stop();
        }
    });

    tokio::task::spawn_blocking(move || {
        for change in changes {
            tracing::info!("Session: {:?} -> {:?}", change.from, change.to);
        }
    });

    driver.run().await?;

    if driver.state() == SessionState::Disconnected {
        tracing::info!("Session ended; start the monitor again to reconnect");
    }
    Ok(())
}
