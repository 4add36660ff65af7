//! Streamer-side service: capture → analyze → multicast
//!
//! Pulls captured PCM chunks off a channel, always runs them through the
//! amplitude analyzer, and pushes them unmodified onto the multicast stream
//! while streaming is resumed. Also answers discovery PINGs and accepts the
//! monitor's control connection (connect success is the whole handshake; the
//! held socket is what the monitor watches for liveness).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::analyzer::{AmplitudeAnalyzer, AnalyzerEvent};
use crate::config::NetworkConfig;
use crate::discovery::{respond_loop, DiscoverySocket};
use crate::error::Result;
use crate::transport::StreamPublisher;

/// Idle pause for the frame pump when the capture channel is empty
const PUMP_IDLE: Duration = Duration::from_micros(500);

/// Change notifications for the service's own flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerEvent {
    StreamingChanged(bool),
    CaptureChanged(bool),
}

/// One streamer's capture/analysis/streaming loop plus its discovery and
/// control endpoints
pub struct StreamerService {
    analyzer: Arc<Mutex<AmplitudeAnalyzer>>,
    streaming: Arc<AtomicBool>,
    capturing: Arc<AtomicBool>,
    observers: Mutex<Vec<crossbeam_channel::Sender<StreamerEvent>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamerService {
    /// Bind the streamer's sockets and start its background tasks.
    /// `frames` delivers raw u8 PCM chunks from the capture source.
    pub async fn start(config: NetworkConfig, frames: Receiver<Vec<u8>>) -> Result<Self> {
        let analyzer = Arc::new(Mutex::new(AmplitudeAnalyzer::new()));
        let streaming = Arc::new(AtomicBool::new(false));
        let capturing = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::new();

        // Discovery responder on the well-known port
        let responder = DiscoverySocket::bind(config.discovery_port).await?;
        tasks.push(tokio::spawn(respond_loop(responder)));

        // Control endpoint: accepting the TCP connect completes the
        // monitor's handshake; we hold each socket until the peer drops it
        let listener = TcpListener::bind(("0.0.0.0", config.discovery_port))
            .await
            .map_err(crate::error::Error::Io)?;
        tasks.push(tokio::spawn(accept_loop(listener)));

        // Frame pump
        let publisher = StreamPublisher::connect(config.stream_target()).await?;
        tasks.push(tokio::spawn(pump_loop(
            frames,
            publisher,
            analyzer.clone(),
            streaming.clone(),
            capturing.clone(),
        )));

        Ok(Self {
            analyzer,
            streaming,
            capturing,
            observers: Mutex::new(Vec::new()),
            tasks,
        })
    }

    /// Subscribe to streaming/capture flag changes
    pub fn subscribe_events(&self) -> crossbeam_channel::Receiver<StreamerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(tx);
        }
        rx
    }

    fn notify(&self, event: StreamerEvent) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|tx| tx.send(event).is_ok());
        }
    }

    /// Resume pushing captured audio onto the stream
    pub fn start_streaming(&self) {
        if !self.streaming.swap(true, Ordering::SeqCst) {
            self.notify(StreamerEvent::StreamingChanged(true));
        }
    }

    /// Suspend streaming. Analyzer state is untouched: the peak persists
    /// until the next analyzed window overwrites it.
    pub fn stop_streaming(&self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            self.notify(StreamerEvent::StreamingChanged(false));
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Resume analysis of captured audio
    pub fn start_capture(&self) {
        if !self.capturing.swap(true, Ordering::SeqCst) {
            self.notify(StreamerEvent::CaptureChanged(true));
        }
    }

    /// Suspend capture and reset the analyzer to its baseline
    pub fn stop_capture(&self) {
        if self.capturing.swap(false, Ordering::SeqCst) {
            self.notify(StreamerEvent::CaptureChanged(false));
        }
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.reset();
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Peak deviation of the most recent analysis window
    pub fn peak_value(&self) -> i32 {
        self.analyzer.lock().map(|a| a.peak_value()).unwrap_or(0)
    }

    /// Subscribe to analyzer events (peak changes, notify/alarm, config)
    pub fn subscribe_analyzer(&self) -> crossbeam_channel::Receiver<AnalyzerEvent> {
        match self.analyzer.lock() {
            Ok(mut analyzer) => analyzer.subscribe(),
            Err(_) => crossbeam_channel::never(),
        }
    }

    // Configuration surface; setters announce changes through the
    // analyzer's event channel and are applied between analysis calls
    pub fn set_notification_threshold(&self, threshold: i32) {
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.set_notification_threshold(threshold);
        }
    }

    pub fn set_alarm_threshold(&self, threshold: i32) {
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.set_alarm_threshold(threshold);
        }
    }

    pub fn set_alarm_trigger_period(&self, period: Duration) {
        if let Ok(mut analyzer) = self.analyzer.lock() {
            analyzer.set_alarm_trigger_period(period);
        }
    }

    /// Stop all background tasks
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for StreamerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                tracing::info!("Monitor connected from {}", peer);
                tokio::spawn(async move {
                    let mut buf = [0u8; 32];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    tracing::info!("Monitor {} disconnected", peer);
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn pump_loop(
    frames: Receiver<Vec<u8>>,
    publisher: StreamPublisher,
    analyzer: Arc<Mutex<AmplitudeAnalyzer>>,
    streaming: Arc<AtomicBool>,
    capturing: Arc<AtomicBool>,
) {
    loop {
        let mut idle = true;
        while let Ok(frame) = frames.try_recv() {
            idle = false;
            if !capturing.load(Ordering::Relaxed) {
                continue;
            }
            if let Ok(mut analyzer) = analyzer.lock() {
                analyzer.analyze(&frame);
            }
            if streaming.load(Ordering::Relaxed) {
                for chunk in frame.chunks(crate::constants::MAX_DATAGRAM_SIZE) {
                    if let Err(e) = publisher.send(chunk).await {
                        tracing::warn!("Stream send failed: {}", e);
                    }
                }
            }
        }
        if idle {
            tokio::time::sleep(PUMP_IDLE).await;
        }
    }
}
