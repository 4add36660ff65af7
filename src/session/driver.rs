//! Async driver for the session state machine
//!
//! Owns the monitor's sockets and timers and pumps the three event sources
//! the machine reacts to: discovery datagrams, control-channel liveness and
//! timer expirations, plus the audio stream itself. Received payloads are
//! run through a local amplitude analyzer so the Listening/Notification/
//! Alarm sub-states can be derived from the stream alone.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::analyzer::{AmplitudeAnalyzer, AnalyzerEvent};
use crate::audio::PlaybackSink;
use crate::config::NetworkConfig;
use crate::discovery::{is_pong, DiscoverySocket};
use crate::error::{Result, TransportError};
use crate::session::{Action, Session, SessionEvent, SessionState, StateChanged};
use crate::transport::{ControlChannel, StreamSubscriber};

/// Pause between reconnect attempts while the connection timer runs
const RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of one spawned handshake attempt, tagged with its attempt number
/// so superseded attempts can be dropped
type ConnectOutcome = (u64, std::result::Result<ControlChannel, TransportError>);

/// Handle for requesting an explicit session stop
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(());
    }
}

/// Event loop wrapper around [`Session`]
pub struct SessionDriver {
    session: Session,
    config: NetworkConfig,
    discovery: DiscoverySocket,
    subscriber: StreamSubscriber,
    control: Option<ControlChannel>,
    analyzer: AmplitudeAnalyzer,
    sink: Box<dyn PlaybackSink + Send>,
    connect_deadline: Option<(Instant, u64)>,
    quiet_deadline: Option<(Instant, u64)>,
    /// Number of the latest handshake attempt; outcomes from older attempts
    /// are stale
    connect_attempt: u64,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    stop_rx: mpsc::UnboundedReceiver<()>,
    stop_tx: mpsc::UnboundedSender<()>,
}

impl SessionDriver {
    /// Bind the session's sockets. The stream subscriber joins the multicast
    /// group from the config (or stays unicast when none is set, which tests
    /// use).
    pub async fn new(config: NetworkConfig, sink: Box<dyn PlaybackSink + Send>) -> Result<Self> {
        let discovery = DiscoverySocket::bind(0).await?;
        let subscriber = StreamSubscriber::bind(config.stream_port, config.multicast_group).await?;
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Ok(Self {
            session: Session::new(),
            config,
            discovery,
            subscriber,
            control: None,
            analyzer: AmplitudeAnalyzer::new(),
            sink,
            connect_deadline: None,
            quiet_deadline: None,
            connect_attempt: 0,
            connect_tx,
            connect_rx,
            stop_rx,
            stop_tx,
        })
    }

    /// Subscribe to state-change notifications (observable surface)
    pub fn subscribe(&mut self) -> crossbeam_channel::Receiver<StateChanged> {
        self.session.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Handle usable from other tasks to stop the session
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Run the session to its terminal state
    pub async fn run(&mut self) -> Result<()> {
        self.dispatch(SessionEvent::Start).await;

        while self.session.state() != SessionState::Disconnected {
            let event = self.next_event().await;
            self.dispatch(event).await;
        }
        tracing::info!("Session reached Disconnected, driver exiting");
        Ok(())
    }

    /// Wait for the next event from any source, in arrival order
    async fn next_event(&mut self) -> SessionEvent {
        // Wakeups are collected first and turned into session events after
        // the select block, once the arm futures have released their borrows
        enum Wake {
            ConnectTimer,
            QuietTimer,
            ControlClosed(TransportError),
            ConnectDone(Option<ConnectOutcome>),
            Discovery(std::result::Result<(Vec<u8>, std::net::SocketAddr), crate::error::DiscoveryError>),
            Stream(std::result::Result<(bytes::Bytes, std::net::SocketAddr), TransportError>),
            Stop,
        }

        loop {
            let wake = {
                let connect_deadline = self.connect_deadline;
                let quiet_deadline = self.quiet_deadline;
                let connect_timer = async move {
                    match connect_deadline {
                        Some((at, _)) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                let quiet_timer = async move {
                    match quiet_deadline {
                        Some((at, _)) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                let control = &mut self.control;
                let control_closed = async move {
                    match control.as_mut() {
                        Some(channel) => channel.closed().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = connect_timer => Wake::ConnectTimer,
                    _ = quiet_timer => Wake::QuietTimer,
                    closed = control_closed => Wake::ControlClosed(closed),
                    outcome = self.connect_rx.recv() => Wake::ConnectDone(outcome),
                    received = self.discovery.recv() => Wake::Discovery(received),
                    received = self.subscriber.recv() => Wake::Stream(received),
                    _ = self.stop_rx.recv() => Wake::Stop,
                }
            };

            match wake {
                Wake::ConnectTimer => {
                    if let Some((_, epoch)) = self.connect_deadline.take() {
                        return SessionEvent::ConnectTimerFired { epoch };
                    }
                }
                Wake::QuietTimer => {
                    if let Some((_, epoch)) = self.quiet_deadline.take() {
                        return SessionEvent::QuietTimerFired { epoch };
                    }
                }
                Wake::ControlClosed(closed) => {
                    tracing::warn!("Control channel lost: {}", closed);
                    self.control = None;
                    return SessionEvent::TransportError;
                }
                Wake::ConnectDone(Some((attempt, outcome))) if attempt == self.connect_attempt => {
                    match outcome {
                        Ok(channel) => {
                            self.control = Some(channel);
                            return SessionEvent::HandshakeComplete;
                        }
                        Err(e) => {
                            tracing::warn!("Handshake failed: {}", e);
                            return SessionEvent::TransportError;
                        }
                    }
                }
                Wake::ConnectDone(_) => {
                    tracing::debug!("Dropping outcome of a superseded handshake attempt");
                }
                Wake::Discovery(Ok((datagram, from))) => {
                    if is_pong(&datagram) {
                        return SessionEvent::PongReceived(from);
                    }
                    // Protocol noise, discarded without transitioning
                    tracing::debug!("Ignoring {} unexpected bytes from {}", datagram.len(), from);
                }
                Wake::Discovery(Err(e)) => {
                    tracing::warn!("Discovery socket error: {}", e);
                    return SessionEvent::TransportError;
                }
                Wake::Stream(Ok((payload, _))) => return SessionEvent::AudioPayload(payload),
                Wake::Stream(Err(e)) => {
                    tracing::warn!("Stream socket error: {}", e);
                    return SessionEvent::TransportError;
                }
                Wake::Stop => return SessionEvent::Stop,
            }
        }
    }

    /// Feed one event (plus any follow-ups its actions produce) through the
    /// machine. Events are processed to completion one at a time.
    async fn dispatch(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::new();
        queue.push_back(event);

        while let Some(event) = queue.pop_front() {
            // Classification events are derived from the payload before the
            // machine sees it, so sub-state changes follow the forward.
            // Outside an established session the machine discards the
            // payload, so it must not reach the analyzer either.
            if let SessionEvent::AudioPayload(payload) = &event {
                if self.session.state().is_connected() {
                    for analyzer_event in self.analyzer.analyze(payload) {
                        match analyzer_event {
                            AnalyzerEvent::NotifyTriggered => {
                                queue.push_back(SessionEvent::NotifyTriggered)
                            }
                            AnalyzerEvent::AlarmTriggered => {
                                queue.push_back(SessionEvent::AlarmTriggered)
                            }
                            AnalyzerEvent::PeakChanged(_) | AnalyzerEvent::ConfigChanged(_) => {}
                        }
                    }
                }
            }

            for action in self.session.handle_event(event) {
                self.execute(action, &mut queue).await;
            }
        }
    }

    async fn execute(&mut self, action: Action, queue: &mut VecDeque<SessionEvent>) {
        match action {
            Action::SendPing => {
                let target = self.config.discovery_target();
                if let Err(e) = self.discovery.send_ping(target).await {
                    tracing::warn!("PING broadcast failed: {}", e);
                    queue.push_back(SessionEvent::TransportError);
                }
            }
            Action::Connect(peer) => {
                // The attempt runs as its own task so a slow peer cannot
                // stall the event loop; the outcome comes back through
                // `next_event`, stale attempts are dropped by number
                self.connect_attempt += 1;
                let attempt = self.connect_attempt;
                let tx = self.connect_tx.clone();
                let retry_delay = (self.session.state() == SessionState::Reconnecting)
                    .then_some(RECONNECT_RETRY_DELAY);
                tokio::spawn(async move {
                    let outcome = ControlChannel::connect(peer).await;
                    match &outcome {
                        Ok(_) => tracing::info!("Handshake with {} succeeded", peer),
                        Err(e) => {
                            tracing::warn!("Handshake with {} failed: {}", peer, e);
                            // Pace the reconnect retry loop; the connection
                            // timer keeps running meanwhile and settles the
                            // session if it fires first
                            if let Some(delay) = retry_delay {
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                    let _ = tx.send((attempt, outcome));
                });
            }
            Action::ForwardAudio(payload) => self.sink.write(&payload),
            Action::ArmConnectTimer { epoch } => {
                self.connect_deadline = Some((Instant::now() + self.config.connect_timeout, epoch));
            }
            Action::DisarmConnectTimer => self.connect_deadline = None,
            Action::ArmQuietTimer { epoch } => {
                self.quiet_deadline = Some((Instant::now() + self.config.quiet_interval, epoch));
            }
            Action::ReleaseResources => {
                self.control = None;
                self.connect_deadline = None;
                self.quiet_deadline = None;
                // Any handshake attempt still in flight is now stale
                self.connect_attempt += 1;
            }
        }
    }
}
