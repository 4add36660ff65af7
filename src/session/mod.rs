//! Session lifecycle state machine
//!
//! The monitor's view of its relationship to one streamer, expressed as an
//! explicit state enum plus a single event-dispatch function. The machine is
//! pure: it owns no sockets and never blocks. Each event produces a list of
//! [`Action`]s for the driver to execute, and every state change is announced
//! to subscribers. Events are dispatched strictly one at a time; a transition
//! and its actions complete before the next event is handled.
//!
//! ```text
//! Connecting ──▶ Connected{Standby, Listening, Notification, Alarm}
//!     │                  │                          ▲
//!     │                  ▼                          │ history resume
//!     │             Reconnecting ───────────────────┘
//!     └──────────────────┴──▶ Disconnected (terminal)
//! ```
//!
//! Timer races are settled with generation counters: every armed timer
//! carries the epoch current at arm time, and a fired timer whose epoch no
//! longer matches is dropped as stale.

pub mod driver;

use std::net::SocketAddr;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Sub-states of the connected hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// Connected, no recent audio activity
    Standby,
    /// Unclassified audio flowing
    Listening,
    /// Loudness reached the notification band
    Notification,
    /// Loudness held above the alarm threshold past the debounce window
    Alarm,
}

/// Session state, hierarchical via `Connected(SubState)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected(SubState),
    Reconnecting,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Kick off discovery; valid exactly once, on a fresh session
    Start,
    /// A `PONG` datagram arrived from a streamer
    PongReceived(SocketAddr),
    /// The TCP connect to the discovered peer succeeded
    HandshakeComplete,
    /// An audio chunk arrived on the stream channel
    AudioPayload(Bytes),
    /// Loudness classification surfaced from the payload stream
    NotifyTriggered,
    /// Alarm classification surfaced from the payload stream
    AlarmTriggered,
    /// Socket-level failure on either channel
    TransportError,
    /// The connection timer expired
    ConnectTimerFired { epoch: u64 },
    /// No audio activity for the quiet interval
    QuietTimerFired { epoch: u64 },
    /// Explicit shutdown
    Stop,
}

/// Side effects for the driver to execute after a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Broadcast a discovery `PING`
    SendPing,
    /// Open (or re-open) the control channel to the peer
    Connect(SocketAddr),
    /// Hand an audio chunk to the playback sink
    ForwardAudio(Bytes),
    /// Arm the single-shot connection timer with the given epoch
    ArmConnectTimer { epoch: u64 },
    /// Cancel the connection timer
    DisarmConnectTimer,
    /// (Re-)arm the quiet-interval timer with the given epoch
    ArmQuietTimer { epoch: u64 },
    /// Terminal: release sockets and timers
    ReleaseResources,
}

/// Emitted to subscribers on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChanged {
    pub from: SessionState,
    pub to: SessionState,
}

/// One monitor's session with one streamer
pub struct Session {
    state: SessionState,
    /// Address of the discovered streamer; cleared on terminal disconnect
    peer_addr: Option<SocketAddr>,
    /// Last active sub-state, resumed after reconnection
    history: SubState,
    started: bool,
    connect_epoch: u64,
    quiet_epoch: u64,
    subscribers: Vec<Sender<StateChanged>>,
}

impl Session {
    /// A fresh session reports `Disconnected` until `Start` is dispatched
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            peer_addr: None,
            history: SubState::Standby,
            started: false,
            connect_epoch: 0,
            quiet_epoch: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn history(&self) -> SubState {
        self.history
    }

    /// Subscribe to state-change notifications
    pub fn subscribe(&mut self) -> Receiver<StateChanged> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Dispatch one event, returning the side effects to execute
    pub fn handle_event(&mut self, event: SessionEvent) -> Vec<Action> {
        use SessionEvent::*;
        use SessionState::*;

        match (self.state, event) {
            (Disconnected, Start) if !self.started => {
                self.started = true;
                self.transition(Connecting);
                vec![
                    Action::SendPing,
                    Action::ArmConnectTimer {
                        epoch: self.next_connect_epoch(),
                    },
                ]
            }
            // Terminal: a new session must be constructed to retry
            (Disconnected, _) => vec![],

            (_, Stop) => {
                self.enter_disconnected();
                vec![Action::ReleaseResources]
            }

            (Connecting, PongReceived(addr)) => {
                if self.peer_addr.is_none() {
                    tracing::info!("Discovered streamer at {}", addr);
                    self.peer_addr = Some(addr);
                    vec![Action::Connect(addr)]
                } else {
                    // First responder won this attempt
                    tracing::debug!("Ignoring late PONG from {}", addr);
                    vec![]
                }
            }
            (Connecting, HandshakeComplete) => {
                self.transition(Connected(SubState::Standby));
                vec![Action::DisarmConnectTimer]
            }
            (Connecting, TransportError) => {
                self.enter_disconnected();
                vec![Action::ReleaseResources]
            }
            (Connecting, ConnectTimerFired { epoch }) if epoch == self.connect_epoch => {
                tracing::info!("Connection attempt timed out");
                self.enter_disconnected();
                vec![Action::ReleaseResources]
            }

            (Connected(sub), AudioPayload(payload)) => {
                let actions = vec![
                    Action::ForwardAudio(payload),
                    Action::ArmQuietTimer {
                        epoch: self.next_quiet_epoch(),
                    },
                ];
                if sub == SubState::Standby {
                    self.transition(Connected(SubState::Listening));
                }
                actions
            }
            (Connected(sub), NotifyTriggered) => {
                if sub != SubState::Notification {
                    self.transition(Connected(SubState::Notification));
                }
                vec![]
            }
            (Connected(sub), AlarmTriggered) => {
                if sub != SubState::Alarm {
                    self.transition(Connected(SubState::Alarm));
                }
                vec![]
            }
            (Connected(sub), QuietTimerFired { epoch }) if epoch == self.quiet_epoch => {
                if sub != SubState::Standby {
                    self.transition(Connected(SubState::Standby));
                }
                vec![]
            }
            (Connected(sub), TransportError) => {
                self.history = sub;
                self.transition(Reconnecting);
                let timer = Action::ArmConnectTimer {
                    epoch: self.next_connect_epoch(),
                };
                match self.peer_addr {
                    Some(peer) => vec![timer, Action::Connect(peer)],
                    None => vec![timer],
                }
            }

            (Reconnecting, HandshakeComplete) => {
                self.transition(Connected(self.history));
                let mut actions = vec![Action::DisarmConnectTimer];
                // A silent stream after resuming into an active sub-state
                // still has to decay to Standby
                if self.history != SubState::Standby {
                    actions.push(Action::ArmQuietTimer {
                        epoch: self.next_quiet_epoch(),
                    });
                }
                actions
            }
            (Reconnecting, TransportError) => {
                // Reconnect attempt failed; keep trying until the timer
                // settles it
                match self.peer_addr {
                    Some(peer) => vec![Action::Connect(peer)],
                    None => vec![],
                }
            }
            (Reconnecting, ConnectTimerFired { epoch }) if epoch == self.connect_epoch => {
                tracing::info!("Reconnection timed out");
                self.enter_disconnected();
                vec![Action::ReleaseResources]
            }

            // Stale timers and out-of-state events are noise, not errors
            (state, event) => {
                tracing::debug!(?state, ?event, "Ignoring event");
                vec![]
            }
        }
    }

    fn next_connect_epoch(&mut self) -> u64 {
        self.connect_epoch += 1;
        self.connect_epoch
    }

    fn next_quiet_epoch(&mut self) -> u64 {
        self.quiet_epoch += 1;
        self.quiet_epoch
    }

    fn enter_disconnected(&mut self) {
        self.peer_addr = None;
        // Invalidate any in-flight timers
        self.connect_epoch += 1;
        self.quiet_epoch += 1;
        self.transition(SessionState::Disconnected);
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        debug_assert_ne!(from, to, "transitions must change state");
        self.state = to;
        tracing::debug!("Session state: {:?} -> {:?}", from, to);
        let change = StateChanged { from, to };
        self.subscribers.retain(|tx| tx.send(change).is_ok());
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.10:{}", port).parse().unwrap()
    }

    /// Drive a fresh session to `Connected(Standby)`
    fn connected_session() -> Session {
        let mut session = Session::new();
        session.handle_event(SessionEvent::Start);
        session.handle_event(SessionEvent::PongReceived(addr(2011)));
        session.handle_event(SessionEvent::HandshakeComplete);
        assert_eq!(session.state(), SessionState::Connected(SubState::Standby));
        session
    }

    #[test]
    fn fresh_session_is_disconnected_until_started() {
        let mut session = Session::new();
        let changes = session.subscribe();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(changes.try_recv().is_err());

        let actions = session.handle_event(SessionEvent::Start);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(
            changes.try_recv().unwrap(),
            StateChanged {
                from: SessionState::Disconnected,
                to: SessionState::Connecting,
            }
        );
        assert!(changes.try_recv().is_err(), "exactly one StateChanged");
        assert!(actions.contains(&Action::SendPing));
        assert!(matches!(actions[1], Action::ArmConnectTimer { .. }));
    }

    #[test]
    fn connect_timeout_is_terminal() {
        let mut session = Session::new();
        let changes = session.subscribe();
        let actions = session.handle_event(SessionEvent::Start);
        let epoch = match actions[1] {
            Action::ArmConnectTimer { epoch } => epoch,
            ref other => panic!("expected timer arm, got {:?}", other),
        };

        let actions = session.handle_event(SessionEvent::ConnectTimerFired { epoch });
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(actions, vec![Action::ReleaseResources]);

        // Exactly two StateChanged overall, and nothing moves afterwards
        assert!(changes.try_recv().is_ok());
        assert!(changes.try_recv().is_ok());
        assert!(changes.try_recv().is_err());
        assert!(session.handle_event(SessionEvent::Start).is_empty());
        assert!(session
            .handle_event(SessionEvent::PongReceived(addr(1)))
            .is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn first_pong_wins() {
        let mut session = Session::new();
        session.handle_event(SessionEvent::Start);

        let first = addr(2011);
        let actions = session.handle_event(SessionEvent::PongReceived(first));
        assert_eq!(actions, vec![Action::Connect(first)]);

        let actions = session.handle_event(SessionEvent::PongReceived(addr(4000)));
        assert!(actions.is_empty());
        assert_eq!(session.peer_addr(), Some(first));
    }

    #[test]
    fn reconnection_resumes_history() {
        let mut session = connected_session();
        session.handle_event(SessionEvent::AudioPayload(Bytes::from_static(b"pcm")));
        session.handle_event(SessionEvent::NotifyTriggered);
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Notification)
        );

        let actions = session.handle_event(SessionEvent::TransportError);
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(session.history(), SubState::Notification);
        assert!(matches!(actions[0], Action::ArmConnectTimer { .. }));
        assert_eq!(actions[1], Action::Connect(addr(2011)));

        session.handle_event(SessionEvent::HandshakeComplete);
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Notification)
        );
    }

    #[test]
    fn history_resume_arms_quiet_timer() {
        let mut session = connected_session();
        session.handle_event(SessionEvent::NotifyTriggered);
        session.handle_event(SessionEvent::TransportError);

        let actions = session.handle_event(SessionEvent::HandshakeComplete);
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Notification)
        );
        assert_eq!(actions[0], Action::DisarmConnectTimer);
        let epoch = match actions[1] {
            Action::ArmQuietTimer { epoch } => epoch,
            ref other => panic!("expected quiet timer arm, got {:?}", other),
        };

        // The resumed sub-state decays to Standby when the stream stays quiet
        session.handle_event(SessionEvent::QuietTimerFired { epoch });
        assert_eq!(session.state(), SessionState::Connected(SubState::Standby));
    }

    #[test]
    fn standby_resume_needs_no_quiet_timer() {
        let mut session = connected_session();
        session.handle_event(SessionEvent::TransportError);

        let actions = session.handle_event(SessionEvent::HandshakeComplete);
        assert_eq!(session.state(), SessionState::Connected(SubState::Standby));
        assert_eq!(actions, vec![Action::DisarmConnectTimer]);
    }

    #[test]
    fn stale_connect_timer_is_ignored() {
        let mut session = Session::new();
        session.handle_event(SessionEvent::Start);
        session.handle_event(SessionEvent::PongReceived(addr(2011)));
        session.handle_event(SessionEvent::HandshakeComplete);

        // The timer armed during Connecting fires late, after the handshake
        // already won
        let actions = session.handle_event(SessionEvent::ConnectTimerFired { epoch: 1 });
        assert!(actions.is_empty());
        assert_eq!(session.state(), SessionState::Connected(SubState::Standby));
    }

    #[test]
    fn audio_moves_standby_to_listening_and_feeds_sink() {
        let mut session = connected_session();
        let payload = Bytes::from_static(b"\x7f\x90\x7f");
        let actions = session.handle_event(SessionEvent::AudioPayload(payload.clone()));
        assert_eq!(actions[0], Action::ForwardAudio(payload));
        assert!(matches!(actions[1], Action::ArmQuietTimer { .. }));
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Listening)
        );

        // More audio keeps the sub-state, still forwards
        let actions = session.handle_event(SessionEvent::AudioPayload(Bytes::from_static(b"x")));
        assert!(matches!(actions[0], Action::ForwardAudio(_)));
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Listening)
        );
    }

    #[test]
    fn quiet_interval_falls_back_to_standby() {
        let mut session = connected_session();
        let actions = session.handle_event(SessionEvent::AudioPayload(Bytes::from_static(b"x")));
        let epoch = match actions[1] {
            Action::ArmQuietTimer { epoch } => epoch,
            ref other => panic!("expected quiet timer arm, got {:?}", other),
        };

        session.handle_event(SessionEvent::QuietTimerFired { epoch });
        assert_eq!(session.state(), SessionState::Connected(SubState::Standby));

        // A quiet timer superseded by newer audio is stale
        let actions = session.handle_event(SessionEvent::AudioPayload(Bytes::from_static(b"y")));
        let stale = epoch;
        let fresh = match actions[1] {
            Action::ArmQuietTimer { epoch } => epoch,
            ref other => panic!("expected quiet timer arm, got {:?}", other),
        };
        assert_ne!(stale, fresh);
        session.handle_event(SessionEvent::QuietTimerFired { epoch: stale });
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Listening)
        );
    }

    #[test]
    fn alarm_and_notify_drive_sub_states() {
        let mut session = connected_session();
        session.handle_event(SessionEvent::AlarmTriggered);
        assert_eq!(session.state(), SessionState::Connected(SubState::Alarm));

        // Repeated alarms while already in Alarm do not re-transition
        let changes = session.subscribe();
        session.handle_event(SessionEvent::AlarmTriggered);
        assert!(changes.try_recv().is_err());

        session.handle_event(SessionEvent::NotifyTriggered);
        assert_eq!(
            session.state(),
            SessionState::Connected(SubState::Notification)
        );
    }

    #[test]
    fn transport_error_while_connecting_is_terminal() {
        let mut session = Session::new();
        session.handle_event(SessionEvent::Start);
        let actions = session.handle_event(SessionEvent::TransportError);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(actions, vec![Action::ReleaseResources]);
    }

    #[test]
    fn reconnect_timeout_is_terminal() {
        let mut session = connected_session();
        let actions = session.handle_event(SessionEvent::TransportError);
        let epoch = match actions[0] {
            Action::ArmConnectTimer { epoch } => epoch,
            ref other => panic!("expected timer arm, got {:?}", other),
        };
        session.handle_event(SessionEvent::ConnectTimerFired { epoch });
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.peer_addr(), None);
    }

    #[test]
    fn failed_reconnect_attempt_retries_until_timer() {
        let mut session = connected_session();
        session.handle_event(SessionEvent::TransportError);
        assert_eq!(session.state(), SessionState::Reconnecting);

        let actions = session.handle_event(SessionEvent::TransportError);
        assert_eq!(actions, vec![Action::Connect(addr(2011))]);
        assert_eq!(session.state(), SessionState::Reconnecting);
    }

    #[test]
    fn stop_releases_resources_from_any_non_terminal_state() {
        let mut session = connected_session();
        let actions = session.handle_event(SessionEvent::Stop);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(actions, vec![Action::ReleaseResources]);
        assert_eq!(session.peer_addr(), None);

        // Stop on a terminal session is a no-op
        assert!(session.handle_event(SessionEvent::Stop).is_empty());
    }

    #[test]
    fn peer_address_tracks_connection_lifecycle() {
        let mut session = Session::new();
        assert_eq!(session.peer_addr(), None);
        session.handle_event(SessionEvent::Start);
        session.handle_event(SessionEvent::PongReceived(addr(2011)));
        session.handle_event(SessionEvent::HandshakeComplete);
        assert!(session.peer_addr().is_some());

        session.handle_event(SessionEvent::TransportError);
        assert!(session.peer_addr().is_some(), "kept through Reconnecting");

        session.handle_event(SessionEvent::Stop);
        assert_eq!(session.peer_addr(), None);
    }
}
