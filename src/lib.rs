//! # Baby Monitor Audio Link
//!
//! One-way ambient audio link over a LAN: a streamer captures nursery audio,
//! classifies its loudness, and multicasts the raw PCM; a monitor discovers
//! the streamer, opens a session, and plays the audio back while tracking
//! connection health.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          STREAMER                                │
//! │  ┌────────────┐    ┌───────────────────┐    ┌────────────────┐  │
//! │  │ Microphone │───▶│ Amplitude Analyzer │───▶│ peak / notify / │  │
//! │  │  (audio)   │    │    (analyzer)      │    │ alarm events    │  │
//! │  └────────────┘    └───────────────────┘    └────────────────┘  │
//! │        │                                                        │
//! │        ▼                                                        │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │ StreamPublisher (transport) — UDP multicast 239.51.67.81  │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────────┐  ┌────────────────────────────┐   │
//! │  │ Discovery responder      │  │ TCP accept loop (control)  │   │
//! │  │ PING → PONG on :2011     │  │ connect == handshake       │   │
//! │  └──────────────────────────┘  └────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//!                                │ UDP over LAN
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           MONITOR                                │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │ SessionDriver (session) — event loop over three sources:  │  │
//! │  │   discovery datagrams · TCP control events · timers       │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │        │                                                        │
//! │        ▼                                                        │
//! │  Connecting ─▶ Connected{Standby,Listening,Notification,Alarm}  │
//! │        │               │                │                       │
//! │        │               ▼                ▼                       │
//! │        │        PlaybackSink     Reconnecting ─▶ history resume │
//! │        └──────────────────▶ Disconnected (terminal)             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod analyzer;
pub mod audio;
pub mod config;
pub mod discovery;
pub mod error;
pub mod session;
pub mod streamer;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    /// Well-known UDP/TCP port for discovery and session establishment
    pub const DISCOVERY_PORT: u16 = 2011;

    /// UDP port the audio stream is multicast to
    pub const STREAM_PORT: u16 = 2012;

    /// Multicast group carrying the audio stream
    pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 51, 67, 81);

    /// Link-local TTL for the multicast stream
    pub const MULTICAST_TTL: u32 = 1;

    /// Fixed stream sample rate in Hz
    pub const SAMPLE_RATE: u32 = 8000;

    /// Fixed stream channel count (mono)
    pub const CHANNELS: u16 = 1;

    /// Midpoint of the 8-bit unsigned PCM scale
    pub const PCM_MIDPOINT: i32 = 127;

    /// Largest possible deviation from the PCM midpoint
    pub const MAX_SAMPLE_DEVIATION: i32 = 128;

    /// Default loudness threshold for a one-shot notification
    pub const DEFAULT_NOTIFICATION_THRESHOLD: i32 = 30;

    /// Default loudness threshold that opens the alarm window
    pub const DEFAULT_ALARM_THRESHOLD: i32 = 60;

    /// How long the peak must stay at or above the alarm threshold
    /// before the alarm actually fires
    pub const DEFAULT_ALARM_TRIGGER_PERIOD: Duration = Duration::from_secs(2);

    /// Window for completing discovery + handshake (and reconnection)
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Without audio activity for this long, a connected session
    /// falls back to standby
    pub const QUIET_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum payload size for one stream datagram (MTU - IP/UDP headers)
    pub const MAX_DATAGRAM_SIZE: usize = 1472;

    /// Capacity of the capture frame channel
    pub const CAPTURE_CHANNEL_CAPACITY: usize = 64;
}
