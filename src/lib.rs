//! # mixcast
//!
//! Live microphone + media player mix, broadcast to browser listeners over
//! WebRTC.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               SERVER                                     │
//! │  ┌─────────────┐      ┌─────────────┐                                    │
//! │  │ Microphone  │      │   Player    │   capture / decode threads         │
//! │  │ (cpal)      │      │ (PCM feed)  │                                    │
//! │  └──────┬──────┘      └──────┬──────┘                                    │
//! │         ▼                    ▼                                           │
//! │  ┌─────────────┐      ┌─────────────┐                                    │
//! │  │ PcmRing     │      │ PcmRing     │   lock-free SPSC (audio::ring)     │
//! │  └──────┬──────┘      └──────┬──────┘                                    │
//! │         └─────────┬──────────┘                                           │
//! │                   ▼                                                      │
//! │  ┌────────────────────────────────────┐   ┌──────────────────────┐       │
//! │  │ AudioEngine (audio::engine)        │◀──│ MixParameters        │◀─┐    │
//! │  │ gains · routing · per-session taps │   │ (alpha, micMuted)    │  │    │
//! │  └─────────────────┬──────────────────┘   └──────────────────────┘  │    │
//! │                    ▼                                                │    │
//! │  ┌────────────────────────────────────┐   ┌──────────────────────┐  │    │
//! │  │ PeerTransport (transport::rtc)     │◀──│ SessionRegistry      │  │    │
//! │  │ Opus track per session             │   │ + LivenessTracker    │  │    │
//! │  └─────────────────┬──────────────────┘   └──────────▲───────────┘  │    │
//! │                    │                                 │              │    │
//! │                    │              ┌──────────────────┴───────────┐  │    │
//! │                    │              │ SignalingEndpoint (per WS)   │──┘    │
//! │                    │              │ offer/answer/ice/ping/bye/mix│       │
//! │                    │              └──────────────────▲───────────┘       │
//! └────────────────────┼─────────────────────────────────┼───────────────────┘
//!                      │ RTP/Opus                        │ WebSocket JSON
//!                      ▼                                 ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              LISTENER                                    │
//! │        browser (or client::ClientMixer) applying the same gain law       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
#[cfg(feature = "rtc")]
pub mod codec;
pub mod config;
pub mod error;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default frame size in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: u32 = 10;

    /// Ring buffer capacity in samples (2 s of mono at 48 kHz)
    pub const DEFAULT_RING_CAPACITY: usize = 96_000;

    /// Liveness poll period
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

    /// First HTTP port tried
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Ports probed before giving up
    pub const DEFAULT_PORT_ATTEMPTS: u16 = 20;
}
