//! Peer transport seam
//!
//! The signaling layer only needs a handful of operations from a real-time
//! peer: apply an offer and answer it, take remote candidates, report
//! connectivity, and accept PCM frames. Codec selection and encryption live
//! behind this trait.

pub mod memory;
#[cfg(feature = "rtc")]
pub mod rtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::engine::{AudioFrame, Feed, FrameSink};
use crate::error::TransportError;

pub use memory::{MemoryPeer, MemoryPeerFactory};

/// A connectivity candidate, in browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Transport-level connectivity as sampled by the liveness poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    pub fn is_terminal(self) -> bool {
        matches!(self, Connectivity::Failed | Connectivity::Closed)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Connectivity::New => 0,
            Connectivity::Checking => 1,
            Connectivity::Connected => 2,
            Connectivity::Disconnected => 3,
            Connectivity::Failed => 4,
            Connectivity::Closed => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Connectivity::Checking,
            2 => Connectivity::Connected,
            3 => Connectivity::Disconnected,
            4 => Connectivity::Failed,
            5 => Connectivity::Closed,
            _ => Connectivity::New,
        }
    }
}

/// Callback for candidates gathered on our side
pub type LocalCandidateFn = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// One peer session's transport handle
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply the remote offer and return the local answer SDP
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError>;

    /// Add a remote candidate. Candidates that arrive before the offer has
    /// been applied are buffered by the implementation.
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    fn connectivity(&self) -> Connectivity;

    /// Hand over one frame of PCM. Called on the mixing thread: must not block.
    fn deliver(&self, frame: &AudioFrame);

    /// Tear down. Non-blocking; any async work is spawned.
    fn close(&self);
}

/// Creates fresh transports, one per negotiation
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        feed: Feed,
        on_candidate: LocalCandidateFn,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Adapts a transport to the engine's sink interface
pub struct TransportSink(pub Arc<dyn PeerTransport>);

impl FrameSink for TransportSink {
    fn deliver(&self, _feed: Feed, frame: &AudioFrame) {
        self.0.deliver(frame);
    }
}
