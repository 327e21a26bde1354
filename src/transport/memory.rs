//! In-process transport
//!
//! No network at all: connectivity is whatever the controlling side sets.
//! Used to drive the signaling layer end to end without a browser, and to
//! embed the server in hosts that bring their own media path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::engine::{AudioFrame, Feed};
use crate::error::TransportError;
use crate::signaling::message::looks_like_sdp;
use crate::transport::{Connectivity, IceCandidate, LocalCandidateFn, PeerFactory, PeerTransport};

/// One in-memory peer
pub struct MemoryPeer {
    feed: Feed,
    state: AtomicU8,
    fail_answer: bool,
    answer_delay: Duration,
    local_candidates: Vec<IceCandidate>,
    on_candidate: LocalCandidateFn,
    remote_offer: Mutex<Option<String>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    frames: AtomicU64,
    closed: AtomicBool,
}

impl MemoryPeer {
    pub fn feed(&self) -> Feed {
        self.feed
    }

    /// Drive the connectivity the liveness poller will observe
    pub fn set_connectivity(&self, state: Connectivity) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn remote_offer(&self) -> Option<String> {
        self.remote_offer.lock().clone()
    }

    /// Every candidate applied so far, in order
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PeerTransport for MemoryPeer {
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        if !self.answer_delay.is_zero() {
            tokio::time::sleep(self.answer_delay).await;
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !looks_like_sdp(sdp) {
            return Err(TransportError::RemoteDescription("not an SDP document".into()));
        }
        if self.fail_answer {
            return Err(TransportError::Answer("answer creation refused".into()));
        }

        *self.remote_offer.lock() = Some(sdp.to_string());
        self.set_connectivity(Connectivity::Checking);
        for candidate in &self.local_candidates {
            (self.on_candidate)(candidate.clone());
        }

        Ok(format!(
            "v=0\r\no=mixcast 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=sendonly\r\na=x-feed:{}\r\n",
            self.feed.as_str()
        ))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.remote_candidates.lock().push(candidate.clone());
        Ok(())
    }

    fn connectivity(&self) -> Connectivity {
        Connectivity::from_u8(self.state.load(Ordering::Acquire))
    }

    fn deliver(&self, _frame: &AudioFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.set_connectivity(Connectivity::Closed);
    }
}

/// Factory that remembers every peer it made
#[derive(Default)]
pub struct MemoryPeerFactory {
    peers: Mutex<Vec<Arc<MemoryPeer>>>,
    fail_answers: AtomicBool,
    fail_create: AtomicBool,
    answer_delay: Mutex<Duration>,
    create_delay: Mutex<Duration>,
    local_candidates: Mutex<Vec<IceCandidate>>,
}

impl MemoryPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequently created peers refuse to answer
    pub fn fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::Release);
    }

    /// Make `create` itself fail
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Release);
    }

    /// Delay applied inside `accept_offer`
    pub fn set_answer_delay(&self, delay: Duration) {
        *self.answer_delay.lock() = delay;
    }

    /// Delay applied inside `create`
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Candidates each new peer "gathers" once it has answered
    pub fn set_local_candidates(&self, candidates: Vec<IceCandidate>) {
        *self.local_candidates.lock() = candidates;
    }

    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        self.peers.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MemoryPeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for MemoryPeerFactory {
    async fn create(
        &self,
        feed: Feed,
        on_candidate: LocalCandidateFn,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::Acquire) {
            return Err(TransportError::Create("factory refused".into()));
        }
        let peer = Arc::new(MemoryPeer {
            feed,
            state: AtomicU8::new(Connectivity::New.to_u8()),
            fail_answer: self.fail_answers.load(Ordering::Acquire),
            answer_delay: *self.answer_delay.lock(),
            local_candidates: self.local_candidates.lock().clone(),
            on_candidate,
            remote_offer: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            frames: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
