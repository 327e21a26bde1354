//! Listener sessions
//!
//! A [`Session`] is one listener's negotiation with the server. Its state,
//! negotiation epoch, and transport handle sit behind a single lock so the
//! asynchronous actors (negotiation task, liveness poller, connection loop)
//! always observe them together. Every async completion carries the epoch it
//! was started under and is refused once a renegotiation has moved on.

pub mod liveness;
pub mod registry;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::engine::Feed;
use crate::error::SessionError;
use crate::signaling::message::OutboundMessage;
use crate::transport::{IceCandidate, PeerTransport};

pub use liveness::{ListenerCount, LivenessTracker};
pub use registry::SessionRegistry;

/// Opaque session identity, stable across renegotiations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one signaling connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    OfferReceived,
    AnsweredPending,
    Connected,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    pub fn accepts_candidates(self) -> bool {
        matches!(
            self,
            SessionState::OfferReceived | SessionState::AnsweredPending | SessionState::Connected
        )
    }
}

/// What to do with a remote candidate
pub enum CandidateAction {
    /// Hand it to this round's transport now
    Apply(Arc<dyn PeerTransport>),
    /// Held until the round's transport is installed
    Queued,
    /// Duplicate, or the session takes no candidates in its state
    Ignored,
}

/// Handle for one negotiation round
pub struct Negotiation {
    pub epoch: u64,
    /// Cancelled on renegotiation or session teardown
    pub token: CancellationToken,
    /// Transport of the superseded round, for the caller to close
    pub previous: Option<Arc<dyn PeerTransport>>,
}

struct SessionInner {
    state: SessionState,
    epoch: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    epoch_token: Option<CancellationToken>,
    candidates: HashSet<IceCandidate>,
    /// Accepted before the transport existed
    queued: Vec<IceCandidate>,
}

pub struct Session {
    id: SessionId,
    conn_id: ConnId,
    feed: Feed,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    counted: AtomicBool,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(conn_id: ConnId, feed: Feed, outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            id: SessionId::new(),
            conn_id,
            feed,
            outbound,
            counted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::New,
                epoch: 0,
                transport: None,
                epoch_token: None,
                candidates: HashSet::new(),
                queued: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.epoch == epoch && !inner.state.is_terminal()
    }

    /// Run `f` while `epoch` is held current. Teardown and renegotiation
    /// wait for `f` to finish, so its effects are always undone by them.
    pub fn if_current<R>(&self, epoch: u64, f: impl FnOnce() -> R) -> Option<R> {
        let inner = self.inner.lock();
        if inner.epoch != epoch || inner.state.is_terminal() {
            return None;
        }
        Some(f())
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.inner.lock().transport.clone()
    }

    pub fn is_counted(&self) -> bool {
        self.counted.load(Ordering::Acquire)
    }

    /// Queue a message for the listener. `false` once the connection is gone.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Start a new negotiation round: cancels the previous round's work,
    /// bumps the epoch and forgets its candidates.
    pub fn begin_negotiation(&self) -> Result<Negotiation, SessionError> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(SessionError::Terminal);
        }
        if let Some(token) = inner.epoch_token.take() {
            token.cancel();
        }
        let token = self.cancel.child_token();
        inner.epoch += 1;
        inner.epoch_token = Some(token.clone());
        inner.state = SessionState::OfferReceived;
        inner.candidates.clear();
        inner.queued.clear();
        let previous = inner.transport.take();

        Ok(Negotiation {
            epoch: inner.epoch,
            token,
            previous,
        })
    }

    /// Bind the transport created for `epoch`. Returns the candidates that
    /// arrived before it, for the caller to apply.
    pub fn install_transport(
        &self,
        epoch: u64,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Vec<IceCandidate>, SessionError> {
        let mut inner = self.inner.lock();
        Self::check_epoch(&inner, epoch)?;
        inner.transport = Some(transport);
        Ok(std::mem::take(&mut inner.queued))
    }

    /// Move `from → to` within `epoch`
    pub fn transition(
        &self,
        epoch: u64,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        Self::check_epoch(&inner, epoch)?;
        if inner.state != from {
            return Err(SessionError::Terminal);
        }
        inner.state = to;
        Ok(())
    }

    /// Mark the round failed. Returns `false` if it was already superseded.
    pub fn fail(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if Self::check_epoch(&inner, epoch).is_err() {
            return false;
        }
        inner.state = SessionState::Error;
        true
    }

    /// Record a remote candidate for the current round
    pub fn accept_candidate(&self, candidate: &IceCandidate) -> CandidateAction {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_candidates() || !inner.candidates.insert(candidate.clone()) {
            return CandidateAction::Ignored;
        }
        match inner.transport.clone() {
            Some(transport) => CandidateAction::Apply(transport),
            None => {
                inner.queued.push(candidate.clone());
                CandidateAction::Queued
            }
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.inner.lock().candidates.len()
    }

    /// First connected sample for `epoch`. Counts the listener at most once
    /// per session; returns whether this call did the counting.
    pub fn mark_connected(&self, epoch: u64, listeners: &ListenerCount) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        Self::check_epoch(&inner, epoch)?;
        if !matches!(
            inner.state,
            SessionState::AnsweredPending | SessionState::Connected
        ) {
            return Ok(false);
        }
        inner.state = SessionState::Connected;
        if self
            .counted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            listeners.increment();
            return Ok(true);
        }
        Ok(false)
    }

    /// Undo the count taken by [`Session::mark_connected`], if any
    pub fn release_listener(&self, listeners: &ListenerCount) -> bool {
        let _inner = self.inner.lock();
        if self
            .counted
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            listeners.decrement();
            return true;
        }
        false
    }

    /// Enter the terminal state and cancel all outstanding work. Returns the
    /// transport for the caller to close.
    pub fn close(&self) -> Option<Arc<dyn PeerTransport>> {
        let mut inner = self.inner.lock();
        Self::shut(&mut inner, &self.cancel)
    }

    /// Like [`Session::close`], but only if `epoch` is still current
    pub fn close_if_epoch(&self, epoch: u64) -> Result<Option<Arc<dyn PeerTransport>>, SessionError> {
        let mut inner = self.inner.lock();
        Self::check_epoch(&inner, epoch)?;
        Ok(Self::shut(&mut inner, &self.cancel))
    }

    fn shut(inner: &mut SessionInner, cancel: &CancellationToken) -> Option<Arc<dyn PeerTransport>> {
        if !inner.state.is_terminal() {
            inner.state = SessionState::Closed;
        }
        inner.epoch_token = None;
        cancel.cancel();
        inner.transport.take()
    }

    fn check_epoch(inner: &SessionInner, epoch: u64) -> Result<(), SessionError> {
        if inner.state.is_terminal() {
            return Err(SessionError::Terminal);
        }
        if inner.epoch != epoch {
            return Err(SessionError::StaleEpoch {
                got: epoch,
                current: inner.epoch,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("feed", &self.feed)
            .field("state", &inner.state)
            .field("epoch", &inner.epoch)
            .field("counted", &self.is_counted())
            .finish()
    }
}
