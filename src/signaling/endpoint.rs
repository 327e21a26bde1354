//! Per-connection signaling pump
//!
//! One [`SignalingEndpoint`] per WebSocket. Messages are handled strictly in
//! arrival order. Building the transport and applying an offer are spawned,
//! so the connection keeps serving pings and candidates meanwhile;
//! candidates that beat the transport are queued on the session.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::engine::Feed;
use crate::error::{SignalingError, TransportError};
use crate::session::{
    CandidateAction, ConnId, LivenessTracker, Negotiation, Session, SessionRegistry, SessionState,
};
use crate::signaling::message::{normalize, InboundMessage, OutboundMessage, SdpKind};
use crate::signaling::mix::MixController;
use crate::transport::{IceCandidate, LocalCandidateFn, PeerFactory, PeerTransport};

/// Everything the endpoints of one server share
#[derive(Clone)]
pub struct SignalingContext {
    pub registry: Arc<SessionRegistry>,
    pub factory: Arc<dyn PeerFactory>,
    pub tracker: LivenessTracker,
    pub mix: Arc<MixController>,
    /// Whether listeners may send `mix` messages
    pub accept_remote_mix: bool,
}

impl SignalingContext {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn PeerFactory>,
        poll_interval: Duration,
        accept_remote_mix: bool,
    ) -> Self {
        Self {
            tracker: LivenessTracker::new(registry.clone(), poll_interval),
            mix: Arc::new(MixController::new(registry.clone())),
            registry,
            factory,
            accept_remote_mix,
        }
    }

    /// Endpoint for a newly accepted connection
    pub fn endpoint(
        &self,
        feed: Feed,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> SignalingEndpoint {
        SignalingEndpoint {
            conn_id: ConnId::new(),
            feed,
            ctx: self.clone(),
            outbound,
        }
    }
}

pub struct SignalingEndpoint {
    conn_id: ConnId,
    feed: Feed,
    ctx: SignalingContext,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl SignalingEndpoint {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    /// The connection's live session, if any
    pub fn session(&self) -> Option<Arc<Session>> {
        self.ctx.registry.session_for(self.conn_id)
    }

    /// Handle one text frame
    pub async fn handle_text(&self, text: &str) {
        let message = match normalize(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Connection {}: {}", self.conn_id, e);
                self.notify(OutboundMessage::error(e.to_string()));
                return;
            }
        };
        tracing::debug!("Connection {} <- {}", self.conn_id, message.label());

        match message {
            InboundMessage::Description {
                kind: SdpKind::Offer,
                sdp,
            } => self.on_offer(sdp).await,
            InboundMessage::Description {
                kind: SdpKind::Answer,
                ..
            } => {
                tracing::debug!("Connection {}: ignoring answer, server only answers", self.conn_id);
            }
            InboundMessage::Candidates(candidates) => self.on_candidates(candidates).await,
            InboundMessage::Ping { t } => self.notify(OutboundMessage::pong(t)),
            InboundMessage::Bye => self.on_bye(),
            InboundMessage::Mix(update) => {
                if self.ctx.accept_remote_mix {
                    self.ctx.mix.apply(update);
                } else {
                    tracing::debug!("Connection {}: remote mix control disabled", self.conn_id);
                }
            }
            InboundMessage::Unrecognized => {
                tracing::debug!("Connection {}: dropping unrecognized message", self.conn_id);
            }
        }
    }

    /// Binary frames are not part of the protocol
    pub fn reject_binary(&self) {
        let e = SignalingError::BinaryFrame;
        tracing::warn!("Connection {}: {}", self.conn_id, e);
        self.notify(OutboundMessage::error(e.to_string()));
    }

    /// The connection went away; drop whatever it was negotiating
    pub fn shutdown(&self) {
        if let Some(session) = self.session() {
            self.ctx.registry.remove(session.id());
        }
        tracing::debug!("Connection {} closed", self.conn_id);
    }

    fn notify(&self, message: OutboundMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("Connection {}: outbound closed", self.conn_id);
        }
    }

    fn on_bye(&self) {
        match self.session() {
            Some(session) => {
                tracing::info!("Session {} said bye", session.id());
                self.ctx.registry.remove(session.id());
            }
            None => tracing::debug!("Connection {}: bye without session", self.conn_id),
        }
    }

    /// Reuse the live session for a renegotiation, or open a fresh one
    fn next_round(&self) -> Option<(Arc<Session>, Negotiation)> {
        if let Some(session) = self.session() {
            if let Ok(round) = session.begin_negotiation() {
                return Some((session, round));
            }
        }
        let session = self
            .ctx
            .registry
            .create(self.conn_id, self.feed, self.outbound.clone());
        match session.begin_negotiation() {
            Ok(round) => Some((session, round)),
            Err(e) => {
                tracing::warn!("Connection {}: cannot start negotiation: {}", self.conn_id, e);
                None
            }
        }
    }

    async fn on_offer(&self, sdp: String) {
        let Some((session, round)) = self.next_round() else {
            self.notify(OutboundMessage::error("session unavailable"));
            return;
        };
        if let Some(previous) = round.previous {
            tracing::info!(
                "Session {} renegotiating (epoch {})",
                session.id(),
                round.epoch
            );
            self.ctx.registry.engine().detach(session.id());
            previous.close();
        }
        self.notify(OutboundMessage::ack("offer-received"));

        tokio::spawn(negotiate(
            self.ctx.clone(),
            session,
            round.epoch,
            round.token,
            sdp,
        ));
    }

    async fn on_candidates(&self, candidates: Vec<IceCandidate>) {
        let Some(session) = self.session() else {
            tracing::debug!("Connection {}: candidate before offer ignored", self.conn_id);
            return;
        };
        for candidate in candidates {
            match session.accept_candidate(&candidate) {
                CandidateAction::Apply(transport) => {
                    if let Err(e) = transport.add_remote_candidate(&candidate).await {
                        tracing::warn!("Session {}: {}", session.id(), e);
                    }
                }
                CandidateAction::Queued => {
                    tracing::debug!("Session {}: candidate queued for transport", session.id());
                }
                CandidateAction::Ignored => {
                    tracing::debug!(
                        "Session {}: duplicate or out-of-state candidate ignored",
                        session.id()
                    );
                }
            }
        }
    }
}

/// Forwards our own candidates to the listener while `epoch` is current
fn candidate_forwarder(session: &Arc<Session>, epoch: u64) -> LocalCandidateFn {
    let session = Arc::downgrade(session);
    Arc::new(move |candidate| {
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_current(epoch) {
            session.send(OutboundMessage::Ice { candidate });
        }
    })
}

/// Build the transport, apply the offer and finish the round, unless it is
/// cancelled first
async fn negotiate(
    ctx: SignalingContext,
    session: Arc<Session>,
    epoch: u64,
    token: CancellationToken,
    sdp: String,
) {
    let created = tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!("Session {}: negotiation {} cancelled", session.id(), epoch);
            return;
        }
        created = ctx.factory.create(session.feed(), candidate_forwarder(&session, epoch)) => created,
    };
    let transport = match created {
        Ok(transport) => transport,
        Err(e) => {
            fail_round(&ctx, &session, epoch, e);
            return;
        }
    };

    let queued = match session.install_transport(epoch, transport.clone()) {
        Ok(queued) => queued,
        Err(e) => {
            tracing::debug!("Session {}: dropping transport: {}", session.id(), e);
            transport.close();
            return;
        }
    };
    for candidate in &queued {
        if let Err(e) = transport.add_remote_candidate(candidate).await {
            tracing::warn!("Session {}: queued candidate rejected: {}", session.id(), e);
        }
    }

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!("Session {}: negotiation {} cancelled", session.id(), epoch);
            return;
        }
        result = transport.accept_offer(&sdp) => result,
    };

    match result {
        Ok(answer) => {
            if let Err(e) =
                session.transition(epoch, SessionState::OfferReceived, SessionState::AnsweredPending)
            {
                tracing::debug!("Session {}: answer discarded: {}", session.id(), e);
                return;
            }
            session.send(OutboundMessage::Answer { sdp: answer });
            let attached = session.if_current(epoch, || {
                ctx.registry.attach_media(&session, transport.clone());
            });
            if attached.is_none() {
                return;
            }
            session.send(OutboundMessage::mix(ctx.mix.current()));
            ctx.tracker.watch(session.clone(), epoch, transport, token);
            tracing::info!("Session {} answered (epoch {})", session.id(), epoch);
        }
        Err(e) => fail_round(&ctx, &session, epoch, e),
    }
}

/// Tear the session down after a failure in `epoch`, unless it has moved on
fn fail_round(ctx: &SignalingContext, session: &Arc<Session>, epoch: u64, e: TransportError) {
    if !session.fail(epoch) {
        return;
    }
    tracing::error!("Session {}: negotiation failed: {}", session.id(), e);
    session.send(OutboundMessage::error(format!("negotiation failed: {}", e)));
    ctx.registry.remove(session.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::AudioEngine;
    use crate::audio::params::MixParameters;
    use crate::config::AudioConfig;
    use crate::transport::{Connectivity, MemoryPeerFactory};

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=recvonly\r\n";

    struct Harness {
        ctx: SignalingContext,
        factory: Arc<MemoryPeerFactory>,
    }

    fn harness() -> Harness {
        let engine = AudioEngine::new(&AudioConfig::default(), Arc::new(MixParameters::default()));
        let registry = Arc::new(SessionRegistry::new(engine));
        let factory = Arc::new(MemoryPeerFactory::new());
        let ctx = SignalingContext::new(registry, factory.clone(), Duration::from_millis(5), true);
        Harness { ctx, factory }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_offer_is_acked_then_answered() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);

        endpoint
            .handle_text(&serde_json::json!({"type": "offer", "sdp": OFFER}).to_string())
            .await;

        assert_eq!(next(&mut rx).await, OutboundMessage::ack("offer-received"));
        assert!(matches!(next(&mut rx).await, OutboundMessage::Answer { .. }));
        assert!(matches!(next(&mut rx).await, OutboundMessage::Mix { .. }));

        let session = endpoint.session().unwrap();
        assert_eq!(session.state(), SessionState::AnsweredPending);
        assert!(h.ctx.registry.engine().is_tapped(session.id()));
    }

    #[tokio::test]
    async fn test_ping_without_session() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Microphone, tx);

        endpoint.handle_text(r#"{"type":"ping","t":123}"#).await;
        match next(&mut rx).await {
            OutboundMessage::Pong { t, .. } => assert_eq!(t, serde_json::json!(123)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(endpoint.session().is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_binary_get_error_notice() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);

        endpoint.handle_text("definitely not json").await;
        assert!(matches!(next(&mut rx).await, OutboundMessage::Error { .. }));
        endpoint.reject_binary();
        assert!(matches!(next(&mut rx).await, OutboundMessage::Error { .. }));
        assert!(endpoint.session().is_none());
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_ignored() {
        let h = harness();
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);

        endpoint
            .handle_text(r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}"#)
            .await;
        assert!(endpoint.session().is_none());
        assert!(h.factory.peers().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_negotiation_never_answers() {
        let h = harness();
        h.factory.set_answer_delay(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);

        endpoint
            .handle_text(&serde_json::json!({"type": "offer", "sdp": OFFER}).to_string())
            .await;
        assert_eq!(next(&mut rx).await, OutboundMessage::ack("offer-received"));
        endpoint.shutdown();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.ctx.registry.engine().tap_count(), 0);
        assert!(h.factory.peers().iter().all(|p| p.is_closed()));
    }

    #[tokio::test]
    async fn test_pump_stays_responsive_while_transport_builds() {
        let h = harness();
        h.factory.set_create_delay(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);

        endpoint
            .handle_text(&serde_json::json!({"type": "offer", "sdp": OFFER}).to_string())
            .await;
        assert_eq!(next(&mut rx).await, OutboundMessage::ack("offer-received"));

        endpoint.handle_text(r#"{"type":"ping","t":1}"#).await;
        assert!(matches!(next(&mut rx).await, OutboundMessage::Pong { .. }));
        assert!(h.factory.peers().is_empty());

        let line = "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host";
        endpoint
            .handle_text(&serde_json::json!({"candidate": line, "sdpMid": "0", "sdpMLineIndex": 0}).to_string())
            .await;
        assert_eq!(endpoint.session().unwrap().candidate_count(), 1);

        assert!(matches!(next(&mut rx).await, OutboundMessage::Answer { .. }));
        let peer = h.factory.last().unwrap();
        let applied = peer.remote_candidates();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].candidate, line);
    }

    #[tokio::test]
    async fn test_remote_mix_can_be_disabled() {
        let mut h = harness();
        h.ctx.accept_remote_mix = false;
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);

        endpoint.handle_text(r#"{"type":"mix","alpha":0.9}"#).await;
        assert_eq!(h.ctx.mix.current().alpha, 0.0);
    }

    #[tokio::test]
    async fn test_connected_session_counts() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = h.ctx.endpoint(Feed::Program, tx);
        endpoint
            .handle_text(&serde_json::json!({"type": "offer", "sdp": OFFER}).to_string())
            .await;
        next(&mut rx).await;
        next(&mut rx).await;

        h.factory.last().unwrap().set_connectivity(Connectivity::Connected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.ctx.registry.listeners(), 1);

        endpoint.shutdown();
        assert_eq!(h.ctx.registry.listeners(), 0);
    }
}
