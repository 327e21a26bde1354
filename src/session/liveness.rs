//! Listener liveness
//!
//! One poller per negotiation epoch samples transport connectivity on a
//! fixed interval. The first connected sample counts the listener; a failed
//! or closed sample removes the session, fenced by epoch so a superseded
//! poller can never tear down a renegotiated session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::{Session, SessionRegistry};
use crate::transport::{Connectivity, PeerTransport};

/// Number of counted listeners. Never goes below zero.
#[derive(Debug, Default)]
pub struct ListenerCount(AtomicUsize);

impl ListenerCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturating decrement; returns the new value
    pub fn decrement(&self) -> usize {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                tracing::warn!("Listener count decrement below zero ignored");
                0
            }
        }
    }
}

/// Spawns connectivity pollers
#[derive(Clone)]
pub struct LivenessTracker {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl LivenessTracker {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `transport` until the round is cancelled or the transport dies
    pub fn watch(
        &self,
        session: Arc<Session>,
        epoch: u64,
        transport: Arc<dyn PeerTransport>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match transport.connectivity() {
                    Connectivity::Connected => {
                        match session.mark_connected(epoch, registry.listener_count()) {
                            Ok(true) => tracing::info!(
                                "Session {} connected ({} listeners)",
                                session.id(),
                                registry.listeners()
                            ),
                            Ok(false) => {}
                            Err(e) => {
                                tracing::debug!("Poller for session {} stopping: {}", session.id(), e);
                                break;
                            }
                        }
                    }
                    state if state.is_terminal() => {
                        tracing::info!(
                            "Session {} transport {:?}, removing",
                            session.id(),
                            state
                        );
                        registry.remove_if_epoch(session.id(), epoch);
                        break;
                    }
                    _ => {}
                }
            }
        })
    }
}
