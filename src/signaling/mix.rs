//! Live mix control
//!
//! Single entry point for changing [`MixParameters`], whether the change comes
//! from the local HTTP API or from a listener's `mix` message. Every accepted
//! change re-resolves the engine route and is broadcast to all sessions so
//! listener-side mixers follow.
//!
//! [`MixParameters`]: crate::audio::params::MixParameters

use std::sync::Arc;

use crate::audio::params::{MixSnapshot, MixUpdate};
use crate::session::SessionRegistry;
use crate::signaling::message::OutboundMessage;

pub struct MixController {
    registry: Arc<SessionRegistry>,
}

impl MixController {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn current(&self) -> MixSnapshot {
        self.registry.engine().params().snapshot()
    }

    /// Apply, re-route, broadcast. Returns the state now in effect.
    pub fn apply(&self, update: MixUpdate) -> MixSnapshot {
        let engine = self.registry.engine();
        let snapshot = engine.params().apply(update);
        let route = engine.refresh_route();
        let sent = self.registry.broadcast(&OutboundMessage::mix(snapshot));
        tracing::info!(
            "Mix set to alpha={:.2} micMuted={} (route {}, told {} sessions)",
            snapshot.alpha,
            snapshot.mic_muted,
            route,
            sent
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::{AudioEngine, Feed};
    use crate::audio::mixer::{Route, SourceKind};
    use crate::audio::params::MixParameters;
    use crate::config::AudioConfig;
    use crate::session::ConnId;
    use tokio::sync::mpsc;

    #[test]
    fn test_apply_reroutes_and_broadcasts() {
        let engine = AudioEngine::new(&AudioConfig::default(), Arc::new(MixParameters::default()));
        let _mic = engine.take_source(SourceKind::Microphone).unwrap();
        let _player = engine.take_source(SourceKind::Player).unwrap();
        let registry = Arc::new(SessionRegistry::new(engine.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.create(ConnId::new(), Feed::Program, tx);

        let mix = MixController::new(registry);
        let snap = mix.apply(MixUpdate {
            alpha: Some(2.0),
            mic_muted: None,
        });
        assert_eq!(snap, MixSnapshot::new(1.0, false));
        assert_eq!(engine.current_route(), Some(Route::Mixed));
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::Mix {
                alpha: 1.0,
                mic_muted: false
            }
        );

        mix.apply(MixUpdate {
            alpha: Some(0.0),
            mic_muted: Some(false),
        });
        assert_eq!(
            engine.current_route(),
            Some(Route::Direct(SourceKind::Microphone))
        );
    }
}
