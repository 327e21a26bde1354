//! Listener-side mixer
//!
//! A listener that subscribes to the raw microphone and player feeds blends
//! them itself. [`ClientMixer`] follows the server's `mix` broadcasts and
//! applies the same gain law and routing rule the engine uses, so a local
//! blend sounds like the server's program feed.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::audio::mixer::{resolve_route, Gains, Route, RouteSelector, SourceKind};
use crate::audio::params::{MixParameters, MixSnapshot, MixUpdate};
use crate::error::SignalingError;
use crate::signaling::message::{normalize, InboundMessage};

#[derive(Debug, Default)]
pub struct ClientMixer {
    params: MixParameters,
    mic: AtomicBool,
    player: AtomicBool,
    selector: RouteSelector,
}

impl ClientMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote track for `kind` started playing
    pub fn attach_track(&self, kind: SourceKind) -> Route {
        self.flag(kind).store(true, Ordering::Release);
        self.refresh()
    }

    /// The remote track for `kind` ended
    pub fn detach_track(&self, kind: SourceKind) -> Route {
        self.flag(kind).store(false, Ordering::Release);
        self.refresh()
    }

    pub fn has_track(&self, kind: SourceKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }

    /// Feed one signaling text frame. Returns `true` if it changed the mix.
    pub fn handle_server_message(&self, text: &str) -> Result<bool, SignalingError> {
        match normalize(text)? {
            InboundMessage::Mix(update) => {
                self.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn apply(&self, update: MixUpdate) -> MixSnapshot {
        let snapshot = self.params.apply(update);
        self.refresh();
        snapshot
    }

    pub fn mix(&self) -> MixSnapshot {
        self.params.snapshot()
    }

    pub fn gains(&self) -> Gains {
        Gains::from_mix(self.params.snapshot())
    }

    pub fn route(&self) -> Option<Route> {
        self.selector.current()
    }

    pub fn switch_count(&self) -> u64 {
        self.selector.switch_count()
    }

    /// Render one block. Missing samples in either input count as silence.
    pub fn render(&self, mic: &[f32], player: &[f32], out: &mut [f32]) {
        let mix = self.params.snapshot();
        let gains = Gains::from_mix(mix);
        let route = self.resolve(mix);

        for (i, o) in out.iter_mut().enumerate() {
            let m = mic.get(i).copied().unwrap_or(0.0);
            let p = player.get(i).copied().unwrap_or(0.0);
            let v = match route {
                Route::Mixed => m * gains.mic + p * gains.player,
                Route::Direct(SourceKind::Microphone) => m * gains.mic,
                Route::Direct(SourceKind::Player) => p * gains.player,
            };
            *o = v.clamp(-1.0, 1.0);
        }
    }

    fn resolve(&self, mix: MixSnapshot) -> Route {
        resolve_route(
            mix,
            self.has_track(SourceKind::Microphone),
            self.has_track(SourceKind::Player),
        )
    }

    fn refresh(&self) -> Route {
        let route = self.resolve(self.params.snapshot());
        if self.selector.select(route) {
            tracing::debug!("Listener output routed to {}", route);
        }
        route
    }

    fn flag(&self, kind: SourceKind) -> &AtomicBool {
        match kind {
            SourceKind::Microphone => &self.mic,
            SourceKind::Player => &self.player,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> ClientMixer {
        let mixer = ClientMixer::new();
        mixer.attach_track(SourceKind::Microphone);
        mixer.attach_track(SourceKind::Player);
        mixer
    }

    #[test]
    fn test_follows_server_mix_messages() {
        let mixer = both();
        assert_eq!(mixer.route(), Some(Route::Direct(SourceKind::Microphone)));

        assert!(mixer
            .handle_server_message(r#"{"type":"mix","alpha":0.5,"micMuted":false}"#)
            .unwrap());
        assert_eq!(mixer.route(), Some(Route::Mixed));
        assert_eq!(mixer.gains(), Gains { mic: 0.5, player: 0.5 });

        assert!(!mixer.handle_server_message(r#"{"type":"pong","t":1,"ts":2}"#).unwrap());
        assert!(mixer.handle_server_message("garbage").is_err());
    }

    #[test]
    fn test_mix_table() {
        let mixer = both();
        let cases = [
            (0.0, false, Route::Direct(SourceKind::Microphone), 1.0, 0.0),
            (0.5, false, Route::Mixed, 0.5, 0.5),
            (0.0, true, Route::Mixed, 0.0, 0.0),
            (1.0, false, Route::Mixed, 0.0, 1.0),
        ];
        for (alpha, muted, route, mic, player) in cases {
            mixer.apply(MixUpdate {
                alpha: Some(alpha),
                mic_muted: Some(muted),
            });
            assert_eq!(mixer.route(), Some(route));
            assert_eq!(mixer.gains(), Gains { mic, player });
        }
    }

    #[test]
    fn test_repeated_updates_do_not_reroute() {
        let mixer = both();
        let update = MixUpdate {
            alpha: Some(0.3),
            mic_muted: None,
        };
        mixer.apply(update);
        let switches = mixer.switch_count();
        mixer.apply(update);
        mixer.apply(update);
        assert_eq!(mixer.switch_count(), switches);
    }

    #[test]
    fn test_render_blends_and_clamps() {
        let mixer = both();
        mixer.apply(MixUpdate {
            alpha: Some(0.25),
            mic_muted: Some(false),
        });
        let mut out = [0.0f32; 3];
        mixer.render(&[0.4, 1.0], &[0.8, 1.0], &mut out);
        assert!((out[0] - (0.4 * 0.75 + 0.8 * 0.25)).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_player_only_listener() {
        let mixer = ClientMixer::new();
        mixer.attach_track(SourceKind::Player);
        mixer.apply(MixUpdate {
            alpha: Some(1.0),
            mic_muted: Some(true),
        });
        assert_eq!(mixer.route(), Some(Route::Direct(SourceKind::Player)));

        let mut out = [0.0f32; 2];
        mixer.render(&[0.9, 0.9], &[0.5, -0.5], &mut out);
        assert_eq!(out, [0.5, -0.5]);

        mixer.detach_track(SourceKind::Player);
        assert_eq!(mixer.route(), Some(Route::Direct(SourceKind::Microphone)));
    }
}
