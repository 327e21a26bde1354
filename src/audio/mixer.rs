//! Gain law and output routing
//!
//! Shared by the server engine and [`crate::client::ClientMixer`], so both
//! sides reach the same routing decision from the same [`MixSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::audio::params::{clamp_alpha, MixSnapshot};

/// The two logical sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Microphone,
    Player,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Microphone => "microphone",
            SourceKind::Player => "player",
        }
    }
}

/// Per-bus linear gains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub mic: f32,
    pub player: f32,
}

impl Gains {
    pub fn from_mix(mix: MixSnapshot) -> Self {
        let player = clamp_alpha(mix.alpha);
        let mic = if mix.mic_muted { 0.0 } else { 1.0 - player };
        Self { mic, player }
    }

    pub fn for_source(&self, kind: SourceKind) -> f32 {
        match kind {
            SourceKind::Microphone => self.mic,
            SourceKind::Player => self.player,
        }
    }
}

/// Which output a listener is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A single bus, no blending
    Direct(SourceKind),
    /// Both buses blended by [`Gains`]
    Mixed,
}

impl Route {
    fn code(self) -> u8 {
        match self {
            Route::Direct(SourceKind::Microphone) => 1,
            Route::Direct(SourceKind::Player) => 2,
            Route::Mixed => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Route::Direct(SourceKind::Microphone)),
            2 => Some(Route::Direct(SourceKind::Player)),
            3 => Some(Route::Mixed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Direct(kind) => write!(f, "direct:{}", kind.as_str()),
            Route::Mixed => f.write_str("mixed"),
        }
    }
}

/// Mixed only when both sources are attached and blending is actually
/// requested (mic muted, or some player weight). Otherwise the single
/// attached source, preferring the microphone.
pub fn resolve_route(mix: MixSnapshot, mic_attached: bool, player_attached: bool) -> Route {
    if mic_attached && player_attached && (mix.mic_muted || mix.alpha > 0.0) {
        Route::Mixed
    } else if player_attached && !mic_attached {
        Route::Direct(SourceKind::Player)
    } else {
        Route::Direct(SourceKind::Microphone)
    }
}

/// Debounced route holder: re-selecting the current route is a no-op.
#[derive(Debug, Default)]
pub struct RouteSelector {
    current: AtomicU8,
    switches: AtomicU64,
}

impl RouteSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the output at `route`. Returns `true` only when it changed.
    pub fn select(&self, route: Route) -> bool {
        let code = route.code();
        let previous = self.current.swap(code, Ordering::AcqRel);
        if previous == code {
            return false;
        }
        self.switches.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn current(&self) -> Option<Route> {
        Route::from_code(self.current.load(Ordering::Acquire))
    }

    /// Number of effective re-routes so far
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }
}

/// `out = src * gain`, saturating
pub fn apply_gain(src: &[i16], gain: f32, out: &mut [i16]) {
    for (o, s) in out.iter_mut().zip(src) {
        *o = to_i16(f32::from(*s) * gain);
    }
}

/// `out = mic * gains.mic + player * gains.player`, saturating
pub fn mix_into(mic: &[i16], player: &[i16], gains: Gains, out: &mut [i16]) {
    for ((o, m), p) in out.iter_mut().zip(mic).zip(player) {
        *o = to_i16(f32::from(*m) * gains.mic + f32::from(*p) * gains.player);
    }
}

#[inline]
fn to_i16(v: f32) -> i16 {
    v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scenario_mic_only() {
        let mix = MixSnapshot::new(0.0, false);
        assert_eq!(
            resolve_route(mix, true, true),
            Route::Direct(SourceKind::Microphone)
        );
        let gains = Gains::from_mix(mix);
        assert_eq!((gains.mic, gains.player), (1.0, 0.0));
    }

    #[test]
    fn test_scenario_half_blend() {
        let mix = MixSnapshot::new(0.5, false);
        assert_eq!(resolve_route(mix, true, true), Route::Mixed);
        let gains = Gains::from_mix(mix);
        assert_eq!((gains.mic, gains.player), (0.5, 0.5));
    }

    #[test]
    fn test_scenario_muted_forces_mixed() {
        let mix = MixSnapshot::new(0.0, true);
        assert_eq!(resolve_route(mix, true, true), Route::Mixed);
        let gains = Gains::from_mix(mix);
        assert_eq!((gains.mic, gains.player), (0.0, 0.0));
    }

    #[test]
    fn test_single_source_is_direct() {
        let mix = MixSnapshot::new(0.8, true);
        assert_eq!(
            resolve_route(mix, false, true),
            Route::Direct(SourceKind::Player)
        );
        assert_eq!(
            resolve_route(mix, true, false),
            Route::Direct(SourceKind::Microphone)
        );
        assert_eq!(
            resolve_route(mix, false, false),
            Route::Direct(SourceKind::Microphone)
        );
    }

    #[test]
    fn test_selector_debounces() {
        let selector = RouteSelector::new();
        assert_eq!(selector.current(), None);
        assert!(selector.select(Route::Mixed));
        assert!(!selector.select(Route::Mixed));
        assert!(!selector.select(Route::Mixed));
        assert!(selector.select(Route::Direct(SourceKind::Player)));
        assert_eq!(selector.switch_count(), 2);
        assert_eq!(selector.current(), Some(Route::Direct(SourceKind::Player)));
    }

    #[test]
    fn test_mix_saturates() {
        let mut out = [0i16; 2];
        mix_into(
            &[i16::MAX, i16::MIN],
            &[i16::MAX, i16::MIN],
            Gains { mic: 1.0, player: 1.0 },
            &mut out,
        );
        assert_eq!(out, [i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_apply_gain() {
        let mut out = [0i16; 3];
        apply_gain(&[100, -100, 0], 0.5, &mut out);
        assert_eq!(out, [50, -50, 0]);
    }

    #[test]
    fn test_route_display() {
        assert_eq!(Route::Mixed.to_string(), "mixed");
        assert_eq!(
            Route::Direct(SourceKind::Player).to_string(),
            "direct:player"
        );
    }

    proptest! {
        #[test]
        fn prop_gain_law(alpha in 0.0f32..=1.0, muted in any::<bool>()) {
            let gains = Gains::from_mix(MixSnapshot::new(alpha, muted));
            if muted {
                prop_assert_eq!(gains.mic, 0.0);
            } else {
                prop_assert!((gains.mic + gains.player - 1.0).abs() < 1e-6);
            }
            prop_assert_eq!(gains.player, alpha);
        }

        #[test]
        fn prop_routing_law(alpha in 0.0f32..=1.0, muted in any::<bool>(), mic in any::<bool>(), player in any::<bool>()) {
            let route = resolve_route(MixSnapshot::new(alpha, muted), mic, player);
            let expect_mixed = mic && player && (muted || alpha > 0.0);
            prop_assert_eq!(route == Route::Mixed, expect_mixed);

            let selector = RouteSelector::new();
            selector.select(route);
            prop_assert!(!selector.select(route));
        }
    }
}
