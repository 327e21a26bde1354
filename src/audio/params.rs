//! Process-wide mix parameters
//!
//! `alpha` and `mic_muted` live in one `AtomicU64` so readers on the audio
//! thread always see a consistent pair, never alpha from one update and the
//! mute flag from another.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const MUTE_BIT: u64 = 1 << 32;

/// Immutable copy of the mix state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixSnapshot {
    /// Crossfade weight toward the player bus, 0 = all microphone
    pub alpha: f32,
    #[serde(rename = "micMuted")]
    pub mic_muted: bool,
}

impl Default for MixSnapshot {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            mic_muted: false,
        }
    }
}

impl MixSnapshot {
    pub fn new(alpha: f32, mic_muted: bool) -> Self {
        Self {
            alpha: clamp_alpha(alpha),
            mic_muted,
        }
    }

    fn pack(self) -> u64 {
        let mute = if self.mic_muted { MUTE_BIT } else { 0 };
        mute | u64::from(self.alpha.to_bits())
    }

    fn unpack(word: u64) -> Self {
        Self {
            alpha: f32::from_bits(word as u32),
            mic_muted: word & MUTE_BIT != 0,
        }
    }
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct MixUpdate {
    pub alpha: Option<f32>,
    #[serde(rename = "micMuted")]
    pub mic_muted: Option<bool>,
}

/// Clamp to [0, 1]; NaN counts as 0
pub fn clamp_alpha(alpha: f32) -> f32 {
    if alpha.is_nan() {
        0.0
    } else {
        alpha.clamp(0.0, 1.0)
    }
}

/// Shared, lock-free mix state
#[derive(Debug)]
pub struct MixParameters {
    word: AtomicU64,
}

impl Default for MixParameters {
    fn default() -> Self {
        Self::new(MixSnapshot::default())
    }
}

impl MixParameters {
    pub fn new(initial: MixSnapshot) -> Self {
        Self {
            word: AtomicU64::new(MixSnapshot::new(initial.alpha, initial.mic_muted).pack()),
        }
    }

    pub fn snapshot(&self) -> MixSnapshot {
        MixSnapshot::unpack(self.word.load(Ordering::Acquire))
    }

    /// Replace both fields at once
    pub fn store(&self, alpha: f32, mic_muted: bool) -> MixSnapshot {
        let next = MixSnapshot::new(alpha, mic_muted);
        self.word.store(next.pack(), Ordering::Release);
        next
    }

    /// Apply a partial update atomically and return the resulting state
    pub fn apply(&self, update: MixUpdate) -> MixSnapshot {
        let mut result = self.snapshot();
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let current = MixSnapshot::unpack(word);
                result = MixSnapshot::new(
                    update.alpha.unwrap_or(current.alpha),
                    update.mic_muted.unwrap_or(current.mic_muted),
                );
                Some(result.pack())
            });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_mic_only() {
        let params = MixParameters::default();
        assert_eq!(params.snapshot(), MixSnapshot::new(0.0, false));
    }

    #[test]
    fn test_store_clamps() {
        let params = MixParameters::default();
        assert_eq!(params.store(1.7, true).alpha, 1.0);
        assert_eq!(params.store(-0.3, false).alpha, 0.0);
        assert_eq!(params.store(f32::NAN, false).alpha, 0.0);
    }

    #[test]
    fn test_partial_update_keeps_other_field() {
        let params = MixParameters::new(MixSnapshot::new(0.25, false));
        let after = params.apply(MixUpdate {
            alpha: None,
            mic_muted: Some(true),
        });
        assert_eq!(after, MixSnapshot::new(0.25, true));

        let after = params.apply(MixUpdate {
            alpha: Some(0.75),
            mic_muted: None,
        });
        assert_eq!(after, MixSnapshot::new(0.75, true));
        assert_eq!(params.snapshot(), after);
    }

    #[test]
    fn test_concurrent_updates_never_tear() {
        use std::sync::Arc;

        let params = Arc::new(MixParameters::default());
        let writer = {
            let params = params.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    // muted exactly when alpha is 1.0
                    if i % 2 == 0 {
                        params.store(1.0, true);
                    } else {
                        params.store(0.0, false);
                    }
                }
            })
        };
        for _ in 0..10_000 {
            let snap = params.snapshot();
            assert_eq!(snap.mic_muted, snap.alpha == 1.0);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(MixSnapshot::new(0.5, true)).unwrap();
        assert_eq!(json["micMuted"], true);
        assert_eq!(json["alpha"], 0.5);
    }
}
