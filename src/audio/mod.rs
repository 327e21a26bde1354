//! Audio subsystem module

#[cfg(feature = "capture")]
pub mod capture;
pub mod engine;
pub mod mixer;
pub mod params;
pub mod player;
pub mod ring;

#[cfg(feature = "capture")]
pub use capture::MicCapture;
pub use engine::{AudioEngine, AudioFrame, Feed, FrameSink, SourceFeed};
pub use mixer::{Gains, Route, SourceKind};
pub use params::{MixParameters, MixSnapshot, MixUpdate};
pub use player::PcmFileFeeder;
pub use ring::{PcmConsumer, PcmProducer, PcmRingBuffer};
