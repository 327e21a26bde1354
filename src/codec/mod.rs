//! Opus codec wrapper for the WebRTC transport

pub mod encoder;

pub use encoder::OpusEncoder;
