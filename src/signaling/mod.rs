//! Listener signaling
//!
//! Wire normalization ([`message`]), the per-connection state machine
//! ([`endpoint`]) and live mix control ([`mix`]).

pub mod endpoint;
pub mod message;
pub mod mix;

pub use endpoint::{SignalingContext, SignalingEndpoint};
pub use message::{normalize, InboundMessage, OutboundMessage};
pub use mix::MixController;
