//! HTTP and signaling socket front end

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::WebServer;
