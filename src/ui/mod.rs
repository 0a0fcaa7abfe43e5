//! Local control channel

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::WebServer;
