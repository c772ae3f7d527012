//! HTTP and WebSocket surface of the relay

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, RelayServer};
