//! WebSocket signaling server
//!
//! One task per accepted connection. Each connection owns exactly one peer in
//! the shared [`SessionRegistry`](crate::registry::SessionRegistry), created on
//! accept and destroyed on close.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use connection::Connection;
pub use listener::RecorderServer;
